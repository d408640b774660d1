//! Scripted broker for SDK tests
//!
//! Accepts every link opened through the mock transports and answers Socket
//! commands the way the real server does. Tests can push stream data or
//! drop individual links.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use xapi_sdk::XapiClientBuilder;
use xapi_ws::{MockPeer, MockServer, MockTransport, SequentialIdGenerator};

pub const USER_ID: &str = "1234567";
pub const PASSWORD: &str = "secret";

pub const VERSION_REPLY: &str = r#"{"version":"2.5.0"}"#;

pub const BAD_LOGIN_CODE: &str = "BE005";

/// Sample candle push
pub const CANDLE_PUSH: &str = r#"{"command":"candle","data":{"close":4.1,"ctm":1378369375000,"ctmString":"Sep 05, 2013 10:22:55 AM","high":4.3,"low":3.9,"open":4.0,"quoteId":2,"symbol":"EURUSD","vol":0.0}}"#;

/// Route client logs to the test harness; `RUST_LOG` narrows them
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum PeerCommand {
    Push(String),
    Drop,
}

#[derive(Default)]
struct BrokerState {
    logins: AtomicUsize,
    socket_frames: Mutex<Vec<Value>>,
    stream_frames: Mutex<Vec<Value>>,
    socket_links: Mutex<Vec<mpsc::UnboundedSender<PeerCommand>>>,
    stream_links: Mutex<Vec<mpsc::UnboundedSender<PeerCommand>>>,
}

/// Fake xAPI server behind two mock transports
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<BrokerState>,
    socket: MockTransport,
    stream: MockTransport,
}

impl FakeBroker {
    pub fn start() -> Self {
        init_logging();
        let state = Arc::new(BrokerState::default());
        let (socket, socket_server) = MockTransport::new("wss://broker.test/demo");
        let (stream, stream_server) = MockTransport::new("wss://broker.test/demoStream");
        tokio::spawn(accept_socket(socket_server, state.clone()));
        tokio::spawn(accept_stream(stream_server, state.clone()));
        Self {
            state,
            socket,
            stream,
        }
    }

    /// Builder wired to this broker with deterministic ids
    pub fn builder(&self) -> XapiClientBuilder {
        XapiClientBuilder::new()
            .with_credentials(USER_ID, PASSWORD)
            .with_app_name("sdk-tests")
            .with_transports(Arc::new(self.socket.clone()), Arc::new(self.stream.clone()))
            .with_id_generator(Arc::new(SequentialIdGenerator::new("c")))
    }

    pub fn socket_transport(&self) -> &MockTransport {
        &self.socket
    }

    pub fn stream_transport(&self) -> &MockTransport {
        &self.stream
    }

    pub fn logins(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    pub fn socket_frames(&self) -> Vec<Value> {
        self.state.socket_frames.lock().clone()
    }

    pub fn stream_frames(&self) -> Vec<Value> {
        self.state.stream_frames.lock().clone()
    }

    /// Drop the n-th Socket link ever opened
    pub fn drop_socket(&self, index: usize) {
        if let Some(link) = self.state.socket_links.lock().get(index) {
            let _ = link.send(PeerCommand::Drop);
        }
    }

    /// Drop the n-th Stream link ever opened
    pub fn drop_stream(&self, index: usize) {
        if let Some(link) = self.state.stream_links.lock().get(index) {
            let _ = link.send(PeerCommand::Drop);
        }
    }

    /// Push a frame on the n-th Stream link
    pub fn push_stream(&self, index: usize, frame: &str) {
        if let Some(link) = self.state.stream_links.lock().get(index) {
            let _ = link.send(PeerCommand::Push(frame.to_string()));
        }
    }
}

/// Advance paused time in small steps until `condition` holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 10 s");
}

async fn accept_socket(mut server: MockServer, state: Arc<BrokerState>) {
    while let Some(peer) = server.accept().await {
        let (tx, rx) = mpsc::unbounded_channel();
        state.socket_links.lock().push(tx);
        tokio::spawn(serve_socket(peer, rx, state.clone()));
    }
}

async fn accept_stream(mut server: MockServer, state: Arc<BrokerState>) {
    while let Some(peer) = server.accept().await {
        let (tx, rx) = mpsc::unbounded_channel();
        state.stream_links.lock().push(tx);
        tokio::spawn(serve_stream(peer, rx, state.clone()));
    }
}

async fn serve_socket(
    mut peer: MockPeer,
    mut control: mpsc::UnboundedReceiver<PeerCommand>,
    state: Arc<BrokerState>,
) {
    loop {
        tokio::select! {
            frame = peer.recv_frame() => {
                let Some(frame) = frame else { return };
                let request: Value = serde_json::from_str(&frame).unwrap();
                state.socket_frames.lock().push(request.clone());
                peer.push(answer(&request, &state).to_string());
            }
            command = control.recv() => match command {
                Some(PeerCommand::Push(text)) => {
                    peer.push(text);
                }
                Some(PeerCommand::Drop) | None => return,
            },
        }
    }
}

async fn serve_stream(
    mut peer: MockPeer,
    mut control: mpsc::UnboundedReceiver<PeerCommand>,
    state: Arc<BrokerState>,
) {
    loop {
        tokio::select! {
            frame = peer.recv_frame() => {
                let Some(frame) = frame else { return };
                state.stream_frames.lock().push(serde_json::from_str(&frame).unwrap());
            }
            command = control.recv() => match command {
                Some(PeerCommand::Push(text)) => {
                    peer.push(text);
                }
                Some(PeerCommand::Drop) | None => return,
            },
        }
    }
}

fn answer(request: &Value, state: &BrokerState) -> Value {
    let tag = request["customTag"].clone();
    match request["command"].as_str() {
        Some("login") => {
            if request["arguments"]["password"] == PASSWORD {
                let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
                json!({"status": true, "streamSessionId": format!("session-{n}"), "customTag": tag})
            } else {
                json!({
                    "status": false,
                    "errorCode": BAD_LOGIN_CODE,
                    "errorDescr": "userPasswordCheck: Invalid login or password",
                    "customTag": tag,
                })
            }
        }
        Some("getVersion") => json!({
            "status": true,
            "returnData": serde_json::from_str::<Value>(VERSION_REPLY).unwrap(),
            "customTag": tag,
        }),
        Some("ping") | Some("logout") => json!({"status": true, "customTag": tag}),
        _ => json!({
            "status": false,
            "errorCode": "EX007",
            "errorDescr": "Unknown command",
            "customTag": tag,
        }),
    }
}
