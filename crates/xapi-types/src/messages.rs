//! Wire frames for the xAPI Socket and Stream channels

use crate::error::{XapiError, XapiResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Outbound
// ============================================================================

/// Outbound request frame
///
/// `streamSessionId` is only present on the Stream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    /// Wire command name
    pub command: String,
    /// Command arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Correlation tag, `{command}_{transactionId}`
    pub custom_tag: String,
    /// Session binding for streaming requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_session_id: Option<String>,
}

impl RequestFrame {
    /// Create a frame without arguments
    pub fn new(command: impl Into<String>, custom_tag: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: None,
            custom_tag: custom_tag.into(),
            stream_session_id: None,
        }
    }

    /// Attach arguments; `null` is treated as absent
    pub fn with_arguments(mut self, arguments: Option<Value>) -> Self {
        self.arguments = arguments.filter(|v| !v.is_null());
        self
    }

    /// Attach the stream session id
    pub fn with_stream_session(mut self, session: Option<String>) -> Self {
        self.stream_session_id = session;
        self
    }

    /// Serialize to the exact text that goes on the wire
    pub fn to_json(&self) -> XapiResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `{status: true, returnData?, streamSessionId?, customTag?}`
    Success {
        return_data: Value,
        stream_session_id: Option<String>,
        custom_tag: Option<String>,
    },
    /// `{status: false, errorCode, errorDescr?, customTag?}`
    Error {
        code: String,
        description: Option<String>,
        custom_tag: Option<String>,
    },
    /// `{command, data}` pushed on the Stream channel
    StreamPush { command: String, data: Value },
}

impl InboundFrame {
    /// Parse raw frame text
    ///
    /// Anything that is not one of the three known shapes is a
    /// [`XapiError::Protocol`] carrying the raw text.
    pub fn parse(raw: &str) -> XapiResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| XapiError::protocol(format!("unparseable frame: {e}"), Some(raw.into())))?;
        Self::from_value(value).map_err(|message| XapiError::protocol(message, Some(raw.into())))
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = value else {
            return Err("frame is not a JSON object".into());
        };

        let custom_tag = match obj.remove("customTag") {
            None | Some(Value::Null) => None,
            Some(Value::String(tag)) => Some(tag),
            Some(other) => return Err(format!("customTag is not a string: {other}")),
        };

        match obj.remove("status") {
            Some(Value::Bool(true)) => Ok(Self::Success {
                return_data: obj.remove("returnData").unwrap_or(Value::Null),
                stream_session_id: obj
                    .remove("streamSessionId")
                    .and_then(|v| v.as_str().map(str::to_string)),
                custom_tag,
            }),
            Some(Value::Bool(false)) => {
                let code = match obj.remove("errorCode") {
                    Some(Value::String(code)) => code,
                    Some(Value::Number(code)) => code.to_string(),
                    _ => return Err("error frame without errorCode".into()),
                };
                Ok(Self::Error {
                    code,
                    description: obj
                        .remove("errorDescr")
                        .and_then(|v| v.as_str().map(str::to_string)),
                    custom_tag,
                })
            }
            Some(other) => Err(format!("status is not a boolean: {other}")),
            None => match (obj.remove("command"), obj.remove("data")) {
                (Some(Value::String(command)), Some(data)) => Ok(Self::StreamPush { command, data }),
                _ => Err("frame has neither status nor command/data".into()),
            },
        }
    }

    /// Correlation tag carried by the frame, if any
    pub fn custom_tag(&self) -> Option<&str> {
        match self {
            Self::Success { custom_tag, .. } | Self::Error { custom_tag, .. } => custom_tag.as_deref(),
            Self::StreamPush { .. } => None,
        }
    }
}

/// Successful reply delivered to the caller of `send`
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// `returnData` of the reply (`null` when absent)
    pub return_data: Value,
    /// Present on a login reply
    pub stream_session_id: Option<String>,
}

impl Response {
    /// Response with only a payload
    pub fn new(return_data: Value) -> Self {
        Self {
            return_data,
            stream_session_id: None,
        }
    }
}

/// Canonical text for a parameter set
///
/// Object keys come out sorted, so equal parameter sets always produce the
/// same key. `null` and `{}` both canonicalise to `{}`.
pub fn canonical_params(params: &Value) -> String {
    match params {
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}
