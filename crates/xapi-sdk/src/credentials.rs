//! Login credentials
//!
//! The password is held in a [`SecretString`], which zeroizes its memory on
//! drop and never shows up in `Debug` output.

use crate::builder::ConfigError;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::fmt;

/// Environment variable holding the account number
pub const USER_ID_ENV: &str = "XAPI_USER_ID";

/// Environment variable holding the password
pub const PASSWORD_ENV: &str = "XAPI_PASSWORD";

/// Account number and password for the `login` command
pub struct Credentials {
    user_id: String,
    password: SecretString,
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            user_id: self.user_id.clone(),
            password: SecretString::from(self.password.expose_secret().to_string()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Wrap an account number and password
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Read `XAPI_USER_ID` and `XAPI_PASSWORD`
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_id = std::env::var(USER_ID_ENV)
            .map_err(|_| ConfigError::EnvVarNotSet(USER_ID_ENV.to_string()))?;
        let password = std::env::var(PASSWORD_ENV)
            .map_err(|_| ConfigError::EnvVarNotSet(PASSWORD_ENV.to_string()))?;
        Ok(Self::new(user_id, password))
    }

    /// Account number
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub(crate) fn has_password(&self) -> bool {
        !self.password.expose_secret().is_empty()
    }

    /// Arguments of the `login` command
    pub(crate) fn login_arguments(&self, app_name: Option<&str>) -> Value {
        let mut arguments = json!({
            "userId": self.user_id,
            "password": self.password.expose_secret(),
        });
        if let Some(name) = app_name {
            arguments["appName"] = Value::String(name.to_string());
        }
        arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let credentials = Credentials::new("1234567", "hunter2");
        let shown = format!("{:?}", credentials);
        assert!(shown.contains("1234567"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_login_arguments() {
        let credentials = Credentials::new("1234567", "hunter2");
        assert_eq!(
            credentials.login_arguments(Some("probe")),
            json!({"userId": "1234567", "password": "hunter2", "appName": "probe"})
        );
        assert!(credentials.login_arguments(None).get("appName").is_none());
        assert!(credentials.clone().has_password());
    }
}
