use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Stand-in for secrets in anything that leaves the process.
pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Userpass,
    Creds,
}

/// Reconnect behaviour attached to a connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    #[serde(alias = "reconnect")]
    pub auto_reconnect: bool,
    #[serde(alias = "maxReconnectAttempts")]
    pub max_attempts: u32,
    #[serde(alias = "reconnectTimeWait")]
    pub backoff_ms: u64,
    pub auto_reconnect_on_startup: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 10,
            backoff_ms: 2000,
            auto_reconnect_on_startup: false,
        }
    }
}

/// Everything needed to reach and authenticate with a broker.
///
/// `Debug` output redacts the password and credential blob.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub creds_content: String,
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: Some("New Connection".to_string()),
            servers: vec!["ws://localhost:8080".to_string()],
            auth_type: AuthType::None,
            username: String::new(),
            password: String::new(),
            creds_content: String::new(),
            options: ConnectionOptions::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_userpass(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth_type = AuthType::Userpass;
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_creds(mut self, creds_content: impl Into<String>) -> Self {
        self.auth_type = AuthType::Creds;
        self.creds_content = creds_content.into();
        self
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// True when a secret this config's auth type needs was redacted on save.
    pub fn has_redacted_credentials(&self) -> bool {
        match self.auth_type {
            AuthType::None => false,
            AuthType::Userpass => self.password == REDACTED,
            AuthType::Creds => self.creds_content == REDACTED,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sanitized = sanitize(self);
        f.debug_struct("ConnectionConfig")
            .field("name", &sanitized.name)
            .field("servers", &sanitized.servers)
            .field("auth_type", &sanitized.auth_type)
            .field("username", &sanitized.username)
            .field("password", &sanitized.password)
            .field("creds_content", &sanitized.creds_content)
            .field("options", &sanitized.options)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Checks a configuration without connecting. Non-`ws`/`wss` schemes only
/// produce warnings.
pub fn validate(config: &ConnectionConfig) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.servers.is_empty() {
        errors.push("At least one server URL is required".to_string());
    }

    for (index, server) in config.servers.iter().enumerate() {
        match Url::parse(server) {
            Ok(url) if !matches!(url.scheme(), "ws" | "wss") => warnings.push(format!(
                "Server {}: Consider using ws:// or wss:// protocol",
                index + 1
            )),
            Ok(_) => {}
            Err(_) => errors.push(format!("Server {}: Invalid URL format", index + 1)),
        }
    }

    match config.auth_type {
        AuthType::Userpass => {
            if config.username.trim().is_empty() {
                errors.push("Username is required for user/password authentication".to_string());
            }
            if config.password.trim().is_empty() {
                errors.push("Password is required for user/password authentication".to_string());
            }
        }
        AuthType::Creds => {
            if config.creds_content.trim().is_empty() {
                errors.push(
                    "Credentials content is required for credentials authentication".to_string(),
                );
            }
        }
        AuthType::None => {}
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Copy of `config` with the password and credential blob replaced.
/// Empty secrets stay empty.
pub fn sanitize(config: &ConnectionConfig) -> ConnectionConfig {
    let mut sanitized = config.clone();
    if !sanitized.password.is_empty() {
        sanitized.password = REDACTED.to_string();
    }
    if !sanitized.creds_content.is_empty() {
        sanitized.creds_content = REDACTED.to_string();
    }
    sanitized
}
