use std::fmt;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 25;
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"(hidden)")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    pub port: u16,
    /// Present when the client must authenticate (EHLO + AUTH LOGIN).
    pub credentials: Option<Credentials>,
    pub reply_timeout: Duration,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: DEFAULT_PORT,
            credentials: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn needs_auth(&self) -> bool {
        self.credentials.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub name: String,
    /// Present when MAIL FROM requires a prior successful AUTH LOGIN.
    pub credentials: Option<Credentials>,
    pub command_timeout: Duration,
    pub max_connections_per_minute: Option<usize>,
    pub banner_delay: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            name: name.into(),
            credentials: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_connections_per_minute: None,
            banner_delay: Duration::ZERO,
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn max_connections_per_minute(mut self, max: usize) -> Self {
        self.max_connections_per_minute = Some(max);
        self
    }

    pub fn banner_delay(mut self, delay: Duration) -> Self {
        self.banner_delay = delay;
        self
    }

    pub fn needs_auth(&self) -> bool {
        self.credentials.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_password() {
        let config = ClientConfig::new("localhost").credentials(Credentials::new("bob", "secret"));
        let printed = format!("{:?}", config);
        assert!(printed.contains("bob"));
        assert!(!printed.contains("secret"));
    }
}
