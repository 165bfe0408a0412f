//! Shared helpers for the end-to-end tests: a real server on an ephemeral
//! loopback port and a client pointed at it.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use smtp_simulator::client::SmtpClient;
use smtp_simulator::config::{ClientConfig, Credentials, ServerConfig};
use smtp_simulator::mailbox::Mailbox;
use smtp_simulator::server::{ServerHandle, SmtpServer};
use smtp_simulator::utils::Logger;

pub const BUDGET: Duration = Duration::from_secs(10);

pub struct TestServer {
    pub handle: ServerHandle,
    pub mailbox: Mailbox,
}

impl TestServer {
    pub async fn start(name: &str, credentials: Option<Credentials>) -> Self {
        let mut config = Self::config(name);
        if let Some(credentials) = credentials {
            config = config.credentials(credentials);
        }
        Self::start_with(config).await
    }

    /// Loopback config on an ephemeral port.
    pub fn config(name: &str) -> ServerConfig {
        ServerConfig::new(name).address("127.0.0.1").port(0)
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let mailbox = Mailbox::new();
        let handle = SmtpServer::new(config, mailbox.clone(), Arc::new(Logger::stdout()))
            .expect("server config")
            .start()
            .await
            .expect("bind test server");
        Self { handle, mailbox }
    }

    pub fn port(&self) -> u16 {
        self.handle.local_addr().port()
    }

    pub fn client(&self, credentials: Option<Credentials>) -> SmtpClient {
        let mut config = ClientConfig::new("127.0.0.1").port(self.port());
        if let Some(credentials) = credentials {
            config = config.credentials(credentials);
        }
        SmtpClient::start(config, Arc::new(Logger::stdout()))
    }

    pub async fn shutdown(self) {
        self.handle.stop();
        self.handle.join().await;
    }
}
