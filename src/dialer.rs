//! Dialer: factory for client connections
//!
//! Each dialer owns its orchestrator, so several endpoints can coexist in
//! one process without sharing a polling loop. The module also carries the
//! socket-shaped convenience functions: [`dial`] and [`listen`] mirror the
//! usual two-line connect/serve setup.

use tokio::sync::mpsc;

use crate::client::ClientConn;
use crate::config::Config;
use crate::error::Result;
use crate::frame::FrameCipher;
use crate::orch::{self, ORCH_CHANNEL_SIZE};
use crate::server::Listener;

/// Factory for client connections to one endpoint.
pub struct Dialer {
    endpoint: String,
    cipher: FrameCipher,
    config: Config,
    orch_tx: mpsc::Sender<ClientConn>,
}

impl Dialer {
    /// A dialer for `address` with the key derived from `network` and
    /// default settings. Must be called within a tokio runtime.
    pub fn new(network: &str, address: &str) -> Self {
        Self::with_config(network, address, Config::default())
    }

    pub fn with_config(network: &str, address: &str, config: Config) -> Self {
        let endpoint = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}/")
        };
        let (orch_tx, orch_rx) = mpsc::channel(ORCH_CHANNEL_SIZE);
        tokio::spawn(orch::run(orch_rx));
        Self {
            endpoint,
            cipher: FrameCipher::new(network),
            config,
            orch_tx,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open a new virtual connection.
    pub async fn dial(&self) -> Result<ClientConn> {
        ClientConn::connect(
            self.endpoint.clone(),
            self.cipher,
            self.config.clone(),
            self.orch_tx.clone(),
        )
        .await
    }
}

/// Dial a single connection to `address` over network `network`.
///
/// Every call builds a throwaway [`Dialer`]; applications opening many
/// connections to the same endpoint should keep one dialer around so their
/// idle polling is batched together.
pub async fn dial(network: &str, address: &str) -> Result<ClientConn> {
    Dialer::new(network, address).dial().await
}

/// Listen for tunneled connections on the TCP address `address`, with the
/// cipher key derived from `network`.
pub async fn listen(network: &str, address: &str) -> Result<Listener> {
    Listener::bind(network, address, Config::default()).await
}

/// [`listen`] with explicit settings.
pub async fn listen_with_config(network: &str, address: &str, config: Config) -> Result<Listener> {
    Listener::bind(network, address, config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_normalization() {
        let d = Dialer::new("net1", "127.0.0.1:20001");
        assert_eq!(d.endpoint(), "http://127.0.0.1:20001/");

        let d = Dialer::new("net1", "http://example.com/tunnel");
        assert_eq!(d.endpoint(), "http://example.com/tunnel");
    }
}
