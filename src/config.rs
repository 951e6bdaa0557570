//! Tunnel configuration
//!
//! Process-wide defaults from the protocol description, overridable at
//! startup by handing a customized [`Config`] to the dialer or listener.
//! There is no persisted state, no environment variables and no CLI.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Hook returning the HTTP client to use for a single outgoing request.
///
/// Lets applications inject proxies, TLS settings or connection limits
/// without htun knowing about them.
pub type RequestClientHook = Arc<dyn Fn() -> reqwest::Client + Send + Sync>;

/// Per-POST request timeout. Carried by the default HTTP client; a custom
/// [`Config::on_request_server`] hook is expected to apply its own.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Tunable settings shared by dialers and listeners.
#[derive(Clone)]
pub struct Config {
    /// Server-side idle-connection GC interval, and the envelope over which
    /// a client keeps retrying a failing POST before giving up.
    pub inactive_purge: Duration,

    /// Cap on reading a single response body before it is force-dropped.
    pub client_read_timeout: Duration,

    /// Bound on the client write buffer (writers block past it) and on the
    /// read side's early-frame payload (exceeding it is fatal).
    pub max_write_buffer_size: usize,

    /// Cap on outbound bytes drained into a single response batch.
    pub max_read_buffer_size: usize,

    /// Enables the periodic listener stats task.
    pub verbose: bool,

    /// Optional override for the HTTP client used per request.
    pub on_request_server: Option<RequestClientHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inactive_purge: Duration::from_secs(60),
            client_read_timeout: Duration::from_secs(15),
            max_write_buffer_size: 1024 * 1024,
            max_read_buffer_size: 1024 * 1024,
            verbose: false,
            on_request_server: None,
        }
    }
}

impl Config {
    pub fn with_inactive_purge(mut self, d: Duration) -> Self {
        self.inactive_purge = d;
        self
    }

    pub fn with_client_read_timeout(mut self, d: Duration) -> Self {
        self.client_read_timeout = d;
        self
    }

    pub fn with_max_write_buffer_size(mut self, n: usize) -> Self {
        self.max_write_buffer_size = n;
        self
    }

    pub fn with_max_read_buffer_size(mut self, n: usize) -> Self {
        self.max_read_buffer_size = n;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_on_request_server(mut self, hook: RequestClientHook) -> Self {
        self.on_request_server = Some(hook);
        self
    }

    /// The HTTP client for the next request: the hook's product, or a
    /// process-shared default with the standard request timeout.
    pub(crate) fn request_client(&self) -> reqwest::Client {
        if let Some(hook) = &self.on_request_server {
            return hook();
        }
        static DEFAULT: OnceLock<reqwest::Client> = OnceLock::new();
        DEFAULT
            .get_or_init(|| {
                // Infallible: build() only fails initializing a TLS backend,
                // and none is compiled in.
                reqwest::Client::builder()
                    .timeout(REQUEST_TIMEOUT)
                    .build()
                    .expect("default http client")
            })
            .clone()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("inactive_purge", &self.inactive_purge)
            .field("client_read_timeout", &self.client_read_timeout)
            .field("max_write_buffer_size", &self.max_write_buffer_size)
            .field("max_read_buffer_size", &self.max_read_buffer_size)
            .field("verbose", &self.verbose)
            .field("on_request_server", &self.on_request_server.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.inactive_purge, Duration::from_secs(60));
        assert_eq!(config.client_read_timeout, Duration::from_secs(15));
        assert_eq!(config.max_write_buffer_size, 1024 * 1024);
        assert_eq!(config.max_read_buffer_size, 1024 * 1024);
        assert!(!config.verbose);
        assert!(config.on_request_server.is_none());
    }

    #[test]
    fn test_builder_setters() {
        let config = Config::default()
            .with_inactive_purge(Duration::from_secs(5))
            .with_verbose(true);
        assert_eq!(config.inactive_purge, Duration::from_secs(5));
        assert!(config.verbose);
    }

    #[test]
    fn test_request_client_hook() {
        let config = Config::default().with_on_request_server(Arc::new(|| {
            reqwest::Client::builder()
                .timeout(Duration::from_millis(100))
                .build()
                .unwrap()
        }));
        // The hook is consulted rather than the shared default.
        let _client = config.request_client();
        assert!(config.on_request_server.is_some());
    }
}
