//! Client configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Options of a [`Client`](crate::client::Client).
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Bound for resolving and connecting (including the TLS handshake).
    pub connect_timeout: Duration,

    /// Requests without a response after this long fail with "Request timed out".
    pub request_timeout: Duration,

    /// Connections without activity for this long are closed.
    pub linger_timeout: Duration,

    /// Upper bound of the doubling delay between reconnect attempts.
    pub max_reconnect_interval: Duration,

    /// Use TLS (or Grid TLS) if set, plain TCP otherwise.
    pub ssl: Option<SslOptions>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            connect_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            linger_timeout: Duration::from_secs(600),
            max_reconnect_interval: Duration::from_secs(32),
            ssl: None,
        }
    }
}

impl ClientOptions {
    /// Period of the timer checking request timeouts and idle connections.
    pub fn timer_interval(&self) -> Duration {
        let shortest = self.request_timeout.min(self.linger_timeout);
        (shortest / 4).max(Duration::from_millis(10))
    }
}

/// Certificate material and trust policy for TLS connections.
#[derive(Clone, Default)]
pub struct SslOptions {
    /// PEM certificate chain presented to the server.
    pub pem_cert_file: Option<PathBuf>,

    /// PEM private key belonging to `pem_cert_file`.
    pub pem_key_file: Option<PathBuf>,

    /// Password of an encrypted (PKCS#8) `pem_key_file`.
    pub pem_password: Option<String>,

    /// PKCS#12 container with client certificate chain and private key.
    /// Takes precedence over the PEM files.
    pub pkcs12_file: Option<PathBuf>,

    pub pkcs12_password: Option<String>,

    /// PEM bundle of CA certificates trusted when verifying servers.
    pub trusted_certs_file: Option<PathBuf>,

    /// Verify the server certificate against `trusted_certs_file`.
    pub verify_certificates: bool,

    /// Grid mode: the TLS handshake authenticates the client, the server
    /// certificate is accepted without verification.
    pub use_grid_ssl: bool,
}

impl fmt::Debug for SslOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |password: &Option<String>| password.as_ref().map(|_| "***");
        f.debug_struct("SslOptions")
            .field("pem_cert_file", &self.pem_cert_file)
            .field("pem_key_file", &self.pem_key_file)
            .field("pem_password", &redacted(&self.pem_password))
            .field("pkcs12_file", &self.pkcs12_file)
            .field("pkcs12_password", &redacted(&self.pkcs12_password))
            .field("trusted_certs_file", &self.trusted_certs_file)
            .field("verify_certificates", &self.verify_certificates)
            .field("use_grid_ssl", &self.use_grid_ssl)
            .finish()
    }
}
