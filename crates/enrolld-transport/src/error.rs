use thiserror::Error;

/// Transport-level failures (spec.md §7 `TransientNetworkError` plus the
/// fatal accept-loop errors spec.md §4.4 names).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to load TLS material: {0}")]
    Config(String),
}
