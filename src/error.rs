//! Error types for etcdhosts-dns.

use thiserror::Error;

/// Errors that can occur in the DNS server.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// etcd client error
    #[error("etcd client error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// HTTP probe client error
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Health probe failure
    #[error("probe failed: {0}")]
    Probe(String),

    /// The watch stream terminated and must be re-established
    #[error("watch stream ended")]
    WatchClosed,
}
