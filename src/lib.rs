//! etcdhosts-dns - An authoritative DNS server backed by an etcd-stored
//! hosts table.
//!
//! A fleet of identical servers watches the same etcd key (or key prefix)
//! holding an extended hosts file and answers A, AAAA, and PTR queries from
//! an in-memory index, with per-entry TTLs, weighted selection across
//! equivalent addresses, and active health checks that take unreachable
//! targets out of rotation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        etcdhosts-dns                            │
//! │                                                                 │
//! │  ┌──────────────────┐    ┌──────────────────┐                  │
//! │  │ etcd watch       │───▶│   Host store     │                  │
//! │  │ (synchronizer)   │    │   (snapshots)    │                  │
//! │  └──────────────────┘    └────────┬─────────┘                  │
//! │         │                         │                             │
//! │  ┌──────────────────┐             ▼                             │
//! │  │ Health checker   │    ┌──────────────────┐                  │
//! │  │ (tcp/http/icmp)  │───▶│  Query handler   │◀── UDP/TCP :53   │
//! │  └──────────────────┘    │  (hickory-dns)   │                  │
//! │                          └──────────────────┘                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Hosts format
//!
//! Standard hosts lines, optionally annotated through a `+etcdhosts`
//! comment:
//!
//! ```text
//! 192.168.1.1 api.example.com # +etcdhosts weight=3 ttl=60
//! 192.168.1.3 svc.example.com # +etcdhosts hc=tcp:3306
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use etcdhosts_dns::{Config, DnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!     let cancel = CancellationToken::new();
//!     let server = DnsServer::new(config);
//!     server.run(cancel).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod balance;
pub mod config;
pub mod error;
pub mod handler;
pub mod healthcheck;
pub mod metrics;
pub mod parser;
pub mod probe;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync;
pub mod telemetry;

// Re-export main types
pub use config::{Config, DnsConfig, EtcdConfig, HealthcheckConfig, TelemetryConfig};
pub use error::DnsError;
pub use handler::{Fallthrough, HostsHandler};
pub use server::DnsServer;
pub use store::HostStore;
