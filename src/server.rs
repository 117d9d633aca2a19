//! DNS server setup and lifecycle management.

use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::DnsError;
use crate::handler::{Fallthrough, HostsHandler};
use crate::healthcheck::Checker;
use crate::storage;
use crate::store::HostStore;
use crate::sync::Synchronizer;

/// TCP connection idle timeout for the DNS listener.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// DNS server serving the etcd-backed hosts table.
pub struct DnsServer {
    config: Config,
    store: HostStore,
}

impl DnsServer {
    /// Create a new DNS server with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: HostStore::new(),
        }
    }

    /// The hosts store backing this server.
    pub fn store(&self) -> &HostStore {
        &self.store
    }

    /// Run the DNS server until `cancel` fires.
    ///
    /// etcd being down at startup is not fatal: the server begins answering
    /// from an empty view and the synchronizer converges when the cluster
    /// becomes reachable.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DnsError> {
        self.config.validate()?;

        info!(
            listen_addr = %self.config.dns.listen_addr,
            origins = ?self.config.dns.origins,
            endpoints = ?self.config.etcd.endpoints,
            storage = ?self.config.etcd.storage,
            "starting etcdhosts-dns"
        );

        let client = storage::connect(&self.config.etcd).await?;
        let storage = storage::new_storage(
            client,
            self.config.etcd.storage,
            &self.config.etcd.key,
        );

        let checker = match &self.config.healthcheck {
            Some(hc) => Some(Arc::new(Checker::new(hc.checker_config())?)),
            None => None,
        };

        let synchronizer = Synchronizer::new(storage, self.store.clone(), checker.clone());
        let sync_handle = tokio::spawn(synchronizer.run(cancel.clone()));

        let checker_handle = checker
            .clone()
            .map(|c| tokio::spawn(c.run(cancel.clone())));

        let fall = match &self.config.dns.fallthrough {
            Some(zones) => Fallthrough::enabled(zones.clone()),
            None => Fallthrough::disabled(),
        };
        let handler = HostsHandler::new(
            self.config.dns.origins.clone(),
            fall,
            self.config.dns.ttl,
            self.store.clone(),
            checker,
        );

        let mut server = ServerFuture::new(handler);

        let udp_socket = UdpSocket::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
            }
        }

        // Stop background tasks before returning.
        cancel.cancel();
        let _ = sync_handle.await;
        if let Some(handle) = checker_handle {
            let _ = handle.await;
        }

        info!("DNS server stopped");
        Ok(())
    }
}
