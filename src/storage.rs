//! etcd access: client construction and the two hosts-data layouts.
//!
//! `single` mode keeps the whole table in one key; `perhost` mode spreads it
//! over a key prefix, one value per host line. Both expose the same
//! [`Storage`] interface: a one-shot `load` and a `watch` channel carrying
//! revision-stamped change events. Watches run against the cluster leader so
//! a partitioned follower cannot feed us an obsolete view.

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType, GetOptions, Identity, TlsOptions, WatchOptions,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{EtcdConfig, TlsConfig};
use crate::error::DnsError;

/// Default timeout for connecting to etcd.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default etcd key (or prefix) for hosts data.
pub const DEFAULT_KEY: &str = "/etcdhosts";

/// How hosts data is laid out in etcd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// All hosts in a single key.
    #[default]
    Single,
    /// Each host under its own key below a shared prefix.
    #[serde(rename = "perhost")]
    PerHost,
}

/// A change notification from the watch stream.
#[derive(Debug)]
pub enum WatchEvent {
    /// The dataset changed at `revision`. `data` carries the new payload for
    /// single-key mode (empty on delete); `None` means the layout cannot
    /// express the change incrementally and the consumer must re-`load`.
    Changed {
        /// New payload, when the event carries one.
        data: Option<Vec<u8>>,
        /// etcd revision of the change.
        revision: i64,
    },
    /// The stream failed. No further events follow until re-subscribed.
    Error(DnsError),
}

/// Uniform access to hosts data regardless of layout.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the full dataset and its revision. An empty dataset yields empty
    /// bytes with the store's current revision.
    async fn load(&self) -> Result<(Vec<u8>, i64), DnsError>;

    /// Subscribe to changes. Events arrive on the returned channel until the
    /// stream fails or `cancel` fires.
    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<WatchEvent>, DnsError>;
}

/// Connect to etcd with the configured auth, TLS, and dial timeout.
pub async fn connect(cfg: &EtcdConfig) -> Result<Client, DnsError> {
    let mut options = ConnectOptions::new()
        .with_connect_timeout(cfg.dial_timeout())
        .with_require_leader(true);

    if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
        options = options.with_user(user.clone(), password.clone());
    }

    if let Some(tls) = &cfg.tls {
        options = options.with_tls(build_tls(tls)?);
    }

    let client = Client::connect(&cfg.endpoints, Some(options)).await?;
    Ok(client)
}

fn build_tls(cfg: &TlsConfig) -> Result<TlsOptions, DnsError> {
    let cert_pem = std::fs::read(&cfg.cert)?;
    let key_pem = match &cfg.key {
        Some(key) => std::fs::read(key)?,
        // A combined PEM holds both certificate and key.
        None => cert_pem.clone(),
    };

    let mut options = TlsOptions::new().identity(Identity::from_pem(cert_pem, key_pem));
    if let Some(ca) = &cfg.ca {
        let ca_pem = std::fs::read(ca)?;
        options = options.ca_certificate(Certificate::from_pem(ca_pem));
    }
    Ok(options)
}

/// Build the storage adapter for the configured layout, normalizing the key
/// (leading `/`, and a trailing `/` for prefix mode).
pub fn new_storage(client: Client, mode: StorageMode, key: &str) -> Arc<dyn Storage> {
    let key = normalize_key(key, mode);
    match mode {
        StorageMode::Single => Arc::new(SingleKeyStorage { client, key }),
        StorageMode::PerHost => Arc::new(PrefixStorage {
            client,
            prefix: key,
        }),
    }
}

fn normalize_key(key: &str, mode: StorageMode) -> String {
    let key = if key.is_empty() { DEFAULT_KEY } else { key };
    let mut key = if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{key}")
    };
    if mode == StorageMode::PerHost && !key.ends_with('/') {
        key.push('/');
    }
    key
}

fn revision_of(header: Option<&etcd_client::ResponseHeader>) -> i64 {
    header.map(|h| h.revision()).unwrap_or(0)
}

/// All hosts live in one key; watch events carry the new value directly.
struct SingleKeyStorage {
    client: Client,
    key: String,
}

#[async_trait]
impl Storage for SingleKeyStorage {
    async fn load(&self) -> Result<(Vec<u8>, i64), DnsError> {
        let mut client = self.client.clone();
        let resp = client.get(self.key.as_str(), None).await?;
        let revision = revision_of(resp.header());
        let data = resp
            .kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .unwrap_or_default();
        Ok((data, revision))
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<WatchEvent>, DnsError> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client.watch(self.key.as_str(), None).await?;
        debug!(key = %self.key, "watching etcd key");

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Dropping the watcher cancels the server-side stream.
            let _watcher = watcher;
            loop {
                let resp = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    msg = stream.next() => match msg {
                        Some(Ok(resp)) => resp,
                        Some(Err(err)) => {
                            let _ = tx.send(WatchEvent::Error(err.into())).await;
                            return;
                        }
                        None => {
                            let _ = tx.send(WatchEvent::Error(DnsError::WatchClosed)).await;
                            return;
                        }
                    },
                };

                if resp.canceled() {
                    let _ = tx.send(WatchEvent::Error(DnsError::WatchClosed)).await;
                    return;
                }

                let revision = revision_of(resp.header());
                for event in resp.events() {
                    // A delete carries an explicit empty payload so the
                    // consumer publishes an empty table without re-reading.
                    let data = match event.event_type() {
                        EventType::Delete => Vec::new(),
                        EventType::Put => match event.kv() {
                            Some(kv) => kv.value().to_vec(),
                            None => continue,
                        },
                    };
                    if tx
                        .send(WatchEvent::Changed {
                            data: Some(data),
                            revision,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// One key per host below a prefix. A change batch degenerates to a single
/// "dirty" event; the consumer re-loads to realize the new state instead of
/// reconstructing it from per-key deltas.
struct PrefixStorage {
    client: Client,
    prefix: String,
}

#[async_trait]
impl Storage for PrefixStorage {
    async fn load(&self) -> Result<(Vec<u8>, i64), DnsError> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = revision_of(resp.header());

        // etcd returns range results in key order; keep it for determinism.
        let mut data = Vec::new();
        for (i, kv) in resp.kvs().iter().enumerate() {
            if i > 0 {
                data.push(b'\n');
            }
            data.extend_from_slice(kv.value());
        }
        Ok((data, revision))
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<WatchEvent>, DnsError> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(
                self.prefix.as_str(),
                Some(WatchOptions::new().with_prefix()),
            )
            .await?;
        debug!(prefix = %self.prefix, "watching etcd prefix");

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                let resp = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    msg = stream.next() => match msg {
                        Some(Ok(resp)) => resp,
                        Some(Err(err)) => {
                            let _ = tx.send(WatchEvent::Error(err.into())).await;
                            return;
                        }
                        None => {
                            let _ = tx.send(WatchEvent::Error(DnsError::WatchClosed)).await;
                            return;
                        }
                    },
                };

                if resp.canceled() {
                    let _ = tx.send(WatchEvent::Error(DnsError::WatchClosed)).await;
                    return;
                }

                // One dirty signal per batch, whatever it contained.
                if !resp.events().is_empty() {
                    let event = WatchEvent::Changed {
                        data: None,
                        revision: revision_of(resp.header()),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
