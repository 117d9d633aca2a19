//! Health probes: TCP connect, HTTP(S) GET, ICMP echo.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::error::DnsError;
use crate::healthcheck::Target;
use crate::parser::HealthSpec;

/// A single probe flavor. `path` is only meaningful for HTTP probes and
/// `port` is ignored by ICMP.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Probe the target once. `Ok(())` means reachable.
    async fn check(&self, ip: IpAddr, port: u16, path: &str) -> Result<(), DnsError>;
}

/// Probes one [`Target`] by dispatching on its health spec.
#[async_trait]
pub trait TargetProber: Send + Sync {
    /// Probe the target once. `Ok(())` means reachable.
    async fn probe(&self, target: &Target) -> Result<(), DnsError>;
}

/// TCP connect probe: a completed handshake counts as healthy.
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    /// Create a TCP probe with the given dial timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self, ip: IpAddr, port: u16, _path: &str) -> Result<(), DnsError> {
        if port == 0 {
            return Err(DnsError::Probe("tcp connect failed: invalid port 0".into()));
        }

        let addr = SocketAddr::new(ip, port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DnsError::Probe(format!("tcp connect to {addr} timed out")))?
            .map_err(|e| DnsError::Probe(format!("tcp connect to {addr} failed: {e}")))?;
        drop(stream);
        Ok(())
    }
}

/// HTTP/HTTPS GET probe.
///
/// Certificate validation is disabled and redirects are not followed: a 3xx
/// is evidence of a live front end even when the health endpoint hands off,
/// so 200–399 count as healthy.
pub struct HttpProbe {
    client: reqwest::Client,
    https: bool,
}

impl HttpProbe {
    /// Create an HTTP probe. With `https` the request uses TLS, accepting
    /// any certificate.
    pub fn new(timeout: Duration, https: bool) -> Result<Self, DnsError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self { client, https })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, ip: IpAddr, port: u16, path: &str) -> Result<(), DnsError> {
        if port == 0 {
            return Err(DnsError::Probe("http check failed: invalid port 0".into()));
        }

        let scheme = if self.https { "https" } else { "http" };
        let host = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        let path = if path.is_empty() { "/" } else { path };
        let url = format!("{scheme}://{host}:{port}{path}");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DnsError::Probe(format!("http check of {url} failed: {e}")))?;

        let status = resp.status().as_u16();
        if (200..400).contains(&status) {
            Ok(())
        } else {
            Err(DnsError::Probe(format!(
                "http check of {url} failed: unhealthy status code {status}"
            )))
        }
    }
}

/// ICMP echo probe. Sends one echo request carrying a process-scoped
/// identifier and accepts only the matching reply from the exact target.
/// Needs permission to open ICMP sockets.
pub struct IcmpProbe {
    timeout: Duration,
}

impl IcmpProbe {
    /// Create an ICMP probe with the given reply timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    async fn check(&self, ip: IpAddr, _port: u16, _path: &str) -> Result<(), DnsError> {
        let config = match ip {
            IpAddr::V4(_) => surge_ping::Config::default(),
            IpAddr::V6(_) => surge_ping::Config::builder()
                .kind(surge_ping::ICMP::V6)
                .build(),
        };

        let client = surge_ping::Client::new(&config)
            .map_err(|e| DnsError::Probe(format!("icmp socket: {e}")))?;

        let ident = surge_ping::PingIdentifier(std::process::id() as u16);
        let mut pinger = client.pinger(ip, ident).await;
        pinger.timeout(self.timeout);

        pinger
            .ping(surge_ping::PingSequence(0), b"etcdhosts-healthcheck")
            .await
            .map(|_| ())
            .map_err(|e| DnsError::Probe(format!("icmp echo to {ip} failed: {e}")))
    }
}

/// The full probe set, one per check kind.
pub struct ProbeSet {
    tcp: TcpProbe,
    http: HttpProbe,
    https: HttpProbe,
    icmp: IcmpProbe,
}

impl ProbeSet {
    /// Build probes sharing one timeout.
    pub fn new(timeout: Duration) -> Result<Self, DnsError> {
        Ok(Self {
            tcp: TcpProbe::new(timeout),
            http: HttpProbe::new(timeout, false)?,
            https: HttpProbe::new(timeout, true)?,
            icmp: IcmpProbe::new(timeout),
        })
    }
}

#[async_trait]
impl TargetProber for ProbeSet {
    async fn probe(&self, target: &Target) -> Result<(), DnsError> {
        match &target.spec {
            HealthSpec::Tcp { port } => self.tcp.check(target.ip, *port, "").await,
            HealthSpec::Http { port, path } => self.http.check(target.ip, *port, path).await,
            HealthSpec::Https { port, path } => self.https.check(target.ip, *port, path).await,
            HealthSpec::Icmp => self.icmp.check(target.ip, 0, "").await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn local_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// Accept one connection and answer with a canned HTTP response.
    fn serve_http_once(listener: TcpListener, response: &'static str) {
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
    }

    #[tokio::test]
    async fn test_tcp_probe_succeeds_on_open_port() {
        let (listener, addr) = local_listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let probe = TcpProbe::new(TIMEOUT);
        assert!(probe.check(addr.ip(), addr.port(), "").await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_fails_on_closed_port() {
        // Bind then drop to find a port that refuses connections.
        let (listener, addr) = local_listener().await;
        drop(listener);

        let probe = TcpProbe::new(TIMEOUT);
        assert!(probe.check(addr.ip(), addr.port(), "").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_rejects_port_zero() {
        let probe = TcpProbe::new(TIMEOUT);
        assert!(probe.check("127.0.0.1".parse().unwrap(), 0, "").await.is_err());
    }

    #[tokio::test]
    async fn test_http_probe_accepts_200() {
        let (listener, addr) = local_listener().await;
        serve_http_once(listener, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");

        let probe = HttpProbe::new(TIMEOUT, false).unwrap();
        assert!(probe.check(addr.ip(), addr.port(), "/healthz").await.is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_accepts_redirect_without_following() {
        let (listener, addr) = local_listener().await;
        serve_http_once(
            listener,
            "HTTP/1.1 302 Found\r\nlocation: http://0.0.0.0:1/\r\ncontent-length: 0\r\n\r\n",
        );

        let probe = HttpProbe::new(TIMEOUT, false).unwrap();
        assert!(probe.check(addr.ip(), addr.port(), "/").await.is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_rejects_500() {
        let (listener, addr) = local_listener().await;
        serve_http_once(
            listener,
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n",
        );

        let probe = HttpProbe::new(TIMEOUT, false).unwrap();
        assert!(probe.check(addr.ip(), addr.port(), "/").await.is_err());
    }

    #[tokio::test]
    async fn test_http_probe_defaults_empty_path() {
        let (listener, addr) = local_listener().await;
        serve_http_once(listener, "HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n");

        let probe = HttpProbe::new(TIMEOUT, false).unwrap();
        assert!(probe.check(addr.ip(), addr.port(), "").await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_set_dispatches_by_spec() {
        let (listener, addr) = local_listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let set = ProbeSet::new(TIMEOUT).unwrap();
        let target = Target {
            hostname: "svc.example.com.".into(),
            ip: addr.ip(),
            spec: HealthSpec::Tcp { port: addr.port() },
        };
        assert!(set.probe(&target).await.is_ok());
    }
}
