//! Hosts-table parser.
//!
//! The payload stored in etcd uses standard hosts-file syntax extended with a
//! comment marker carrying per-line attributes:
//!
//! ```text
//! 192.168.1.1 api.example.com            # +etcdhosts weight=3 ttl=60
//! 192.168.1.3 svc.example.com            # +etcdhosts hc=tcp:3306
//! 2001:db8::1 ipv6.example.com
//! ```
//!
//! Attributes apply to every hostname on the line. Lines that do not parse as
//! a host entry are skipped, matching hosts-file convention; the strict entry
//! point collects them instead.

use std::fmt;
use std::net::IpAddr;

/// Marker that a comment carries record attributes.
const ATTR_MARKER: &str = "+etcdhosts";

/// Weight bounds accepted from the `weight=` attribute.
const WEIGHT_RANGE: std::ops::RangeInclusive<u32> = 1..=10_000;

/// TTL bounds accepted from the `ttl=` attribute.
const TTL_RANGE: std::ops::RangeInclusive<u32> = 1..=65_535;

/// Health check specification attached to a record via the `hc=` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSpec {
    /// TCP connect check against a port.
    Tcp {
        /// Port to dial.
        port: u16,
    },
    /// HTTP GET check against a port and path.
    Http {
        /// Port to request.
        port: u16,
        /// Request path, always starting with `/`.
        path: String,
    },
    /// HTTPS GET check; certificate validation is disabled.
    Https {
        /// Port to request.
        port: u16,
        /// Request path, always starting with `/`.
        path: String,
    },
    /// ICMP echo check. No port.
    Icmp,
}

impl HealthSpec {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HealthSpec::Tcp { .. } => "tcp",
            HealthSpec::Http { .. } => "http",
            HealthSpec::Https { .. } => "https",
            HealthSpec::Icmp => "icmp",
        }
    }
}

impl fmt::Display for HealthSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthSpec::Tcp { port } => write!(f, "tcp:{port}"),
            HealthSpec::Http { port, path } if path == "/" => write!(f, "http:{port}"),
            HealthSpec::Http { port, path } => write!(f, "http:{port}{path}"),
            HealthSpec::Https { port, path } if path == "/" => write!(f, "https:{port}"),
            HealthSpec::Https { port, path } => write!(f, "https:{port}{path}"),
            HealthSpec::Icmp => write!(f, "icmp"),
        }
    }
}

/// One hostname/address association parsed from the hosts table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Lowercased FQDN with trailing dot.
    pub hostname: String,
    /// Address the hostname resolves to.
    pub ip: IpAddr,
    /// Per-record TTL override in seconds; 0 means "use the zone default".
    pub ttl: u32,
    /// Relative selection weight, at least 1.
    pub weight: u32,
    /// Optional health check; records without one are always served.
    pub health: Option<HealthSpec>,
}

impl Record {
    /// Render the record back into a hosts line, including the attribute
    /// comment when any attribute differs from its default.
    pub fn to_line(&self) -> String {
        let mut line = format!("{} {}", self.ip, self.hostname);
        let mut attrs = Vec::new();
        if self.weight != 1 {
            attrs.push(format!("weight={}", self.weight));
        }
        if self.ttl != 0 {
            attrs.push(format!("ttl={}", self.ttl));
        }
        if let Some(hc) = &self.health {
            attrs.push(format!("hc={hc}"));
        }
        if !attrs.is_empty() {
            line.push_str(" # ");
            line.push_str(ATTR_MARKER);
            for a in &attrs {
                line.push(' ');
                line.push_str(a);
            }
        }
        line
    }
}

/// A problem found on one input line by the strict parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number in the payload.
    pub line: usize,
    /// Human-readable reason the line (or attribute) was rejected.
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

/// Outcome of a strict parse: the records that did parse plus every rejection.
#[derive(Debug, Default, Clone)]
pub struct ParseResult {
    /// Records recovered from well-formed lines.
    pub records: Vec<Record>,
    /// Per-line problems; empty when the payload was fully clean.
    pub errors: Vec<ParseError>,
}

/// Parse a hosts payload, silently skipping malformed lines and attributes.
pub fn parse_records(data: &[u8]) -> Vec<Record> {
    parse_inner(data, None)
}

/// Parse a hosts payload, collecting malformed lines and attributes instead
/// of dropping them silently.
pub fn parse_records_strict(data: &[u8]) -> ParseResult {
    let mut result = ParseResult::default();
    let mut errors = Vec::new();
    result.records = parse_inner(data, Some(&mut errors));
    result.errors = errors;
    result
}

fn parse_inner(data: &[u8], mut errors: Option<&mut Vec<ParseError>>) -> Vec<Record> {
    let text = String::from_utf8_lossy(data);
    let mut records = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let (entry, comment) = match raw.find('#') {
            Some(i) => (&raw[..i], Some(&raw[i + 1..])),
            None => (raw, None),
        };

        let mut fields = entry.split_whitespace();
        let Some(addr_token) = fields.next() else {
            // Blank or comment-only line.
            continue;
        };

        let Some(ip) = parse_ip(addr_token) else {
            if let Some(errs) = errors.as_deref_mut() {
                errs.push(ParseError {
                    line: lineno,
                    reason: format!("invalid IP address {addr_token:?}"),
                });
            }
            continue;
        };

        let names: Vec<String> = fields.map(normalize_name).collect();
        if names.is_empty() {
            if let Some(errs) = errors.as_deref_mut() {
                errs.push(ParseError {
                    line: lineno,
                    reason: "address without hostnames".to_string(),
                });
            }
            continue;
        }

        let attrs = match comment {
            Some(c) => parse_attrs(c, lineno, errors.as_deref_mut()),
            None => LineAttrs::default(),
        };

        for hostname in names {
            records.push(Record {
                hostname,
                ip,
                ttl: attrs.ttl,
                weight: attrs.weight,
                health: attrs.health.clone(),
            });
        }
    }

    records
}

/// Per-line attributes accumulated from a `+etcdhosts` comment.
struct LineAttrs {
    weight: u32,
    ttl: u32,
    health: Option<HealthSpec>,
}

impl Default for LineAttrs {
    fn default() -> Self {
        Self {
            weight: 1,
            ttl: 0,
            health: None,
        }
    }
}

fn parse_attrs(comment: &str, lineno: usize, mut errors: Option<&mut Vec<ParseError>>) -> LineAttrs {
    let mut attrs = LineAttrs::default();

    let mut tokens = comment.split_whitespace();
    if tokens.next() != Some(ATTR_MARKER) {
        // Ordinary comment.
        return attrs;
    }

    for token in tokens {
        if let Some(value) = token.strip_prefix("weight=") {
            match value.parse::<u32>() {
                Ok(w) if WEIGHT_RANGE.contains(&w) => attrs.weight = w,
                _ => report(&mut errors, lineno, format!("invalid weight {value:?}")),
            }
        } else if let Some(value) = token.strip_prefix("ttl=") {
            match value.parse::<u32>() {
                Ok(t) if TTL_RANGE.contains(&t) => attrs.ttl = t,
                _ => report(&mut errors, lineno, format!("invalid ttl {value:?}")),
            }
        } else if let Some(value) = token.strip_prefix("hc=") {
            match parse_health(value) {
                Some(hc) => attrs.health = Some(hc),
                None => report(&mut errors, lineno, format!("invalid health check {value:?}")),
            }
        }
        // Anything else is free-form comment text.
    }

    attrs
}

fn report(errors: &mut Option<&mut Vec<ParseError>>, line: usize, reason: String) {
    if let Some(errs) = errors.as_deref_mut() {
        errs.push(ParseError { line, reason });
    }
}

/// Parse an `hc=` value: `tcp:<port>`, `http:<port>[/<path>]`,
/// `https:<port>[/<path>]`, or `icmp`.
fn parse_health(value: &str) -> Option<HealthSpec> {
    if value == "icmp" {
        return Some(HealthSpec::Icmp);
    }

    if let Some(rest) = value.strip_prefix("tcp:") {
        return parse_port(rest).map(|port| HealthSpec::Tcp { port });
    }

    for (prefix, https) in [("http:", false), ("https:", true)] {
        if let Some(rest) = value.strip_prefix(prefix) {
            let (port_str, path) = match rest.find('/') {
                Some(i) => (&rest[..i], rest[i..].to_string()),
                None => (rest, "/".to_string()),
            };
            let port = parse_port(port_str)?;
            return Some(if https {
                HealthSpec::Https { port, path }
            } else {
                HealthSpec::Http { port, path }
            });
        }
    }

    None
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(p) if p >= 1 => Some(p),
        _ => None,
    }
}

/// Parse an address token, discarding any IPv6 `%zone` suffix.
fn parse_ip(token: &str) -> Option<IpAddr> {
    let token = match token.find('%') {
        Some(i) => &token[..i],
        None => token,
    };
    token.parse().ok()
}

/// Lowercase and dot-terminate a hostname token.
fn normalize_name(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}
