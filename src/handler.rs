//! Per-query orchestration: zone gate, store lookup, health filter, weighted
//! selection, and response construction.

use async_trait::async_trait;
use hickory_proto::op::{Header, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, PTR};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::iter;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, trace};

use crate::balance::{Candidate, WeightedBalancer};
use crate::healthcheck::{Checker, UnhealthyPolicy};
use crate::metrics::{self, QueryResult, Timer};
use crate::store::{HostStore, Snapshot};

/// Pass-through clause: which query names may be handed to the next stage
/// when this handler has no answer for them.
#[derive(Debug, Clone, Default)]
pub struct Fallthrough {
    enabled: bool,
    zones: Vec<String>,
}

impl Fallthrough {
    /// Never hand off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Hand off queries in the given zones; an empty list means all names.
    pub fn enabled(zones: Vec<String>) -> Self {
        Self {
            enabled: true,
            zones: zones.into_iter().map(|z| normalize(&z)).collect(),
        }
    }

    /// Whether an unanswered query for `qname` should be handed off.
    pub fn matches(&self, qname: &str) -> bool {
        self.enabled && (self.zones.is_empty() || self.zones.iter().any(|z| in_zone(qname, z)))
    }
}

/// What the lookup produced for one question.
enum Outcome {
    /// Authoritative answers.
    Answers(Vec<Record>),
    /// The name exists, just not for this record type: empty NOERROR.
    NoData,
    /// Nothing to answer; fallthrough decides between hand-off and SERVFAIL.
    Miss,
    /// Hand the question to the next stage unconditionally.
    PassThrough,
}

/// DNS request handler backed by the hosts store.
pub struct HostsHandler {
    origins: Vec<String>,
    fall: Fallthrough,
    ttl: u32,
    store: HostStore,
    checker: Option<Arc<Checker>>,
    balancer: WeightedBalancer,
}

impl HostsHandler {
    /// Create a handler answering for `origins` with the given zone default
    /// TTL. Health filtering is active when a checker is supplied.
    pub fn new(
        origins: Vec<String>,
        fall: Fallthrough,
        ttl: u32,
        store: HostStore,
        checker: Option<Arc<Checker>>,
    ) -> Self {
        Self {
            origins: origins.iter().map(|o| normalize(o)).collect(),
            fall,
            ttl,
            store,
            checker,
            balancer: WeightedBalancer::new(),
        }
    }

    fn resolve_addr(
        &self,
        snapshot: &Snapshot,
        qname: &str,
        name: &Name,
        qtype: RecordType,
    ) -> Outcome {
        let (entries, other_family) = match qtype {
            RecordType::A => (
                snapshot.lookup_v4_wildcard(qname),
                snapshot.lookup_v6_wildcard(qname),
            ),
            _ => (
                snapshot.lookup_v6_wildcard(qname),
                snapshot.lookup_v4_wildcard(qname),
            ),
        };

        if entries.is_empty() {
            return if other_family.is_empty() {
                Outcome::Miss
            } else {
                Outcome::NoData
            };
        }

        let mut candidates = Vec::with_capacity(entries.len());
        let mut all_unhealthy = true;
        for entry in &entries {
            let healthy = match &self.checker {
                Some(checker) => {
                    let healthy = checker.is_healthy(qname, entry.ip);
                    metrics::record_health_status(qname, entry.ip, healthy);
                    healthy
                }
                None => true,
            };
            if healthy {
                all_unhealthy = false;
            }
            candidates.push(Candidate {
                ip: entry.ip,
                weight: entry.weight,
                healthy,
            });
        }

        if all_unhealthy {
            if let Some(checker) = &self.checker {
                debug!(qname, policy = ?checker.policy(), "all entries unhealthy");
                match checker.policy() {
                    UnhealthyPolicy::ReturnAll => {
                        for candidate in &mut candidates {
                            candidate.healthy = true;
                        }
                    }
                    UnhealthyPolicy::ReturnEmpty => return Outcome::Miss,
                    UnhealthyPolicy::Fallthrough => return Outcome::PassThrough,
                }
            }
        }

        let ips = self.balancer.select(&candidates);
        if ips.is_empty() {
            return Outcome::Miss;
        }

        // Entry TTL override beats the zone default.
        let ttl = match entries.first() {
            Some(e) if e.ttl > 0 => e.ttl,
            _ => self.ttl,
        };

        let answers = match qtype {
            RecordType::A => a_records(name, ttl, &ips),
            _ => aaaa_records(name, ttl, &ips),
        };
        Outcome::Answers(answers)
    }

    fn resolve_ptr(&self, snapshot: &Snapshot, qname: &str, name: &Name) -> Outcome {
        let Some(addr) = reverse_address(qname) else {
            return Outcome::PassThrough;
        };

        let names = snapshot.lookup_addr(&addr);
        if names.is_empty() {
            return Outcome::PassThrough;
        }
        Outcome::Answers(ptr_records(name, self.ttl, &names))
    }

    async fn respond<R: ResponseHandler>(
        &self,
        request: &Request,
        mut handle: R,
        code: ResponseCode,
        answers: &[Record],
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_response_code(code);
        let message = builder.build(
            header,
            answers.iter(),
            iter::empty(),
            iter::empty(),
            iter::empty(),
        );
        match handle.send_response(message).await {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "failed to write DNS response");
                failed_info(request)
            }
        }
    }

    async fn respond_code<R: ResponseHandler>(
        &self,
        request: &Request,
        mut handle: R,
        code: ResponseCode,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let message = builder.error_msg(request.header(), code);
        match handle.send_response(message).await {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "failed to write DNS response");
                failed_info(request)
            }
        }
    }

    /// Hand the question to the next stage. Standalone there is none, so the
    /// hand-off degenerates to SERVFAIL.
    async fn pass_through<R: ResponseHandler>(&self, request: &Request, handle: R) -> ResponseInfo {
        self.respond_code(request, handle, ResponseCode::ServFail).await
    }
}

#[async_trait]
impl RequestHandler for HostsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();

        let info = match request.request_info() {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "malformed request");
                return self
                    .respond_code(request, response_handle, ResponseCode::FormErr)
                    .await;
            }
        };

        let qname = normalize(&info.query.name().to_string());
        let qtype = info.query.query_type();
        let label = qtype_label(qtype);
        trace!(%qname, ?qtype, "query");

        // Zone gate. PTR bypasses it: reverse zones are not listed in the
        // origins.
        let in_origin = self.origins.iter().any(|z| in_zone(&qname, z));
        if !in_origin && qtype != RecordType::PTR {
            return self.pass_through(request, response_handle).await;
        }

        let name = Name::from(info.query.name().clone());
        let snapshot = self.store.snapshot();

        let outcome = match qtype {
            RecordType::A | RecordType::AAAA => {
                self.resolve_addr(&snapshot, &qname, &name, qtype)
            }
            RecordType::PTR => self.resolve_ptr(&snapshot, &qname, &name),
            _ => {
                // Unsupported type: answer NODATA when the name exists at all.
                if snapshot.lookup_v4_wildcard(&qname).is_empty()
                    && snapshot.lookup_v6_wildcard(&qname).is_empty()
                {
                    Outcome::Miss
                } else {
                    Outcome::NoData
                }
            }
        };

        metrics::record_query_duration(label, timer.elapsed());

        match outcome {
            Outcome::Answers(answers) => {
                metrics::record_query(label, QueryResult::Hit);
                self.respond(request, response_handle, ResponseCode::NoError, &answers)
                    .await
            }
            Outcome::NoData => {
                metrics::record_query(label, QueryResult::Miss);
                self.respond(request, response_handle, ResponseCode::NoError, &[])
                    .await
            }
            Outcome::Miss => {
                metrics::record_query(label, QueryResult::Miss);
                if self.fall.matches(&qname) {
                    self.pass_through(request, response_handle).await
                } else {
                    self.respond_code(request, response_handle, ResponseCode::ServFail)
                        .await
                }
            }
            Outcome::PassThrough => {
                metrics::record_query(label, QueryResult::Miss);
                self.pass_through(request, response_handle).await
            }
        }
    }
}

fn failed_info(request: &Request) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}

fn qtype_label(qtype: RecordType) -> &'static str {
    match qtype {
        RecordType::A => "A",
        RecordType::AAAA => "AAAA",
        RecordType::PTR => "PTR",
        _ => "OTHER",
    }
}

/// Whether `qname` is `zone` or a name below it. Both are normalized FQDNs.
fn in_zone(qname: &str, zone: &str) -> bool {
    if zone == "." {
        return true;
    }
    qname == zone
        || (qname.len() > zone.len()
            && qname.ends_with(zone)
            && qname.as_bytes()[qname.len() - zone.len() - 1] == b'.')
}

fn normalize(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Recover the address text from a reverse query name, or `None` when the
/// name is not a well-formed `in-addr.arpa.`/`ip6.arpa.` name.
fn reverse_address(qname: &str) -> Option<String> {
    let name = qname.trim_end_matches('.');

    if let Some(rest) = name.strip_suffix(".in-addr.arpa") {
        let mut octets: Vec<&str> = rest.split('.').collect();
        if octets.len() != 4 {
            return None;
        }
        octets.reverse();
        return octets
            .join(".")
            .parse::<std::net::Ipv4Addr>()
            .ok()
            .map(|ip| ip.to_string());
    }

    if let Some(rest) = name.strip_suffix(".ip6.arpa") {
        let mut nibbles: Vec<&str> = rest.split('.').collect();
        if nibbles.len() != 32 {
            return None;
        }
        nibbles.reverse();
        let mut hex = String::with_capacity(39);
        for (i, nibble) in nibbles.iter().enumerate() {
            if nibble.len() != 1 {
                return None;
            }
            if i > 0 && i % 4 == 0 {
                hex.push(':');
            }
            hex.push_str(nibble);
        }
        return hex
            .parse::<std::net::Ipv6Addr>()
            .ok()
            .map(|ip| ip.to_string());
    }

    None
}

fn new_record(name: Name, ttl: u32, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

fn a_records(name: &Name, ttl: u32, ips: &[IpAddr]) -> Vec<Record> {
    ips.iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(new_record(name.clone(), ttl, RData::A(A::from(*v4)))),
            IpAddr::V6(_) => None,
        })
        .collect()
}

fn aaaa_records(name: &Name, ttl: u32, ips: &[IpAddr]) -> Vec<Record> {
    ips.iter()
        .filter_map(|ip| match ip {
            IpAddr::V6(v6) => Some(new_record(name.clone(), ttl, RData::AAAA(AAAA::from(*v6)))),
            IpAddr::V4(_) => None,
        })
        .collect()
}

fn ptr_records(name: &Name, ttl: u32, targets: &[String]) -> Vec<Record> {
    targets
        .iter()
        .filter_map(|t| Name::from_ascii(t).ok())
        .map(|t| new_record(name.clone(), ttl, RData::PTR(PTR(t))))
        .collect()
}
