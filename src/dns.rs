//! XMPP service resolution: RFC 6120 SRV record lookup producing an ordered
//! list of connection candidates.
//!
//! Records are sorted by priority (ascending, lower = preferred) per
//! RFC 2782, and ordered within each priority group by one-time weighted
//! random sampling. The sampled ordering is cached in the returned
//! [`ConnectData`], so every connection attempt against the same resolution
//! sees the same candidate list.

use rand::Rng;
use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::Error;

/// Standard XMPP client port, used when no SRV records exist (RFC 6120).
const FALLBACK_PORT: u16 = 5222;

/// One `(host, port)` pair from service resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCandidate {
    pub host: String,
    pub port: u16,
}

/// The resolved, ordered candidate list for one connection.
///
/// Ordering is fixed at resolution time; repeated attempts index into the
/// same list.
#[derive(Debug, Clone)]
pub struct ConnectData {
    candidates: Vec<ConnectCandidate>,
}

impl ConnectData {
    /// A single fixed endpoint, bypassing discovery.
    pub fn fixed(host: impl Into<String>, port: u16) -> Self {
        ConnectData {
            candidates: vec![ConnectCandidate {
                host: host.into(),
                port,
            }],
        }
    }

    /// The discovery-less default: the service name itself on port 5222.
    pub fn fallback(service_name: &str) -> Self {
        ConnectData::fixed(service_name, FALLBACK_PORT)
    }

    /// Number of servers available for connection attempts.
    pub fn attempts(&self) -> usize {
        self.candidates.len()
    }

    pub fn candidate(&self, index: usize) -> Option<&ConnectCandidate> {
        self.candidates.get(index)
    }
}

/// Resolve `_xmpp-client._tcp.<domain>`.
///
/// An empty result set is not an error: the fallback candidate
/// `(domain, 5222)` is returned, matching servers that simply publish no SRV
/// records. A failed lookup returns [`Error::ResolutionFailed`]; the caller
/// decides whether to fall back.
pub(crate) async fn resolve(domain: &str) -> Result<ConnectData, Error> {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to load system DNS config, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let srv_name = format!("_xmpp-client._tcp.{}", domain);
    let lookup = resolver.srv_lookup(&srv_name).await.map_err(|e| {
        info!(domain, srv = %srv_name, error = %e, "SRV lookup failed");
        Error::ResolutionFailed {
            domain: domain.to_string(),
            reason: e.to_string(),
        }
    })?;

    let records: Vec<(u16, u16, String, u16)> = lookup
        .iter()
        .map(|r| {
            (
                r.priority(),
                r.weight(),
                r.target().to_string().trim_end_matches('.').to_string(),
                r.port(),
            )
        })
        .collect();

    if records.is_empty() {
        info!(domain, "no SRV records found, using fallback {}:{}", domain, FALLBACK_PORT);
        return Ok(ConnectData::fallback(domain));
    }

    let candidates = order_candidates(records, &mut rand::thread_rng());
    for c in &candidates {
        info!(domain, host = %c.host, port = c.port, "SRV candidate");
    }
    Ok(ConnectData { candidates })
}

/// Sort by ascending priority, then weighted-sample each priority group into
/// a fixed order. Weight 0 records sort to the end of their group, as
/// RFC 2782 intends them to be chosen only when nothing else is left.
fn order_candidates<R: Rng>(
    mut records: Vec<(u16, u16, String, u16)>,
    rng: &mut R,
) -> Vec<ConnectCandidate> {
    records.sort_by_key(|r| r.0);

    let mut ordered = Vec::with_capacity(records.len());
    let mut group_start = 0;
    while group_start < records.len() {
        let priority = records[group_start].0;
        let group_end = records[group_start..]
            .iter()
            .position(|r| r.0 != priority)
            .map(|p| group_start + p)
            .unwrap_or(records.len());

        let mut group: Vec<_> = records[group_start..group_end].to_vec();
        while !group.is_empty() {
            let total: u32 = group.iter().map(|r| u32::from(r.1)).sum();
            let picked = if total == 0 {
                0
            } else {
                let mut roll = rng.gen_range(0..total);
                group
                    .iter()
                    .position(|r| {
                        if roll < u32::from(r.1) {
                            true
                        } else {
                            roll -= u32::from(r.1);
                            false
                        }
                    })
                    .unwrap_or(0)
            };
            let (_, _, host, port) = group.remove(picked);
            ordered.push(ConnectCandidate { host, port });
        }
        group_start = group_end;
    }
    ordered
}
