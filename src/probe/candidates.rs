//! Candidate Set Builder
//!
//! Turns textual address/range specifications into a deduplicated list of
//! probe targets. IPv4 ranges are sampled one address per /24 unless
//! exhaustive mode is on; IPv6 ranges are always sampled.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Upper bound on samples drawn from a single IPv6 range
const MAX_V6_SAMPLES_PER_RANGE: u32 = 256;

/// Where candidates come from
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateSource {
    /// Comma separated addresses and CIDR ranges
    Inline(String),
    /// Already resolved addresses (health checks)
    Addresses(Vec<IpAddr>),
    /// Separate per-family range files
    FamilyFiles {
        v4: Option<PathBuf>,
        v6: Option<PathBuf>,
    },
    /// One combined range file
    File(PathBuf),
}

impl CandidateSource {
    /// Split a two-file source into one source per family.
    ///
    /// Any other source is returned unchanged as a single element.
    pub fn split_families(&self) -> Vec<(Option<AddressFamily>, CandidateSource)> {
        match self {
            CandidateSource::FamilyFiles {
                v4: Some(v4),
                v6: Some(v6),
            } => vec![
                (
                    Some(AddressFamily::V4),
                    CandidateSource::FamilyFiles {
                        v4: Some(v4.clone()),
                        v6: None,
                    },
                ),
                (
                    Some(AddressFamily::V6),
                    CandidateSource::FamilyFiles {
                        v4: None,
                        v6: Some(v6.clone()),
                    },
                ),
            ],
            other => vec![(None, other.clone())],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ipv4",
            AddressFamily::V6 => "ipv6",
        }
    }
}

/// One probe target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub addr: IpAddr,
    /// Range the address was drawn from, if any
    pub range: Option<String>,
}

impl Candidate {
    pub fn new(addr: IpAddr) -> Self {
        Self { addr, range: None }
    }
}

/// Expands ranges into candidates
#[derive(Debug, Clone, Default)]
pub struct CandidateSetBuilder {
    exhaustive: bool,
}

impl CandidateSetBuilder {
    pub fn new(exhaustive: bool) -> Self {
        Self { exhaustive }
    }

    pub fn build(&self, source: &CandidateSource) -> Result<Vec<Candidate>> {
        self.build_with_rng(source, &mut rand::thread_rng())
    }

    pub fn build_with_rng<R: Rng>(
        &self,
        source: &CandidateSource,
        rng: &mut R,
    ) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        match source {
            CandidateSource::Inline(text) => {
                for entry in text.split(',') {
                    self.expand_entry(entry, rng, &mut candidates);
                }
            }
            CandidateSource::Addresses(addrs) => {
                candidates.extend(addrs.iter().copied().map(Candidate::new));
            }
            CandidateSource::FamilyFiles { v4, v6 } => {
                for path in [v4, v6].into_iter().flatten() {
                    self.expand_file(path, rng, &mut candidates)?;
                }
            }
            CandidateSource::File(path) => {
                self.expand_file(path, rng, &mut candidates)?;
            }
        }

        let candidates = dedup(candidates);
        if candidates.is_empty() {
            return Err(Error::config(format!(
                "no candidate addresses from {}",
                describe(source)
            )));
        }

        info!(
            count = candidates.len(),
            exhaustive = self.exhaustive,
            "Candidate set built"
        );
        Ok(candidates)
    }

    fn expand_file<R: Rng>(
        &self,
        path: &Path,
        rng: &mut R,
        out: &mut Vec<Candidate>,
    ) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read range file {}: {}", path.display(), e))
        })?;
        for line in content.lines() {
            self.expand_entry(line, rng, out);
        }
        Ok(())
    }

    fn expand_entry<R: Rng>(&self, raw: &str, rng: &mut R, out: &mut Vec<Candidate>) {
        let entry = raw.trim();
        if entry.is_empty() || entry.starts_with('#') {
            return;
        }

        let net = match parse_range(entry) {
            Some(net) => net,
            None => {
                warn!("Skipping invalid address or range {:?}", entry);
                return;
            }
        };

        let before = out.len();
        match net {
            IpNet::V4(net) => self.expand_v4(net, entry, rng, out),
            IpNet::V6(net) => expand_v6(net, entry, rng, out),
        }
        debug!(range = entry, added = out.len() - before, "Expanded range");
    }

    fn expand_v4<R: Rng>(&self, net: Ipv4Net, tag: &str, rng: &mut R, out: &mut Vec<Candidate>) {
        let tag = Some(tag.to_string());

        if self.exhaustive {
            out.extend(net.hosts().map(|addr| Candidate {
                addr: IpAddr::V4(addr),
                range: tag.clone(),
            }));
            return;
        }

        if net.prefix_len() >= 24 {
            out.push(Candidate {
                addr: IpAddr::V4(random_v4_in(net, rng)),
                range: tag,
            });
            return;
        }

        // One random host per /24 block
        if let Ok(blocks) = net.subnets(24) {
            for block in blocks {
                let base = u32::from(block.network());
                let host = rng.gen_range(1..=254u32);
                out.push(Candidate {
                    addr: IpAddr::V4(Ipv4Addr::from(base | host)),
                    range: tag.clone(),
                });
            }
        }
    }
}

/// Parse a bare address or a CIDR range
fn parse_range(entry: &str) -> Option<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net.trunc());
    }
    entry.parse::<IpAddr>().ok().map(IpNet::from)
}

fn random_v4_in<R: Rng>(net: Ipv4Net, rng: &mut R) -> Ipv4Addr {
    let host_bits = 32 - u32::from(net.prefix_len());
    if host_bits == 0 {
        return net.network();
    }
    let mask = u32::MAX >> (32 - host_bits);
    let base = u32::from(net.network());
    Ipv4Addr::from(base | (rng.gen::<u32>() & mask))
}

/// IPv6 ranges are never enumerated: draw one random address per /120 block,
/// at most `MAX_V6_SAMPLES_PER_RANGE` per range.
fn expand_v6<R: Rng>(net: Ipv6Net, tag: &str, rng: &mut R, out: &mut Vec<Candidate>) {
    let host_bits = 128 - u32::from(net.prefix_len());
    if host_bits == 0 {
        out.push(Candidate {
            addr: IpAddr::V6(net.network()),
            range: Some(tag.to_string()),
        });
        return;
    }

    let blocks_bits = host_bits.saturating_sub(8);
    let samples = if blocks_bits >= 8 {
        MAX_V6_SAMPLES_PER_RANGE
    } else {
        (1u32 << blocks_bits).min(MAX_V6_SAMPLES_PER_RANGE)
    };

    let mask = u128::MAX >> (128 - host_bits);
    let base = u128::from(net.network());
    for _ in 0..samples {
        out.push(Candidate {
            addr: IpAddr::V6(Ipv6Addr::from(base | (rng.gen::<u128>() & mask))),
            range: Some(tag.to_string()),
        });
    }
}

fn dedup(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.addr))
        .collect()
}

fn describe(source: &CandidateSource) -> String {
    match source {
        CandidateSource::Inline(_) => "inline text".to_string(),
        CandidateSource::Addresses(_) => "address list".to_string(),
        CandidateSource::FamilyFiles { v4, v6 } => format!(
            "range files {}",
            [v4, v6]
                .into_iter()
                .flatten()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        CandidateSource::File(path) => format!("range file {}", path.display()),
    }
}
