//! Candidate expansion and measurement
//!
//! Data flows one way through this module:
//! 1. `CandidateSetBuilder` expands ranges into candidates
//! 2. `LatencyProber` runs repeated trials per candidate
//! 3. `RankedSet` orders the results and applies delay/loss bounds
//! 4. `ThroughputProber` measures download speed on the best candidates

pub mod candidates;
pub mod latency;
pub mod result;
pub mod throughput;

pub use candidates::{AddressFamily, Candidate, CandidateSetBuilder, CandidateSource};
pub use latency::{
    region_from_headers, trial_probe_for, ConnectProbe, LatencyConfig, LatencyProber, ProbeMode,
    RequestProbe, RequestProbeConfig, TrialOutcome, TrialProbe, DEFAULT_ACCEPTED_CODES,
    MAX_CONCURRENCY,
};
pub use result::{
    compare_ranked, sort_by_throughput, FilterBounds, ProbeResult, RankedResult, RankedSet,
    DEFAULT_MAX_DELAY, DEFAULT_MAX_LOSS_RATE, DEFAULT_MIN_DELAY,
};
pub use throughput::{HttpDownloadProbe, SpeedProbe, ThroughputConfig, ThroughputProber};
