//! Probe results, ranking and delay/loss filtering

use std::cmp::Ordering;
use std::net::IpAddr;
use std::time::Duration;

use tracing::debug;

/// `max_delay` sentinel: no upper bound
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(9999);
/// `min_delay` sentinel: no lower bound
pub const DEFAULT_MIN_DELAY: Duration = Duration::ZERO;
/// `max_loss_rate` sentinel: accept all
pub const DEFAULT_MAX_LOSS_RATE: f64 = 1.0;

/// Outcome of latency probing one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub addr: IpAddr,
    pub sent: u32,
    pub received: u32,
    /// Mean over successful trials; `None` when nothing succeeded
    pub delay: Option<Duration>,
    pub region: Option<String>,
}

impl ProbeResult {
    /// Build from raw trial counters. `total` is the summed latency of the
    /// successful trials.
    pub fn from_trials(
        addr: IpAddr,
        sent: u32,
        received: u32,
        total: Duration,
        region: Option<String>,
    ) -> Self {
        let received = received.min(sent);
        let delay = if received > 0 {
            Some(total / received)
        } else {
            None
        };
        Self {
            addr,
            sent,
            received,
            delay,
            region,
        }
    }

    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            return 1.0;
        }
        f64::from(self.sent - self.received) / f64::from(self.sent)
    }
}

/// A probe result placed in the ranking, with throughput attached later
#[derive(Debug, Clone, PartialEq)]
pub struct RankedResult {
    pub probe: ProbeResult,
    loss_rate: f64,
    /// Bytes per second, set by the throughput phase
    pub throughput: Option<f64>,
}

impl RankedResult {
    pub fn new(probe: ProbeResult) -> Self {
        let loss_rate = probe.loss_rate();
        Self {
            probe,
            loss_rate,
            throughput: None,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.probe.addr
    }

    pub fn loss_rate(&self) -> f64 {
        self.loss_rate
    }

    pub fn delay(&self) -> Duration {
        self.probe.delay.unwrap_or(Duration::MAX)
    }

    pub fn throughput(&self) -> f64 {
        self.throughput.unwrap_or(0.0)
    }

    /// Throughput in MB/s
    pub fn throughput_mb(&self) -> f64 {
        self.throughput() / 1024.0 / 1024.0
    }

    pub fn with_throughput(mut self, bytes_per_sec: f64) -> Self {
        self.throughput = Some(bytes_per_sec);
        self
    }
}

/// Ascending loss rate, then ascending delay, then descending throughput
pub fn compare_ranked(a: &RankedResult, b: &RankedResult) -> Ordering {
    a.loss_rate
        .total_cmp(&b.loss_rate)
        .then_with(|| a.delay().cmp(&b.delay()))
        .then_with(|| b.throughput().total_cmp(&a.throughput()))
}

/// Delay and loss acceptance bounds
#[derive(Debug, Clone, PartialEq)]
pub struct FilterBounds {
    pub max_delay: Duration,
    pub min_delay: Duration,
    pub max_loss_rate: f64,
}

impl Default for FilterBounds {
    fn default() -> Self {
        Self {
            max_delay: DEFAULT_MAX_DELAY,
            min_delay: DEFAULT_MIN_DELAY,
            max_loss_rate: DEFAULT_MAX_LOSS_RATE,
        }
    }
}

/// Results in ranking order.
///
/// The filters stop at the first element that fails an upper bound, which is
/// only correct on ranked input. `rank` is the normal way in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedSet(Vec<RankedResult>);

impl RankedSet {
    /// Drop candidates with no successful trial, then sort by loss and delay
    pub fn rank(results: Vec<ProbeResult>) -> Self {
        let mut ranked: Vec<RankedResult> = results
            .into_iter()
            .filter(|r| r.received > 0)
            .map(RankedResult::new)
            .collect();
        ranked.sort_by(compare_ranked);
        Self(ranked)
    }

    /// Wrap results the caller has already put in ranking order
    pub fn from_sorted(results: Vec<RankedResult>) -> Self {
        Self(results)
    }

    /// Delay filter. Stops at the first result above `max_delay` and skips
    /// results below `min_delay`. No-op when both bounds are the sentinels.
    pub fn filter_delay(self, bounds: &FilterBounds) -> Self {
        if bounds.max_delay > DEFAULT_MAX_DELAY || bounds.min_delay < DEFAULT_MIN_DELAY {
            return self;
        }
        if bounds.max_delay == DEFAULT_MAX_DELAY && bounds.min_delay == DEFAULT_MIN_DELAY {
            return self;
        }

        let before = self.0.len();
        let mut kept = Vec::with_capacity(before);
        for result in self.0 {
            if result.delay() > bounds.max_delay {
                break;
            }
            if result.delay() < bounds.min_delay {
                continue;
            }
            kept.push(result);
        }
        debug!(before, after = kept.len(), "Delay filter applied");
        Self(kept)
    }

    /// Loss filter. Stops at the first result above `max_loss_rate`.
    pub fn filter_loss_rate(self, bounds: &FilterBounds) -> Self {
        if bounds.max_loss_rate >= DEFAULT_MAX_LOSS_RATE {
            return self;
        }

        let before = self.0.len();
        let kept: Vec<RankedResult> = self
            .0
            .into_iter()
            .take_while(|r| r.loss_rate() <= bounds.max_loss_rate)
            .collect();
        debug!(before, after = kept.len(), "Loss filter applied");
        Self(kept)
    }

    /// Both filters, delay first
    pub fn apply(self, bounds: &FilterBounds) -> Self {
        self.filter_delay(bounds).filter_loss_rate(bounds)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RankedResult> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[RankedResult] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<RankedResult> {
        self.0
    }
}

/// Final order once throughput is known: fastest first
pub fn sort_by_throughput(results: &mut [RankedResult]) {
    results.sort_by(|a, b| {
        b.throughput()
            .total_cmp(&a.throughput())
            .then_with(|| compare_ranked(a, b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn probe(last: u8, sent: u32, received: u32, delay_ms: u64) -> ProbeResult {
        ProbeResult::from_trials(
            ip(last),
            sent,
            received,
            Duration::from_millis(delay_ms * u64::from(received)),
            None,
        )
    }

    /// Result with an exact loss rate and delay
    fn ranked(last: u8, delay_ms: u64, loss: f64) -> RankedResult {
        let sent = 10;
        let received = sent - (loss * f64::from(sent)).round() as u32;
        RankedResult::new(probe(last, sent, received, delay_ms))
    }

    fn addrs(set: &RankedSet) -> Vec<IpAddr> {
        set.iter().map(|r| r.addr()).collect()
    }

    #[test]
    fn test_loss_rate_and_mean_delay() {
        let r = probe(1, 4, 3, 20);
        assert_eq!(r.loss_rate(), 0.25);
        assert_eq!(r.delay, Some(Duration::from_millis(20)));

        let none = probe(2, 4, 0, 0);
        assert_eq!(none.loss_rate(), 1.0);
        assert_eq!(none.delay, None);

        // received is clamped to sent
        let clamped = ProbeResult::from_trials(ip(3), 2, 5, Duration::from_millis(10), None);
        assert_eq!(clamped.received, 2);
        assert_eq!(clamped.loss_rate(), 0.0);
    }

    #[test]
    fn test_rank_orders_by_loss_then_delay_and_drops_dead() {
        let set = RankedSet::rank(vec![
            probe(1, 4, 4, 90),
            probe(2, 4, 3, 10),
            probe(3, 4, 4, 30),
            probe(4, 4, 0, 0),
        ]);
        assert_eq!(addrs(&set), vec![ip(3), ip(1), ip(2)]);
    }

    #[test]
    fn test_throughput_breaks_ties() {
        let a = RankedResult::new(probe(1, 4, 4, 30)).with_throughput(100.0);
        let b = RankedResult::new(probe(2, 4, 4, 30)).with_throughput(500.0);
        assert_eq!(compare_ranked(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_default_bounds_are_noops() {
        let set = RankedSet::rank(vec![
            probe(1, 4, 4, 9000),
            probe(2, 4, 1, 10),
            probe(3, 4, 4, 5),
        ]);
        let filtered = set.clone().apply(&FilterBounds::default());
        assert_eq!(filtered, set);
    }

    #[test]
    fn test_filter_delay_stops_at_first_over_bound() {
        let set = RankedSet::from_sorted(vec![
            ranked(1, 50, 0.0),
            ranked(2, 80, 0.1),
            ranked(3, 150, 0.0),
            ranked(4, 60, 0.5),
        ]);
        let bounds = FilterBounds {
            max_delay: Duration::from_millis(100),
            min_delay: Duration::ZERO,
            ..FilterBounds::default()
        };
        let filtered = set.filter_delay(&bounds);
        assert_eq!(addrs(&filtered), vec![ip(1), ip(2)]);
    }

    #[test]
    fn test_filter_delay_skips_below_minimum() {
        let set = RankedSet::from_sorted(vec![
            ranked(1, 5, 0.0),
            ranked(2, 40, 0.0),
            ranked(3, 60, 0.0),
        ]);
        let bounds = FilterBounds {
            min_delay: Duration::from_millis(10),
            ..FilterBounds::default()
        };
        assert_eq!(addrs(&set.filter_delay(&bounds)), vec![ip(2), ip(3)]);
    }

    #[test]
    fn test_filter_delay_out_of_range_bound_is_noop() {
        let set = RankedSet::from_sorted(vec![ranked(1, 20_000, 0.0)]);
        let bounds = FilterBounds {
            max_delay: Duration::from_secs(60),
            ..FilterBounds::default()
        };
        assert_eq!(set.clone().filter_delay(&bounds), set);
    }

    #[test]
    fn test_filter_loss_stops_at_first_over_bound() {
        let set = RankedSet::rank(vec![
            probe(1, 10, 10, 50),
            probe(2, 10, 9, 20),
            probe(3, 10, 5, 10),
            probe(4, 10, 8, 5),
        ]);
        let bounds = FilterBounds {
            max_loss_rate: 0.15,
            ..FilterBounds::default()
        };
        assert_eq!(addrs(&set.filter_loss_rate(&bounds)), vec![ip(1), ip(2)]);
    }

    #[test]
    fn test_sort_by_throughput() {
        let mut results = vec![
            RankedResult::new(probe(1, 4, 4, 10)).with_throughput(1.0),
            RankedResult::new(probe(2, 4, 4, 20)).with_throughput(9.0),
            RankedResult::new(probe(3, 4, 4, 30)).with_throughput(5.0),
        ];
        sort_by_throughput(&mut results);
        let order: Vec<IpAddr> = results.iter().map(|r| r.addr()).collect();
        assert_eq!(order, vec![ip(2), ip(3), ip(1)]);
    }
}
