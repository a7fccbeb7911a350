//! Health Cycle
//!
//! Keeps a long-running deployment's published records on good addresses.
//! Two timers drive it:
//! - the health-check timer re-probes only the published set against the
//!   stricter health bounds and triggers a full test on any degradation
//! - the full-test timer re-runs the whole pipeline unconditionally
//!
//! Actions run one at a time inside the select loop. A tick missed while
//! an action runs is delivered once when it finishes, never more than once.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::SpeedTestRunner;
use crate::config::HealthCycleConfig;

const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    FullTestRunning,
    Monitoring,
    HealthCheckRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    HealthCheck,
    FullTest,
}

/// What a timer tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every published address passed the health bounds
    Healthy { checked: usize },
    /// Some published addresses failed; a full test replaced the set
    Degraded {
        checked: usize,
        survivors: usize,
        published: usize,
    },
    /// Scheduled full test
    FullTest { published: usize },
    /// Tick arrived while another action was running
    Skipped,
}

impl TickOutcome {
    /// The other timer to restart after this outcome, if any
    pub fn resets(&self) -> Option<Timer> {
        match self {
            TickOutcome::Degraded { .. } => Some(Timer::FullTest),
            TickOutcome::FullTest { .. } => Some(Timer::HealthCheck),
            TickOutcome::Healthy { .. } | TickOutcome::Skipped => None,
        }
    }
}

pub struct HealthCycleController<R: SpeedTestRunner> {
    runner: R,
    config: HealthCycleConfig,
    state: CycleState,
    published: Vec<IpAddr>,
}

impl<R: SpeedTestRunner> HealthCycleController<R> {
    pub fn new(runner: R, config: HealthCycleConfig) -> Self {
        Self {
            runner,
            config,
            state: CycleState::Idle,
            published: Vec::new(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Addresses the next health check will re-probe
    pub fn published(&self) -> &[IpAddr] {
        &self.published
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    async fn full_test(&mut self) -> usize {
        self.state = CycleState::FullTestRunning;
        self.published = self.runner.full_test().await;
        self.state = CycleState::Monitoring;
        self.published.len()
    }

    /// Initial full test; establishes the first published set
    pub async fn start(&mut self) -> usize {
        info!("Starting health cycle with an initial full test");
        self.full_test().await
    }

    pub async fn on_health_tick(&mut self) -> TickOutcome {
        if self.state != CycleState::Monitoring {
            debug!("Health check skipped in state {:?}", self.state);
            return TickOutcome::Skipped;
        }

        self.state = CycleState::HealthCheckRunning;
        let checked = self.published.len();
        info!("Checking delay and loss of {} published addresses", checked);
        let published = self.published.clone();
        let survivors = self.runner.health_check(&published).await;

        if survivors < checked {
            warn!(
                "{} of {} published addresses exceeded the health bounds, running a full test",
                checked - survivors,
                checked
            );
            let published = self.full_test().await;
            TickOutcome::Degraded {
                checked,
                survivors,
                published,
            }
        } else {
            info!("All {} published addresses within the health bounds", checked);
            self.state = CycleState::Monitoring;
            TickOutcome::Healthy { checked }
        }
    }

    pub async fn on_full_test_tick(&mut self) -> TickOutcome {
        if self.state != CycleState::Monitoring {
            debug!("Full test skipped in state {:?}", self.state);
            return TickOutcome::Skipped;
        }
        info!("Scheduled full test starting");
        let published = self.full_test().await;
        TickOutcome::FullTest { published }
    }

    /// Initial full test, then both timers until `shutdown` resolves
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            _ = self.start() => {}
            _ = &mut shutdown => {
                info!("Shutdown during initial full test");
                return;
            }
        }

        let mut check = timer(self.config.check_interval);
        let mut full = timer(self.config.full_test_interval);
        info!(
            "Monitoring: health check every {:?}, full test every {:?}",
            check.period(),
            full.period()
        );

        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => {
                    info!("Health cycle stopped");
                    break;
                }
                _ = full.tick() => self.on_full_test_tick().await,
                _ = check.tick() => self.on_health_tick().await,
            };

            match outcome.resets() {
                Some(Timer::FullTest) => full.reset(),
                Some(Timer::HealthCheck) => check.reset(),
                None => {}
            }
        }
    }
}

/// First tick one period from now; missed ticks collapse into one late tick
fn timer(period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each full test publishes `set`; health checks report the scripted survivors
    struct ScriptedRunner {
        set: Vec<IpAddr>,
        survivors: Vec<usize>,
        full_tests: usize,
        health_checks: usize,
        checked: Vec<Vec<IpAddr>>,
    }

    impl ScriptedRunner {
        fn new(set: &[&str], survivors: &[usize]) -> Self {
            Self {
                set: set.iter().map(|s| s.parse().unwrap()).collect(),
                survivors: survivors.to_vec(),
                full_tests: 0,
                health_checks: 0,
                checked: Vec::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl SpeedTestRunner for ScriptedRunner {
        async fn full_test(&mut self) -> Vec<IpAddr> {
            self.full_tests += 1;
            self.set.clone()
        }

        async fn health_check(&mut self, published: &[IpAddr]) -> usize {
            self.checked.push(published.to_vec());
            let survivors = self
                .survivors
                .get(self.health_checks)
                .copied()
                .unwrap_or(published.len());
            self.health_checks += 1;
            survivors
        }
    }

    fn config(check_ms: u64, full_ms: u64) -> HealthCycleConfig {
        HealthCycleConfig {
            check_interval: Duration::from_millis(check_ms),
            full_test_interval: Duration::from_millis(full_ms),
            max_delay: Duration::from_millis(300),
            max_loss_rate: 0.2,
        }
    }

    #[tokio::test]
    async fn test_healthy_check_keeps_monitoring() {
        let runner = ScriptedRunner::new(&["1.1.1.1", "1.0.0.1"], &[2]);
        let mut controller = HealthCycleController::new(runner, config(1000, 60_000));
        assert_eq!(controller.state(), CycleState::Idle);

        assert_eq!(controller.start().await, 2);
        assert_eq!(controller.state(), CycleState::Monitoring);

        let outcome = controller.on_health_tick().await;
        assert_eq!(outcome, TickOutcome::Healthy { checked: 2 });
        assert_eq!(outcome.resets(), None);
        assert_eq!(controller.runner().full_tests, 1);
        assert_eq!(controller.state(), CycleState::Monitoring);
    }

    #[tokio::test]
    async fn test_degraded_check_runs_one_full_test() {
        let runner = ScriptedRunner::new(&["1.1.1.1", "1.0.0.1"], &[1]);
        let mut controller = HealthCycleController::new(runner, config(1000, 60_000));
        controller.start().await;

        let outcome = controller.on_health_tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Degraded {
                checked: 2,
                survivors: 1,
                published: 2
            }
        );
        assert_eq!(outcome.resets(), Some(Timer::FullTest));
        assert_eq!(controller.runner().full_tests, 2);
        assert_eq!(controller.state(), CycleState::Monitoring);
    }

    #[tokio::test]
    async fn test_full_test_tick_resets_health_timer() {
        let runner = ScriptedRunner::new(&["1.1.1.1"], &[]);
        let mut controller = HealthCycleController::new(runner, config(1000, 60_000));
        controller.start().await;

        let outcome = controller.on_full_test_tick().await;
        assert_eq!(outcome, TickOutcome::FullTest { published: 1 });
        assert_eq!(outcome.resets(), Some(Timer::HealthCheck));
        assert_eq!(controller.runner().full_tests, 2);
    }

    #[tokio::test]
    async fn test_checks_target_latest_published_set() {
        let runner = ScriptedRunner::new(&["1.1.1.1", "1.0.0.1"], &[2]);
        let mut controller = HealthCycleController::new(runner, config(1000, 60_000));
        controller.start().await;
        controller.on_health_tick().await;

        let expected: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "1.0.0.1".parse().unwrap()];
        assert_eq!(controller.runner().checked, vec![expected.clone()]);
        assert_eq!(controller.published(), expected.as_slice());
    }

    #[tokio::test]
    async fn test_ticks_before_start_are_skipped() {
        let runner = ScriptedRunner::new(&["1.1.1.1"], &[]);
        let mut controller = HealthCycleController::new(runner, config(1000, 60_000));

        assert_eq!(controller.on_health_tick().await, TickOutcome::Skipped);
        assert_eq!(controller.on_full_test_tick().await, TickOutcome::Skipped);
        assert_eq!(controller.runner().full_tests, 0);
        assert_eq!(controller.runner().health_checks, 0);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        // every health check degrades; 1s minimum period keeps ticks sparse
        let runner = ScriptedRunner::new(&["1.1.1.1"], &[0, 0, 0, 0]);
        let mut controller = HealthCycleController::new(runner, config(1000, 3_600_000));

        controller
            .run_until(tokio::time::sleep(Duration::from_millis(1500)))
            .await;

        assert_eq!(controller.runner().health_checks, 1);
        assert_eq!(controller.runner().full_tests, 2);
        assert_eq!(controller.state(), CycleState::Monitoring);
    }
}
