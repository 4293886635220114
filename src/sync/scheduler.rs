use anyhow::Result;
use log::{error, info};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::CycleSummary;

/// Observable scheduler states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoUpdateState {
    Idle,
    Running,
    WaitingForNextCycle,
    Stopped,
}

/// Runs sync cycles on a timer until a total duration elapses or the run is
/// cancelled. Cancellation is advisory: an in-flight cycle always completes,
/// and the waiting loop rechecks the token at short sub-intervals so
/// cancellation latency stays well below the full poll interval.
pub struct AutoUpdater {
    state_tx: watch::Sender<AutoUpdateState>,
    cancel: CancellationToken,
    poll_interval: Duration,
    run_duration: Duration,
    cancel_check_interval: Duration,
}

impl AutoUpdater {
    pub fn new(
        poll_interval: Duration,
        run_duration: Duration,
        cancel_check_interval: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(AutoUpdateState::Idle);
        Self {
            state_tx,
            cancel: CancellationToken::new(),
            poll_interval,
            run_duration,
            cancel_check_interval,
        }
    }

    pub fn state(&self) -> watch::Receiver<AutoUpdateState> {
        self.state_tx.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: AutoUpdateState) {
        let _ = self.state_tx.send(state);
    }

    /// Waits out the poll interval in cancel-check slices. Returns false when
    /// the loop should stop instead of starting another cycle.
    async fn wait_for_next_cycle(&self, deadline: Instant) -> bool {
        let wait_until = Instant::now() + self.poll_interval;
        while Instant::now() < wait_until {
            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                return false;
            }
            let remaining = wait_until.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(self.cancel_check_interval)).await;
        }
        !self.cancel.is_cancelled() && Instant::now() < deadline
    }

    /// The auto-update loop. Each iteration invokes `cycle` once, logging
    /// (not propagating) its error so transient failures never kill the
    /// loop.
    pub async fn run<F, Fut>(&self, mut cycle: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CycleSummary>>,
    {
        let deadline = Instant::now() + self.run_duration;
        info!(
            "auto-update started: cycle every {:?} for {:?}",
            self.poll_interval, self.run_duration
        );
        loop {
            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                break;
            }
            self.set_state(AutoUpdateState::Running);
            match cycle().await {
                Ok(summary) => info!(
                    "cycle finished in {:.3} secs",
                    summary.elapsed.as_secs_f64()
                ),
                Err(e) => error!("cycle failed: {:#}", e),
            }
            self.set_state(AutoUpdateState::WaitingForNextCycle);
            if !self.wait_for_next_cycle(deadline).await {
                break;
            }
        }
        self.set_state(AutoUpdateState::Stopped);
        info!("auto-update stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn summary() -> CycleSummary {
        CycleSummary::default()
    }

    #[tokio::test]
    async fn stops_when_the_run_duration_elapses() {
        let updater = AutoUpdater::new(
            Duration::from_millis(20),
            Duration::from_millis(90),
            Duration::from_millis(5),
        );
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cycles);
        updater
            .run(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(summary())
                }
            })
            .await;
        assert!(cycles.load(Ordering::SeqCst) >= 1);
        assert_eq!(*updater.state().borrow(), AutoUpdateState::Stopped);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_cycles() {
        let updater = Arc::new(AutoUpdater::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_millis(10),
        ));
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cycles);
        let runner = {
            let updater = Arc::clone(&updater);
            tokio::spawn(async move {
                updater
                    .run(move || {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(summary())
                        }
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancelled_at = Instant::now();
        updater.cancel();
        runner.await.unwrap();
        // Latency is bounded by the check interval, not the poll interval.
        assert!(cancelled_at.elapsed() < Duration::from_secs(5));
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        assert_eq!(*updater.state().borrow(), AutoUpdateState::Stopped);
    }

    #[tokio::test]
    async fn cycle_errors_do_not_stop_the_loop() {
        let updater = AutoUpdater::new(
            Duration::from_millis(10),
            Duration::from_millis(80),
            Duration::from_millis(5),
        );
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cycles);
        updater
            .run(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("transient"))
                }
            })
            .await;
        assert!(cycles.load(Ordering::SeqCst) >= 2);
    }
}
