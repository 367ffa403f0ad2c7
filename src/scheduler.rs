use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::engine::{CycleOutcome, Engine};

/// Cloneable shutdown listener. Every wait in the engine goes through
/// [`Shutdown::sleep`] so a termination signal cuts it short.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn new() -> (Shutdown, ShutdownTrigger) {
        let (tx, rx) = watch::channel(false);
        (Shutdown { rx }, ShutdownTrigger { tx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered; never resolves if the trigger was dropped unused.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleeps for `d`; returns false if shutdown interrupted the wait.
    pub async fn sleep(&self, d: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => true,
            _ = self.wait() => false,
        }
    }
}

/// Normal or fast cadence, decided after every cycle.
pub fn next_interval(outcome: &CycleOutcome, normal: Duration, fast: Duration) -> Duration {
    if outcome.any_open {
        fast
    } else {
        normal
    }
}

pub async fn check_loop(engine: Arc<Engine>, shutdown: Shutdown) {
    let cfg = engine.config();
    let (normal, fast) = (cfg.check_interval, cfg.fast_check_interval);
    info!(?normal, ?fast, "check loop started");

    loop {
        let outcome = engine.run_check().await;
        engine.run_timers(chrono::Utc::now()).await;

        let wait = next_interval(&outcome, normal, fast);
        debug!(?wait, any_open = outcome.any_open, "next check scheduled");
        if !shutdown.sleep(wait).await {
            break;
        }
    }
    info!("check loop stopped");
}

pub async fn command_loop(engine: Arc<Engine>, shutdown: Shutdown) {
    let every = engine.config().command_poll;
    info!(?every, "command loop started");

    while !shutdown.is_triggered() {
        engine.poll_commands().await;
        if !shutdown.sleep(every).await {
            break;
        }
    }
    info!("command loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_switches_on_open_entities() {
        let normal = Duration::from_secs(60);
        let fast = Duration::from_secs(15);
        let quiet = CycleOutcome::default();
        let hot = CycleOutcome {
            any_open: true,
            ..CycleOutcome::default()
        };
        assert_eq!(next_interval(&quiet, normal, fast), normal);
        assert_eq!(next_interval(&hot, normal, fast), fast);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_shutdown() {
        let (shutdown, trigger) = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        trigger.trigger();
        assert!(!handle.await.unwrap());
        assert!(!shutdown.sleep(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trigger_does_not_cut_sleep() {
        let (shutdown, trigger) = Shutdown::new();
        drop(trigger);
        assert!(shutdown.sleep(Duration::from_secs(5)).await);
    }
}
