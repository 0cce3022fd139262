use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::runnable::Runnable;

/// Calls a function every `period` until closed. The first call happens one period after
/// `run` starts.
pub struct Ticker {
    period: Duration,
    tick: Box<dyn Fn() + Send + Sync>,
    token: CancellationToken,
}

impl Ticker {
    pub fn new(period: Duration, tick: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            period,
            tick: Box::new(tick),
            token: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Runnable for Ticker {
    async fn run(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.period.is_zero(), "ticker period must be positive");

        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = interval.tick() => (self.tick)(),
            }
        }
        debug!("Ticker stopped");
        Ok(())
    }

    async fn close(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_closed() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = Arc::new(Ticker::new(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let running = ticker.clone();
        let task = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(3500)).await;
        ticker.close().await;
        task.await.unwrap().unwrap();

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_period_is_rejected() {
        let ticker = Ticker::new(Duration::ZERO, || {});
        assert!(ticker.run().await.is_err());
    }
}
