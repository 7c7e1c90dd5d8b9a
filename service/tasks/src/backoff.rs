//! Track errors and successes to incrementally delay retries.
use std::time::Duration;

use anyhow::Error;
use anyhow::Result;

use tributary_context::Context;

use crate::conf::BackoffConf;
use crate::error::RetriesExceeded;

/// Track failures and successes to incrementally delay retries.
///
/// Intended for looping operations:
///
/// - When a loop iteration fails call [`Backoff::retry`].
/// - When an iteration completes call [`Backoff::success`] to clear the
///   memory of previous failures.
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    max_retries: u16,
    multiplier: u32,
    seen: u16,
    start_delay: Duration,
}

impl Backoff {
    /// Initialise a new backoff engine.
    pub fn new(conf: &BackoffConf) -> Backoff {
        let start_delay = Duration::from_millis(conf.start_delay);
        Backoff {
            delay: start_delay,
            max_delay: Duration::from_secs(conf.max_delay),
            max_retries: conf.max_retries,
            multiplier: conf.multiplier,
            seen: 0,
            start_delay,
        }
    }

    /// The loop encountered an error and needs to delay the next cycle.
    ///
    /// Once the loop has failed too many consecutive times the original
    /// error is reported back so the loop can fail properly. Otherwise the
    /// call sleeps for an incrementally longer period, up to the cap.
    pub async fn retry(&mut self, context: &Context, error: Error) -> Result<()> {
        self.seen += 1;
        if self.seen > self.max_retries {
            let cause = RetriesExceeded::new(self.max_retries);
            return Err(error.context(cause));
        }
        slog::warn!(
            context.logger, "Transient failure, delaying the next attempt";
            "error" => %error, "delay_ms" => self.delay.as_millis() as u64,
        );
        tokio::time::sleep(self.delay).await;
        self.delay = std::cmp::min(self.delay * self.multiplier, self.max_delay);
        Ok(())
    }

    /// Reset the state of tracked failures.
    pub fn success(&mut self) {
        self.delay = self.start_delay;
        self.seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use tributary_context::Context;

    use super::Backoff;
    use super::BackoffConf;
    use crate::error::RetriesExceeded;

    fn quick_conf() -> BackoffConf {
        BackoffConf {
            max_delay: 1,
            max_retries: 2,
            multiplier: 2,
            start_delay: 1,
        }
    }

    #[tokio::test]
    async fn fails_after_max_retries() {
        let context = Context::fixture();
        let mut backoff = Backoff::new(&quick_conf());
        backoff
            .retry(&context, anyhow::anyhow!("boom"))
            .await
            .unwrap();
        backoff
            .retry(&context, anyhow::anyhow!("boom"))
            .await
            .unwrap();
        let error = backoff
            .retry(&context, anyhow::anyhow!("boom"))
            .await
            .unwrap_err();
        assert!(error.is::<RetriesExceeded>());
    }

    #[tokio::test]
    async fn success_resets_the_budget() {
        let context = Context::fixture();
        let mut backoff = Backoff::new(&quick_conf());
        for _ in 0..2 {
            backoff
                .retry(&context, anyhow::anyhow!("boom"))
                .await
                .unwrap();
        }
        backoff.success();
        for _ in 0..2 {
            backoff
                .retry(&context, anyhow::anyhow!("boom"))
                .await
                .unwrap();
        }
    }
}
