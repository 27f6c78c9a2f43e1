use std::time::Duration;

use devclaim::cloud::{Clock, Cloud};
use devclaim::config::ConfigStorage;
use devclaim::workflow::{ClaimWorkflow, Progress};

use tokio::time::MissedTickBehavior;

use tokio_util::sync::CancellationToken;

use tracing::{debug, info, warn};

/// Drives a [`ClaimWorkflow`] on a fixed tick interval.
pub struct Runner<S, C, K>
where
    S: ConfigStorage,
    C: Cloud,
    K: Clock,
{
    workflow: ClaimWorkflow<S, C, K>,
    tick_interval: Duration,
}

impl<S, C, K> Runner<S, C, K>
where
    S: ConfigStorage,
    C: Cloud,
    K: Clock,
{
    /// Creates a [`Runner`].
    #[must_use]
    #[inline]
    pub const fn new(workflow: ClaimWorkflow<S, C, K>, tick_interval: Duration) -> Self {
        Self {
            workflow,
            tick_interval,
        }
    }

    /// Ticks the workflow until it succeeds or fails, or until the token is
    /// cancelled.
    ///
    /// Returns the last [`Progress`] of the workflow.
    pub async fn run(&mut self, cancellation_token: &CancellationToken) -> Progress {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            "Ticking the claim workflow every {} ms",
            self.tick_interval.as_millis()
        );

        loop {
            let progress = self.workflow.progress();
            if progress != Progress::InProgress {
                info!("Claim workflow ended with {progress}");
                return progress;
            }

            tokio::select! {
                () = cancellation_token.cancelled() => {
                    warn!("Claim workflow interrupted in state {}", self.workflow.state());
                    return progress;
                }
                _ = interval.tick() => self.workflow.tick(),
            }
        }
    }

    /// Returns a reference to the [`ClaimWorkflow`].
    #[must_use]
    #[inline]
    pub const fn workflow(&self) -> &ClaimWorkflow<S, C, K> {
        &self.workflow
    }

    /// Returns a mutable reference to the [`ClaimWorkflow`].
    #[must_use]
    #[inline]
    pub fn workflow_mut(&mut self) -> &mut ClaimWorkflow<S, C, K> {
        &mut self.workflow
    }

    /// Consumes the [`Runner`] and returns the [`ClaimWorkflow`].
    #[must_use]
    #[inline]
    pub fn into_inner(self) -> ClaimWorkflow<S, C, K> {
        self.workflow
    }
}
