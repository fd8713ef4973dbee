//! Ordered reconciliation phases
//!
//! A pass is a fixed list of phases run one after another against a mutable
//! spec snapshot. Each phase reports one of three outcomes: keep going, stop
//! the pass cleanly (nothing wrong, nothing more to do now), or fail the pass
//! with an error. Status mutations a phase makes to the spec are visible to
//! every later phase; persisting them is the caller's job.

use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use tessera_common::Error;

/// Result of running a single phase
#[derive(Debug)]
pub enum PhaseOutcome {
    /// Proceed to the next phase
    Continue,
    /// End the pass without error; later phases are skipped
    Stop {
        /// Ask the caller to come back after this long
        requeue_after: Option<Duration>,
    },
    /// End the pass with an error; later phases are skipped
    Fail(Error),
}

impl PhaseOutcome {
    /// Stop with no requeue request
    pub fn stop() -> Self {
        PhaseOutcome::Stop {
            requeue_after: None,
        }
    }

    /// Stop and ask to be requeued after `after`
    pub fn requeue_after(after: Duration) -> Self {
        PhaseOutcome::Stop {
            requeue_after: Some(after),
        }
    }

    /// True for [`PhaseOutcome::Continue`]
    pub fn is_continue(&self) -> bool {
        matches!(self, PhaseOutcome::Continue)
    }
}

impl From<Result<PhaseOutcome, Error>> for PhaseOutcome {
    fn from(result: Result<PhaseOutcome, Error>) -> Self {
        result.unwrap_or_else(PhaseOutcome::Fail)
    }
}

/// One step of a reconciliation pass
///
/// `C` is the shared context phases run against (clients, collaborators),
/// `S` is the spec snapshot they read and mutate.
#[async_trait]
pub trait Phase<C, S>: Send + Sync
where
    C: Sync,
    S: Send,
{
    /// Stable name used for log spans and error reporting
    fn name(&self) -> &str;

    /// Run the phase
    async fn run(&self, ctx: &C, spec: &mut S) -> PhaseOutcome;
}

/// How a pass ended when it did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassResult {
    /// Every phase returned `Continue`
    Completed,
    /// A phase stopped the pass early
    Stopped {
        /// Name of the phase that stopped
        phase: String,
        /// Requeue request from that phase
        requeue_after: Option<Duration>,
    },
}

impl PassResult {
    /// Map onto the controller work queue
    pub fn to_action(&self) -> Action {
        match self {
            PassResult::Stopped {
                requeue_after: Some(after),
                ..
            } => Action::requeue(*after),
            PassResult::Completed | PassResult::Stopped { .. } => Action::await_change(),
        }
    }

    /// True when every phase ran
    pub fn is_completed(&self) -> bool {
        matches!(self, PassResult::Completed)
    }
}

/// Runs registered phases in order
pub struct PhaseRunner<C, S>
where
    C: Sync,
    S: Send,
{
    phases: Vec<Box<dyn Phase<C, S>>>,
}

impl<C, S> Default for PhaseRunner<C, S>
where
    C: Sync,
    S: Send,
{
    fn default() -> Self {
        Self { phases: Vec::new() }
    }
}

impl<C, S> PhaseRunner<C, S>
where
    C: Sync,
    S: Send,
{
    /// Create an empty runner
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a phase; phases run in registration order
    pub fn register<P>(mut self, phase: P) -> Self
    where
        P: Phase<C, S> + 'static,
    {
        self.phases.push(Box::new(phase));
        self
    }

    /// Append every phase of another runner after this one's
    pub fn extend(mut self, other: PhaseRunner<C, S>) -> Self {
        self.phases.extend(other.phases);
        self
    }

    /// Names of the registered phases, in order
    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name()).collect()
    }

    /// Execute the phases in order
    ///
    /// Returns at the first `Stop` or `Fail`. Cancelling `cancel` drops the
    /// running phase's future and returns [`Error::Cancelled`].
    pub async fn run(
        &self,
        ctx: &C,
        spec: &mut S,
        cancel: &CancellationToken,
    ) -> Result<PassResult, Error> {
        for phase in &self.phases {
            let name = phase.name();
            let span = info_span!("phase", phase = %name);

            let outcome = async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    outcome = phase.run(ctx, &mut *spec) => Some(outcome),
                }
            }
            .instrument(span)
            .await;

            match outcome {
                None => {
                    warn!(phase = %name, "reconciliation cancelled");
                    return Err(Error::cancelled(name));
                }
                Some(PhaseOutcome::Continue) => {
                    debug!(phase = %name, "phase complete");
                }
                Some(PhaseOutcome::Stop { requeue_after }) => {
                    info!(phase = %name, ?requeue_after, "phase stopped reconciliation");
                    return Ok(PassResult::Stopped {
                        phase: name.to_string(),
                        requeue_after,
                    });
                }
                Some(PhaseOutcome::Fail(error)) => {
                    warn!(phase = %name, %error, "phase failed");
                    return Err(error);
                }
            }
        }

        Ok(PassResult::Completed)
    }
}
