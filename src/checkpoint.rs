//! Resumable step executor
//!
//! A [`CheckpointMachine`] is a table of steps keyed by checkpoint. Each step
//! returns an explicit [`Transition`]; the [`CheckpointDriver`] keeps the
//! stack of visited checkpoints (top = current step) and runs steps until the
//! machine finishes or fails.
//!
//! Retries are per step: a step whose error the machine classifies as
//! retryable is re-run at the same checkpoint, consuming one unit of a
//! consecutive-failure budget that is refilled on every successful
//! transition. Every other error is terminal.

use async_trait::async_trait;
use std::fmt::Debug;

/// Default consecutive-failure budget
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<C> {
    /// Advance to another checkpoint
    Next(C),
    /// Terminal success
    Finish,
    /// Terminal failure with a reason, never retried
    Fail(String),
}

/// Driver errors, generic over the machine's step error
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError<E>
where
    E: std::error::Error + 'static,
{
    /// Step reported [`Transition::Fail`]
    #[error("Step {checkpoint} failed: {reason}")]
    Failed { checkpoint: String, reason: String },

    /// Step returned a non-retryable error
    #[error("Step {checkpoint} aborted: {source}")]
    Step {
        checkpoint: String,
        #[source]
        source: E,
    },

    /// Too many consecutive retryable errors
    #[error("Step {checkpoint} exhausted its retry budget of {budget}: {source}")]
    BudgetExhausted {
        checkpoint: String,
        budget: u32,
        #[source]
        source: E,
    },

    /// Step asked to re-enter its own checkpoint
    #[error("State machine stalled at step {0}")]
    Stalled(String),
}

impl<E> CheckpointError<E>
where
    E: std::error::Error + 'static,
{
    /// The step error behind this failure, if any
    pub fn into_source(self) -> Option<E> {
        match self {
            CheckpointError::Step { source, .. } | CheckpointError::BudgetExhausted { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// A resumable multi-step procedure
#[async_trait]
pub trait CheckpointMachine: Send {
    type Checkpoint: Copy + Debug + PartialEq + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// First step to run
    fn initial(&self) -> Self::Checkpoint;

    /// Perform the work of `checkpoint`
    async fn run(
        &mut self,
        checkpoint: Self::Checkpoint,
    ) -> Result<Transition<Self::Checkpoint>, Self::Error>;

    /// Whether `error` may be cured by re-running the same step
    fn is_retryable(&self, _error: &Self::Error) -> bool {
        false
    }
}

/// Runs a [`CheckpointMachine`] to completion
#[derive(Debug, Clone, Copy)]
pub struct CheckpointDriver {
    retry_budget: u32,
}

impl Default for CheckpointDriver {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BUDGET)
    }
}

impl CheckpointDriver {
    pub fn new(retry_budget: u32) -> Self {
        Self { retry_budget }
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Drive `machine` from its initial checkpoint until it finishes.
    ///
    /// Returns the checkpoint stack in visiting order on success.
    pub async fn drive<M>(&self, machine: &mut M) -> Result<Vec<M::Checkpoint>, CheckpointError<M::Error>>
    where
        M: CheckpointMachine,
    {
        let mut current = machine.initial();
        let mut stack = vec![current];
        let mut failures = 0u32;

        loop {
            match machine.run(current).await {
                Ok(Transition::Next(next)) => {
                    if next == current {
                        return Err(CheckpointError::Stalled(format!("{:?}", current)));
                    }
                    log::trace!("Checkpoint {:?} -> {:?}", current, next);
                    failures = 0;
                    stack.push(next);
                    current = next;
                }
                Ok(Transition::Finish) => {
                    log::trace!("Checkpoint {:?} finished the machine", current);
                    return Ok(stack);
                }
                Ok(Transition::Fail(reason)) => {
                    return Err(CheckpointError::Failed {
                        checkpoint: format!("{:?}", current),
                        reason,
                    });
                }
                Err(e) if machine.is_retryable(&e) => {
                    failures += 1;
                    if failures > self.retry_budget {
                        return Err(CheckpointError::BudgetExhausted {
                            checkpoint: format!("{:?}", current),
                            budget: self.retry_budget,
                            source: e,
                        });
                    }
                    log::debug!(
                        "Checkpoint {:?} failed ({}/{}), retrying: {}",
                        current,
                        failures,
                        self.retry_budget,
                        e
                    );
                }
                Err(e) => {
                    return Err(CheckpointError::Step {
                        checkpoint: format!("{:?}", current),
                        source: e,
                    });
                }
            }
        }
    }
}
