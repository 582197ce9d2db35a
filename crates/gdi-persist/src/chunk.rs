//! Chunk commit lifecycle.
//!
//! `Pending -> Committing -> Committed`, with `Committing -> Retrying -> Committing`
//! for a failure the retry policy still covers and `Failed` once it does not.
//! Chunks never started because an earlier chunk of the same batch failed end
//! in `Aborted`.

use serde::Serialize;
use thiserror::Error;

use crate::store::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra commit attempts after the first failure.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Committing {
        attempt: u32,
    },
    Retrying {
        attempt: u32,
        reason: String,
    },
    Committed {
        inserted: u64,
        skipped: u64,
        deduplicated: u64,
    },
    Failed {
        reason: String,
    },
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    Begin,
    Succeeded {
        inserted: u64,
        skipped: u64,
        deduplicated: u64,
    },
    Failed {
        kind: FailureKind,
        reason: String,
    },
    Abort,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid chunk transition from {from} on {event}")]
pub struct TransitionError {
    pub from: String,
    pub event: String,
}

impl ChunkState {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Committing { .. } => "committing",
            ChunkState::Retrying { .. } => "retrying",
            ChunkState::Committed { .. } => "committed",
            ChunkState::Failed { .. } => "failed",
            ChunkState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkState::Committed { .. } | ChunkState::Failed { .. } | ChunkState::Aborted
        )
    }

    pub fn on(self, event: ChunkEvent, policy: &RetryPolicy) -> Result<ChunkState, TransitionError> {
        let next = match (&self, &event) {
            (ChunkState::Pending, ChunkEvent::Begin) => ChunkState::Committing { attempt: 1 },
            (ChunkState::Pending, ChunkEvent::Abort) => ChunkState::Aborted,
            (
                ChunkState::Committing { .. },
                ChunkEvent::Succeeded {
                    inserted,
                    skipped,
                    deduplicated,
                },
            ) => ChunkState::Committed {
                inserted: *inserted,
                skipped: *skipped,
                deduplicated: *deduplicated,
            },
            (ChunkState::Committing { attempt }, ChunkEvent::Failed { kind, reason }) => {
                if kind.is_retryable() && *attempt <= policy.max_retries {
                    ChunkState::Retrying {
                        attempt: *attempt,
                        reason: reason.clone(),
                    }
                } else {
                    ChunkState::Failed {
                        reason: reason.clone(),
                    }
                }
            }
            (ChunkState::Retrying { attempt, .. }, ChunkEvent::Begin) => ChunkState::Committing {
                attempt: attempt + 1,
            },
            (ChunkState::Retrying { .. }, ChunkEvent::Failed { reason, .. }) => ChunkState::Failed {
                reason: reason.clone(),
            },
            _ => {
                return Err(TransitionError {
                    from: self.name().to_string(),
                    event: event_name(&event).to_string(),
                })
            }
        };
        Ok(next)
    }
}

fn event_name(event: &ChunkEvent) -> &'static str {
    match event {
        ChunkEvent::Begin => "begin",
        ChunkEvent::Succeeded { .. } => "succeeded",
        ChunkEvent::Failed { .. } => "failed",
        ChunkEvent::Abort => "abort",
    }
}
