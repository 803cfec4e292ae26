//! Hot-standby rotation of workers that each run their own terminal.
//!
//! A candidate is started under a fresh derived id, must produce its first
//! data frame within the warmup window and pass the comparison against the
//! current worker; only then is it swapped in and the old one torn down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use termnet_core::derive_terminal_id;
use termnet_core::rotation::{Rotation, RotationError, Swap};

use crate::server::HandlerError;
use crate::terminal::lock;

/// How a supervisor starts, checks and stops one kind of worker.
#[async_trait]
pub trait Standby: Send + Sync + 'static {
    type Worker: Send + Sync + 'static;
    type Frame: Send + 'static;

    async fn spawn(&self, terminal_id: &str) -> Result<Self::Worker, HandlerError>;

    /// First data the worker produces. `None` if it stopped before producing any.
    async fn first_frame(&self, worker: &Self::Worker) -> Option<Self::Frame>;

    /// Compare the candidate's first frame against the running worker.
    fn accept(
        &self,
        current: Option<&Self::Worker>,
        candidate: &Self::Worker,
        frame: &Self::Frame,
    ) -> bool;

    async fn teardown(&self, worker: Arc<Self::Worker>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    Promoted { terminal_id: String, generation: u64 },
    /// The comparison failed; the current worker stays.
    Refused { terminal_id: String },
    /// A newer rotation replaced this candidate before it was ready.
    Superseded { terminal_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("spawn {terminal_id}: {source}")]
    Spawn {
        terminal_id: String,
        source: HandlerError,
    },
    #[error("{terminal_id} stopped before its first frame")]
    Warmup { terminal_id: String },
    #[error("{terminal_id} produced no frame within {warmup:?}")]
    Timeout {
        terminal_id: String,
        warmup: Duration,
    },
}

struct Slot<W> {
    terminal_id: String,
    worker: Arc<W>,
}

pub struct Supervisor<S: Standby> {
    base_id: String,
    standby: S,
    rotation: Mutex<Rotation<Arc<Slot<S::Worker>>>>,
    starting: tokio::sync::Mutex<()>,
    warmup: Duration,
}

impl<S: Standby> Supervisor<S> {
    pub fn new(base_id: impl Into<String>, standby: S, warmup: Duration) -> Self {
        Self {
            base_id: base_id.into(),
            standby,
            rotation: Mutex::new(Rotation::new()),
            starting: tokio::sync::Mutex::new(()),
            warmup,
        }
    }

    /// Terminal id of the current worker.
    pub fn current_id(&self) -> Option<String> {
        lock(&self.rotation).current().map(|s| s.terminal_id.clone())
    }

    pub fn generation(&self) -> u64 {
        lock(&self.rotation).generation()
    }

    /// Start a candidate and swap it in if it warms up and passes the comparison.
    pub async fn rotate(&self) -> Result<RotateOutcome, FailoverError> {
        let (generation, terminal_id, candidate) = {
            // Spawning is serialized so every candidate gets its own generation.
            let _starting = self.starting.lock().await;
            let next = lock(&self.rotation).next_generation();
            let terminal_id = derive_terminal_id(&self.base_id, next);
            tracing::info!(%terminal_id, generation = next, "starting standby");
            let worker = self
                .standby
                .spawn(&terminal_id)
                .await
                .map_err(|source| FailoverError::Spawn {
                    terminal_id: terminal_id.clone(),
                    source,
                })?;
            let slot = Arc::new(Slot {
                terminal_id: terminal_id.clone(),
                worker: Arc::new(worker),
            });
            let (generation, stale) = lock(&self.rotation).begin(slot.clone());
            if let Some(stale) = stale {
                tracing::info!(terminal_id = %stale.terminal_id, "standby superseded");
                self.retire(stale).await;
            }
            (generation, terminal_id, slot)
        };

        let frame = match tokio::time::timeout(self.warmup, self.standby.first_frame(&candidate.worker)).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.give_up(generation).await;
                return Err(FailoverError::Warmup { terminal_id });
            }
            Err(_) => {
                self.give_up(generation).await;
                return Err(FailoverError::Timeout {
                    terminal_id,
                    warmup: self.warmup,
                });
            }
        };

        let swap = lock(&self.rotation).promote_if(generation, |current, cand| {
            self.standby
                .accept(current.map(|s| &*s.worker), &cand.worker, &frame)
        });
        match swap {
            Ok(Swap::Promoted(deposed)) => {
                if let Some(old) = deposed {
                    tracing::info!(from = %old.terminal_id, to = %terminal_id, "standby promoted");
                    self.retire(old).await;
                } else {
                    tracing::info!(%terminal_id, "first worker promoted");
                }
                Ok(RotateOutcome::Promoted {
                    terminal_id,
                    generation,
                })
            }
            Ok(Swap::Refused(refused)) => {
                tracing::warn!(%terminal_id, "standby refused by comparison");
                if let Some(refused) = refused {
                    self.retire(refused).await;
                }
                Ok(RotateOutcome::Refused { terminal_id })
            }
            Err(RotationError::Stale { .. } | RotationError::NoCandidate) => {
                Ok(RotateOutcome::Superseded { terminal_id })
            }
        }
    }

    /// Tear down every worker.
    pub async fn shutdown(&self) {
        let all = lock(&self.rotation).drain();
        for slot in all {
            self.retire(slot).await;
        }
    }

    async fn give_up(&self, generation: u64) {
        let abandoned = lock(&self.rotation).abandon(generation);
        if let Some(slot) = abandoned {
            tracing::warn!(terminal_id = %slot.terminal_id, "standby failed to warm up");
            self.retire(slot).await;
        }
    }

    async fn retire(&self, slot: Arc<Slot<S::Worker>>) {
        tracing::debug!(terminal_id = %slot.terminal_id, "tearing down worker");
        self.standby.teardown(slot.worker.clone()).await;
    }
}
