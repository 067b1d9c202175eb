use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::config::DEFAULT_GATHER_TIMEOUT;
use crate::engine::{GatheringState, PeerEngine};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatherOutcome {
    Complete,
    /// The wait hit its bound; the local description carries whatever
    /// candidates were found so far.
    TimedOut,
}

/// Bounded wait for an engine's candidate gathering to finish.
#[derive(Clone, Copy, Debug)]
pub struct CandidateGatherer {
    timeout: Duration,
}

impl Default for CandidateGatherer {
    fn default() -> Self {
        Self::new(DEFAULT_GATHER_TIMEOUT)
    }
}

impl CandidateGatherer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolves once the engine reports gathering complete or the timeout
    /// elapses, whichever comes first. Never fails.
    pub async fn await_completion(&self, engine: &dyn PeerEngine) -> GatherOutcome {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel::<()>();
        let signal = Arc::new(Mutex::new(Some(tx)));

        // Subscribe before reading the current state so a completion racing
        // with this call is not lost.
        let handler_signal = Arc::clone(&signal);
        let subscription = engine.on_gathering_change(Arc::new(move |state| {
            if state == GatheringState::Complete {
                if let Some(tx) = handler_signal.lock().take() {
                    let _ = tx.send(());
                }
            }
        }));

        let outcome = if engine.gathering_state() == GatheringState::Complete {
            GatherOutcome::Complete
        } else {
            match timeout(self.timeout, rx).await {
                Ok(Ok(())) => GatherOutcome::Complete,
                Ok(Err(_)) | Err(_) => GatherOutcome::TimedOut,
            }
        };
        drop(subscription);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            GatherOutcome::Complete => debug!(
                target: "beach_call::gatherer",
                elapsed_ms,
                "candidate gathering complete"
            ),
            GatherOutcome::TimedOut => warn!(
                target: "beach_call::gatherer",
                elapsed_ms,
                timeout_ms = self.timeout.as_millis() as u64,
                "candidate gathering timed out; exporting partial candidate set"
            ),
        }
        outcome
    }
}
