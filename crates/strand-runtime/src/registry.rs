//! Run registry — the single-flight table of active runs.
//!
//! At most one orchestrator per conversation id. The entry is inserted
//! under the lock before any await point, so two concurrent callers can
//! never both start; the loser's event is forwarded into the winner's
//! pending inputs instead.
//!
//! The registry is owned by the engine instance. There is no process-wide
//! singleton; two engines sharing a store still get independent tables.

use std::collections::HashMap;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strand_core::ids::RunId;
use strand_core::logs::Log;

struct RunEntry {
    run_id: RunId,
    input_tx: mpsc::UnboundedSender<Log>,
    cancel: CancellationToken,
}

/// Handle returned to the caller that won the start race.
#[derive(Debug)]
pub struct StartedRun {
    /// Fresh run id.
    pub run_id: RunId,
    /// Abort signal for this run.
    pub cancel: CancellationToken,
    /// Receiving side of the mid-run input channel; the orchestrator
    /// drains it at each step boundary.
    pub input_rx: mpsc::UnboundedReceiver<Log>,
}

/// Outcome of [`RunRegistry::start_or_join`].
#[derive(Debug)]
pub enum StartOrJoin {
    /// No run was active; the caller now drives one.
    Started(StartedRun),
    /// An active run absorbed the event.
    Joined {
        /// Id of the absorbing run.
        run_id: RunId,
    },
}

/// Single-flight table keyed by conversation id.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, RunEntry>>,
}

impl RunRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the active run for `conversation_id` with `event`, or reserve
    /// a new entry and return the started-run handle.
    pub fn start_or_join(&self, conversation_id: &str, event: Log) -> StartOrJoin {
        let mut runs = self.runs.lock();
        if let Some(entry) = runs.get(conversation_id) {
            match entry.input_tx.send(event) {
                Ok(()) => {
                    debug!(conversation_id, run_id = %entry.run_id, "joined active run");
                    return StartOrJoin::Joined {
                        run_id: entry.run_id.clone(),
                    };
                }
                Err(send_err) => {
                    // The orchestrator dropped its receiver without
                    // deregistering; reclaim the slot and start fresh.
                    warn!(conversation_id, "stale run entry reclaimed");
                    let _ = runs.remove(conversation_id);
                    return self.reserve(&mut runs, conversation_id, send_err.0);
                }
            }
        }
        self.reserve(&mut runs, conversation_id, event)
    }

    fn reserve(
        &self,
        runs: &mut HashMap<String, RunEntry>,
        conversation_id: &str,
        event: Log,
    ) -> StartOrJoin {
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        // The triggering event travels the same path as joined events.
        let _ = input_tx.send(event);
        let _ = runs.insert(
            conversation_id.to_string(),
            RunEntry {
                run_id: run_id.clone(),
                input_tx,
                cancel: cancel.clone(),
            },
        );
        gauge!("runs_active").set(runs.len() as f64);
        debug!(conversation_id, run_id = %run_id, "run started");
        StartOrJoin::Started(StartedRun {
            run_id,
            cancel,
            input_rx,
        })
    }

    /// Remove the entry for a completed run. Returns false when no entry
    /// existed, which indicates a bookkeeping bug in the caller.
    pub fn complete(&self, conversation_id: &str) -> bool {
        let mut runs = self.runs.lock();
        let removed = runs.remove(conversation_id).is_some();
        gauge!("runs_active").set(runs.len() as f64);
        if !removed {
            warn!(conversation_id, "completed a run with no registry entry");
        }
        removed
    }

    /// Fire the cancel token of the active run, if any.
    pub fn abort(&self, conversation_id: &str) -> bool {
        let runs = self.runs.lock();
        match runs.get(conversation_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a run is active for `conversation_id`.
    pub fn has_active(&self, conversation_id: &str) -> bool {
        self.runs.lock().contains_key(conversation_id)
    }

    /// Number of active runs.
    pub fn active_count(&self) -> usize {
        self.runs.lock().len()
    }
}
