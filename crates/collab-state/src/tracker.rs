//! Convergence tracking
//!
//! `absorb` merges one worker result into its run and decides whether the
//! run has now converged. The caller emits the final results and a stop
//! when told to; if either emission fails it calls `reopen` so that the
//! next result for the run triggers the emission again.

use std::collections::HashMap;

use collab_core::{Distributions, Progress, RunId};

use crate::{RetiredRuns, DEFAULT_RETIRED_CAPACITY};

/// Accumulated state of one run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunProgress {
    pub distributions: Distributions,
    /// Trials accounted for so far
    pub runs: u64,
    /// Final results were emitted
    pub stopped: bool,
}

/// What happened to an absorbed result
#[derive(Clone, Debug, PartialEq)]
pub enum Absorbed {
    /// The run was stopped earlier; nothing was merged
    Retired,
    /// Merged, target not reached yet
    Pending { runs: u64 },
    /// Merged and the target was reached for the first time. Carries the
    /// cumulative distributions to emit.
    Converged { runs: u64, distributions: Distributions },
    /// Merged, but final results went out already
    AlreadyStopped { runs: u64 },
}

/// Per-run aggregation store
#[derive(Debug)]
pub struct ConvergenceTracker {
    runs: HashMap<RunId, RunProgress>,
    retired: RetiredRuns,
}

impl ConvergenceTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RETIRED_CAPACITY)
    }

    /// Tracker remembering up to `retired_capacity` stopped runs
    pub fn with_capacity(retired_capacity: usize) -> Self {
        ConvergenceTracker {
            runs: HashMap::new(),
            retired: RetiredRuns::new(retired_capacity),
        }
    }

    /// Merge one result message into its run.
    ///
    /// The run counter grows by `progress.runs` once per message, however
    /// many histograms the message carries.
    pub fn absorb(
        &mut self,
        run_id: &RunId,
        distributions: &Distributions,
        progress: Progress,
        target: u64,
    ) -> Absorbed {
        if self.retired.contains(run_id) {
            tracing::debug!(run_id = %run_id, "result for retired run ignored");
            return Absorbed::Retired;
        }

        let run = self.runs.entry(run_id.clone()).or_default();
        run.distributions.merge(distributions);
        run.runs = run.runs.saturating_add(progress.runs);

        tracing::info!(
            run_id = %run_id,
            runs = run.runs,
            target,
            "progress [{} / {}]",
            run.runs,
            target
        );

        if run.runs < target {
            Absorbed::Pending { runs: run.runs }
        } else if run.stopped {
            Absorbed::AlreadyStopped { runs: run.runs }
        } else {
            run.stopped = true;
            Absorbed::Converged {
                runs: run.runs,
                distributions: run.distributions.clone(),
            }
        }
    }

    /// Clear the stopped marker after a failed final emission
    pub fn reopen(&mut self, run_id: &RunId) {
        if let Some(run) = self.runs.get_mut(run_id) {
            run.stopped = false;
        }
    }

    /// Discard all state of a run and remember it as retired. Returns
    /// whether there was any state.
    pub fn retire(&mut self, run_id: &RunId) -> bool {
        let had = self.runs.remove(run_id).is_some();
        self.retired.insert(run_id.clone());
        had
    }

    /// Forget that a run was retired, so a restarted run id aggregates again
    pub fn revive(&mut self, run_id: &RunId) -> bool {
        self.retired.remove(run_id)
    }

    pub fn is_retired(&self, run_id: &RunId) -> bool {
        self.retired.contains(run_id)
    }

    pub fn get(&self, run_id: &RunId) -> Option<&RunProgress> {
        self.runs.get(run_id)
    }

    pub fn runs_completed(&self, run_id: &RunId) -> u64 {
        self.runs.get(run_id).map_or(0, |r| r.runs)
    }

    pub fn is_stopped(&self, run_id: &RunId) -> bool {
        self.runs.get(run_id).is_some_and(|r| r.stopped)
    }

    /// Runs with live state
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }
}

impl Default for ConvergenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
