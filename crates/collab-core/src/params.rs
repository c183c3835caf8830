//! Run parameters - the header of every simulation message

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{CollabError, CollabResult, Command, RunId, DEFAULT_NUMBER_RUNS};

/// Parameters scoping a simulation message to a run
#[derive(Clone, Debug, PartialEq)]
pub struct RunParameters {
    /// Caller supplied run identifier
    pub run_id: Option<RunId>,
    /// Free-form output label
    pub output: String,
    /// Target number of trials for the run
    pub number_runs: u64,
    pub command: Command,
    /// When the run was requested
    pub timestamp: DateTime<Utc>,
}

impl Default for RunParameters {
    fn default() -> Self {
        RunParameters {
            run_id: None,
            output: String::new(),
            number_runs: DEFAULT_NUMBER_RUNS,
            command: Command::Info,
            timestamp: Utc::now(),
        }
    }
}

impl RunParameters {
    /// Parameters for the given run with default settings
    pub fn new(run_id: impl Into<RunId>) -> Self {
        RunParameters {
            run_id: Some(run_id.into()),
            ..Default::default()
        }
    }

    /// Build parameters from loosely typed fields, applying defaults for
    /// anything missing. An unrecognised command fails validation.
    pub fn from_fields(
        run_id: Option<String>,
        output: Option<String>,
        number_runs: Option<i64>,
        command: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> CollabResult<Self> {
        let command = match command {
            Some(cmd) => cmd
                .parse::<Command>()
                .map_err(|_| CollabError::InvalidParameters(format!("Invalid command {}", cmd)))?,
            None => Command::Info,
        };

        Ok(RunParameters {
            run_id: run_id.map(RunId::from),
            output: output.unwrap_or_default(),
            number_runs: number_runs.map_or(DEFAULT_NUMBER_RUNS, i64::unsigned_abs),
            command,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        })
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = command;
        self
    }

    pub fn with_number_runs(mut self, number_runs: u64) -> Self {
        self.number_runs = number_runs;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Copy of these parameters relabelled with another command
    pub fn relabel(&self, command: Command) -> Self {
        self.clone().with_command(command)
    }

    /// The run identifier, or a validation error when absent
    pub fn require_run_id(&self) -> CollabResult<&RunId> {
        self.run_id.as_ref().ok_or(CollabError::MissingRunId)
    }

    /// Wall time elapsed since the run was requested (zero if the
    /// timestamp lies in the future)
    pub fn elapsed_since(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}
