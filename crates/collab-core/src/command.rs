//! Simulation commands carried in run parameters

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CollabError;

/// Command of a simulation message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Progress and log traffic
    #[default]
    Info,
    /// Request a run
    Start,
    /// Cancel a run, or confirm that one ended
    Stop,
    /// Partial or final distributions
    Results,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Info,
        Command::Start,
        Command::Stop,
        Command::Results,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Info => "info",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Results => "results",
        }
    }
}

impl FromStr for Command {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| CollabError::InvalidCommand(s.to_string()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        for cmd in Command::ALL {
            assert_eq!(cmd.as_str().parse::<Command>().unwrap(), cmd);
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        let err = "pause".parse::<Command>().unwrap_err();
        assert_eq!(err, CollabError::InvalidCommand("pause".into()));
        assert!("START".parse::<Command>().is_err());
    }
}
