//! Log records broadcast as a side channel
//!
//! A `Logger` collects messages for one processing attempt; it is then
//! attached to an `info` message, published on the error channels and
//! dropped.

use std::collections::BTreeMap;
use std::fmt;

pub const SEVERITY_ERROR: &str = "error";
pub const SEVERITY_WARNING: &str = "warning";
pub const SEVERITY_INFO: &str = "info";

/// Severity label → ordered messages
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Logger {
    logs: BTreeMap<String, Vec<String>>,
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_log(&mut self, severity: &str, msg: impl Into<String>) {
        self.logs
            .entry(severity.to_string())
            .or_default()
            .push(msg.into());
    }

    pub fn error(&mut self, msg: impl fmt::Display) {
        self.add_log(SEVERITY_ERROR, msg.to_string());
    }

    pub fn has_severity(&self, severity: &str) -> bool {
        self.logs.get(severity).is_some_and(|m| !m.is_empty())
    }

    pub fn has_errors(&self) -> bool {
        self.has_severity(SEVERITY_ERROR)
    }

    pub fn messages(&self, severity: &str) -> &[String] {
        self.logs.get(severity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.logs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.values().all(Vec::is_empty)
    }
}
