//! Decoding of simulation envelopes
//!
//! Decoding is two-stage: the payload is first read into the lenient
//! [`schema`](crate::schema) view, then each child is validated on demand
//! when a handler asks for it. A handler that never looks at the portfolio
//! never fails because of a broken one.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};

use collab_core::{
    Asset, CollabError, CollabResult, Distributions, Factor, Histogram, Issuer, Logger, Portfolio,
    Progress, RunParameters, COLLAB_NS,
};

use crate::schema::{
    as_f64, as_i64, WireAsset, WireDocument, WireIssuer, WireSimulation,
};
use crate::SimulationMessage;

/// Timestamp layout used on the wire
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Format a timestamp the way envelopes carry it
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a wire timestamp. RFC 3339 is accepted as well.
pub fn parse_timestamp(s: &str) -> CollabResult<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| CollabError::InvalidParameters(format!("Invalid timestamp {}", s)))
}

/// A decoded `simulation` element
#[derive(Clone, Debug)]
pub struct Envelope {
    sim: WireSimulation,
}

impl Envelope {
    /// Decode a payload.
    ///
    /// Returns `Ok(None)` when the payload carries no simulation element or
    /// one stamped with a foreign namespace; such payloads are not ours and
    /// are skipped. Bytes that are not a JSON document fail.
    pub fn decode(buf: &[u8]) -> CollabResult<Option<Envelope>> {
        let doc: WireDocument = serde_json::from_slice(buf)
            .map_err(|e| CollabError::InvalidWireFormat(e.to_string()))?;

        let sim = match doc.simulation {
            Some(sim) => sim,
            None => return Ok(None),
        };

        if sim.xmlns.as_deref() != Some(COLLAB_NS) {
            return Ok(None);
        }

        Ok(Some(Envelope { sim }))
    }

    pub(crate) fn from_wire(sim: WireSimulation) -> Self {
        Envelope { sim }
    }

    pub fn has_parameters(&self) -> bool {
        self.sim.parameters.is_some()
    }

    pub fn has_portfolio(&self) -> bool {
        self.sim.portfolio.is_some()
    }

    pub fn has_distributions(&self) -> bool {
        self.sim.distributions.is_some()
    }

    /// Validated run parameters
    pub fn parameters(&self) -> CollabResult<RunParameters> {
        let p = self
            .sim
            .parameters
            .as_ref()
            .ok_or_else(|| CollabError::InvalidParameters("Missing parameters".into()))?;

        let number_runs = match &p.number_runs {
            Some(v) => Some(as_i64(v).ok_or_else(|| {
                CollabError::InvalidParameters(format!("Invalid number_runs {}", v))
            })?),
            None => None,
        };

        let timestamp = p.timestamp.as_deref().map(parse_timestamp).transpose()?;

        RunParameters::from_fields(
            p.run_id.clone(),
            p.output.clone(),
            number_runs,
            p.command.as_deref(),
            timestamp,
        )
    }

    /// Validated portfolio. Absence is an error: callers only ask for a
    /// portfolio when the command needs one.
    pub fn portfolio(&self) -> CollabResult<Portfolio> {
        let wp = self
            .sim
            .portfolio
            .as_ref()
            .ok_or_else(|| CollabError::InvalidPortfolio("Not a portfolio".into()))?;

        let name = wp
            .name
            .as_deref()
            .ok_or_else(|| CollabError::InvalidPortfolio("Portfolio has no name".into()))?;

        let mut portfolio = Portfolio::new(name);
        for wa in wp.assets.iter().flatten() {
            portfolio.insert_asset(decode_asset(wa)?);
        }
        Ok(portfolio)
    }

    /// Validated distributions; `None` when absent
    pub fn distributions(&self) -> CollabResult<Option<Distributions>> {
        let wd = match &self.sim.distributions {
            Some(wd) => wd,
            None => return Ok(None),
        };

        let mut dist = Distributions::new();
        for wh in &wd.histograms {
            let name = wh.name.as_deref().ok_or_else(|| {
                CollabError::InvalidDistributions("Histogram has no name".into())
            })?;

            let mut hist = Histogram::new();
            for wp in &wh.data {
                let point = wp.point.as_ref().and_then(as_i64).ok_or_else(|| {
                    CollabError::InvalidDistributions(format!("Bad point in {}", name))
                })?;
                let value = wp
                    .value
                    .as_ref()
                    .and_then(as_i64)
                    .and_then(|v| u64::try_from(v).ok())
                    .ok_or_else(|| {
                        CollabError::InvalidDistributions(format!("Bad count in {}", name))
                    })?;
                let slot = hist.entry(point).or_insert(0);
                *slot = slot.saturating_add(value);
            }
            dist.combine(name, &hist);
        }
        Ok(Some(dist))
    }

    /// Progress; `None` when absent. An unreadable run count reads as zero.
    pub fn progress(&self) -> Option<Progress> {
        self.sim.progress.as_ref().map(|wp| {
            let runs = wp
                .runs
                .as_ref()
                .and_then(as_i64)
                .map(i64::unsigned_abs)
                .unwrap_or(0);
            Progress::new(runs)
        })
    }

    /// Attached log records; `None` when absent
    pub fn logger(&self) -> Option<Logger> {
        self.sim.logger.as_ref().map(|logs| {
            let mut logger = Logger::new();
            for (severity, msgs) in logs {
                for msg in msgs {
                    logger.add_log(severity, msg.clone());
                }
            }
            logger
        })
    }

    /// Validate every child and build a full message
    pub fn into_message(self) -> CollabResult<SimulationMessage> {
        let params = self.parameters()?;
        let portfolio = if self.has_portfolio() {
            Some(self.portfolio()?)
        } else {
            None
        };
        Ok(SimulationMessage {
            params,
            portfolio,
            distributions: self.distributions()?,
            progress: self.progress(),
            logger: self.logger(),
        })
    }
}

fn decode_asset(wa: &WireAsset) -> CollabResult<Asset> {
    let name = wa
        .name
        .as_deref()
        .ok_or_else(|| CollabError::InvalidAsset("Asset has no name".into()))?;

    let number = |field: &str, v: &Option<serde_json::Value>| -> CollabResult<Option<f64>> {
        match v {
            Some(v) => as_f64(v)
                .map(Some)
                .ok_or_else(|| CollabError::InvalidAsset(format!("{}: bad {}", name, field))),
            None => Ok(None),
        }
    };

    let mut asset = Asset::new(name);
    if let Some(dp) = number("dp", &wa.dp)? {
        asset = asset.with_dp(dp);
    }
    if let Some(recovery) = number("recovery", &wa.recovery)? {
        asset = asset.with_recovery(recovery);
    }
    if let Some(notional) = number("notional", &wa.notional)? {
        asset = asset.with_notional(notional);
    }
    if let Some(wi) = &wa.issuer {
        asset = asset.with_issuer(Arc::new(decode_issuer(wi)?));
    }
    Ok(asset)
}

fn decode_issuer(wi: &WireIssuer) -> CollabResult<Issuer> {
    let name = wi
        .name
        .as_deref()
        .ok_or_else(|| CollabError::InvalidIssuer("Issuer has no name".into()))?;

    let mut factors = Vec::new();
    for wf in wi.factors.iter().flatten() {
        let fname = wf
            .name
            .as_deref()
            .ok_or_else(|| CollabError::InvalidFactor(format!("{}: factor has no name", name)))?;
        let weight = wf
            .weight
            .as_ref()
            .and_then(as_f64)
            .ok_or_else(|| CollabError::InvalidFactor(format!("{}: bad weight", fname)))?;
        factors.push(Factor::new(fname, weight));
    }
    Ok(Issuer::new(name, factors))
}
