//! Outbound simulation messages

use bytes::Bytes;
use serde_json::Value;

use collab_core::{
    Asset, Distributions, Issuer, Logger, Portfolio, Progress, RunParameters, COLLAB_NS,
};

use crate::envelope::format_timestamp;
use crate::schema::{
    WireAsset, WireDistributions, WireDocument, WireFactor, WireHistogram, WireIssuer,
    WireParameters, WirePoint, WirePortfolio, WireProgress, WireSimulation,
};
use crate::{Envelope, Item};

/// A simulation message ready to be published
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationMessage {
    pub params: RunParameters,
    pub portfolio: Option<Portfolio>,
    pub distributions: Option<Distributions>,
    pub progress: Option<Progress>,
    pub logger: Option<Logger>,
}

impl SimulationMessage {
    pub fn new(params: RunParameters) -> Self {
        SimulationMessage {
            params,
            portfolio: None,
            distributions: None,
            progress: None,
            logger: None,
        }
    }

    pub fn with_portfolio(mut self, portfolio: Portfolio) -> Self {
        self.portfolio = Some(portfolio);
        self
    }

    pub fn with_distributions(mut self, distributions: Distributions) -> Self {
        self.distributions = Some(distributions);
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    fn to_wire(&self) -> WireSimulation {
        WireSimulation {
            xmlns: Some(COLLAB_NS.to_string()),
            parameters: Some(encode_params(&self.params)),
            portfolio: self.portfolio.as_ref().map(encode_portfolio),
            distributions: self.distributions.as_ref().map(encode_distributions),
            progress: self.progress.map(|p| WireProgress {
                runs: Some(Value::from(p.runs)),
            }),
            logger: self.logger.as_ref().map(|l| {
                l.iter()
                    .map(|(severity, msgs)| (severity.clone(), msgs.clone()))
                    .collect()
            }),
        }
    }

    /// Serialize to a bus payload
    pub fn encode(&self) -> Bytes {
        let doc = WireDocument {
            simulation: Some(self.to_wire()),
        };
        // The wire view only holds strings, numbers and maps with string keys.
        Bytes::from(serde_json::to_vec(&doc).unwrap_or_default())
    }

    /// Wrap into a bus item
    pub fn to_item(&self, id: Option<String>) -> Item {
        Item::new(id, self.encode())
    }

    /// View as a decoded envelope without a serialization round trip
    pub fn to_envelope(&self) -> Envelope {
        Envelope::from_wire(self.to_wire())
    }
}

fn encode_params(p: &RunParameters) -> WireParameters {
    WireParameters {
        run_id: p.run_id.as_ref().map(|r| r.as_str().to_string()),
        output: Some(p.output.clone()),
        number_runs: Some(Value::from(p.number_runs)),
        command: Some(p.command.as_str().to_string()),
        timestamp: Some(format_timestamp(&p.timestamp)),
    }
}

fn encode_portfolio(p: &Portfolio) -> WirePortfolio {
    WirePortfolio {
        name: Some(p.name().to_string()),
        assets: Some(p.assets().map(encode_asset).collect()),
    }
}

fn encode_asset(a: &Asset) -> WireAsset {
    WireAsset {
        name: Some(a.name().to_string()),
        dp: Some(Value::from(a.dp())),
        recovery: Some(Value::from(a.recovery())),
        notional: Some(Value::from(a.notional())),
        issuer: a.issuer().map(|i| encode_issuer(i)),
    }
}

fn encode_issuer(i: &Issuer) -> WireIssuer {
    WireIssuer {
        name: Some(i.name().to_string()),
        factors: Some(
            i.factors()
                .iter()
                .map(|f| WireFactor {
                    name: Some(f.name().to_string()),
                    weight: Some(Value::from(f.weight())),
                })
                .collect(),
        ),
    }
}

fn encode_distributions(d: &Distributions) -> WireDistributions {
    WireDistributions {
        histograms: d
            .iter()
            .map(|(name, hist)| WireHistogram {
                name: Some(name.clone()),
                data: hist
                    .iter()
                    .map(|(point, count)| WirePoint {
                        point: Some(Value::from(*point)),
                        value: Some(Value::from(*count)),
                    })
                    .collect(),
            })
            .collect(),
    }
}
