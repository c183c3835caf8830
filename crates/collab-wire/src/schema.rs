//! Serde view of the simulation element
//!
//! Every field is optional here; presence and value checks happen when an
//! [`Envelope`](crate::Envelope) is turned into core types. Scalars are
//! kept as raw JSON values so that both `12` and `"12"` are accepted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top level document: `{"simulation": {...}}`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation: Option<WireSimulation>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireSimulation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<WireParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio: Option<WirePortfolio>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributions: Option<WireDistributions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<WireProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_runs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WirePortfolio {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Vec<WireAsset>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireAsset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notional: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<WireIssuer>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireIssuer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factors: Option<Vec<WireFactor>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireFactor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireDistributions {
    #[serde(default)]
    pub histograms: Vec<WireHistogram>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireHistogram {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Vec<WirePoint>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WirePoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs: Option<Value>,
}

/// Read an integer from a JSON number or a numeric string
pub(crate) fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a float from a JSON number or a numeric string
pub(crate) fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
