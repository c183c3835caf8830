//! Portfolio model - assets, issuers and factors
//!
//! Assets hold a shared, non-owning reference to their issuer; issuers never
//! point back at assets. Factors compare by name only, so two factors with
//! the same name but different weights collapse into one inside a set.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub const DEFAULT_DP: f64 = 1.0;
pub const DEFAULT_RECOVERY: f64 = 1.0;
pub const DEFAULT_NOTIONAL: f64 = 100.0;

/// Clamp into [0, 1], mapping NaN to 0
fn unit_interval(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Systematic risk factor loading of an issuer
#[derive(Clone, Debug)]
pub struct Factor {
    name: String,
    weight: f64,
}

impl Factor {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Factor {
            name: name.into(),
            weight: unit_interval(weight),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

// Identity is the name alone; the weight does not take part.
impl PartialEq for Factor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Factor {}

impl Hash for Factor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for Factor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Factor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

/// Issuer of one or more assets, exposed to a fixed set of factors
#[derive(Clone, Debug, PartialEq)]
pub struct Issuer {
    name: String,
    factors: BTreeSet<Factor>,
}

impl Issuer {
    /// Create an issuer. Duplicate factor names keep the first weight seen.
    pub fn new(name: impl Into<String>, factors: impl IntoIterator<Item = Factor>) -> Self {
        let mut set = BTreeSet::new();
        for f in factors {
            set.insert(f);
        }
        Issuer {
            name: name.into(),
            factors: set,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factors(&self) -> &BTreeSet<Factor> {
        &self.factors
    }

    /// Sum of factor weights (the systematic share of variance)
    pub fn systematic_weight(&self) -> f64 {
        self.factors.iter().map(Factor::weight).sum()
    }
}

/// A defaultable position
#[derive(Clone, Debug, PartialEq)]
pub struct Asset {
    name: String,
    dp: f64,
    recovery: f64,
    notional: f64,
    issuer: Option<Arc<Issuer>>,
}

impl Asset {
    pub fn new(name: impl Into<String>) -> Self {
        Asset {
            name: name.into(),
            dp: DEFAULT_DP,
            recovery: DEFAULT_RECOVERY,
            notional: DEFAULT_NOTIONAL,
            issuer: None,
        }
    }

    pub fn with_dp(mut self, dp: f64) -> Self {
        self.dp = unit_interval(dp);
        self
    }

    pub fn with_recovery(mut self, recovery: f64) -> Self {
        self.recovery = unit_interval(recovery);
        self
    }

    pub fn with_notional(mut self, notional: f64) -> Self {
        self.notional = if notional.is_nan() { 0.0 } else { notional.max(0.0) };
        self
    }

    pub fn with_issuer(mut self, issuer: Arc<Issuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default probability
    pub fn dp(&self) -> f64 {
        self.dp
    }

    pub fn recovery(&self) -> f64 {
        self.recovery
    }

    pub fn notional(&self) -> f64 {
        self.notional
    }

    pub fn issuer(&self) -> Option<&Arc<Issuer>> {
        self.issuer.as_ref()
    }
}

/// A named set of assets, unique by asset name
#[derive(Clone, Debug, PartialEq)]
pub struct Portfolio {
    name: String,
    assets: BTreeMap<String, Asset>,
}

impl Portfolio {
    pub fn new(name: impl Into<String>) -> Self {
        Portfolio {
            name: name.into(),
            assets: BTreeMap::new(),
        }
    }

    pub fn with_asset(mut self, asset: Asset) -> Self {
        self.insert_asset(asset);
        self
    }

    /// Add an asset. Returns false if an asset with that name already
    /// exists (the first one is kept). An asset whose issuer name was
    /// already seen is re-pointed at the existing issuer so the issuer
    /// is shared rather than duplicated.
    pub fn insert_asset(&mut self, mut asset: Asset) -> bool {
        if self.assets.contains_key(&asset.name) {
            return false;
        }
        if let Some(issuer) = &asset.issuer {
            if let Some(existing) = self.find_issuer(issuer.name()) {
                asset.issuer = Some(existing);
            }
        }
        self.assets.insert(asset.name.clone(), asset);
        true
    }

    fn find_issuer(&self, name: &str) -> Option<Arc<Issuer>> {
        self.assets
            .values()
            .filter_map(|a| a.issuer.as_ref())
            .find(|i| i.name() == name)
            .cloned()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assets ordered by name
    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn asset_indices(&self) -> HashMap<String, usize> {
        self.assets
            .keys()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect()
    }

    /// Distinct issuers in order of first reference
    pub fn issuers(&self) -> Vec<Arc<Issuer>> {
        let mut seen = BTreeSet::new();
        self.assets
            .values()
            .filter_map(|a| a.issuer.as_ref())
            .filter(|i| seen.insert(i.name().to_string()))
            .cloned()
            .collect()
    }

    pub fn issuer_indices(&self) -> HashMap<String, usize> {
        self.issuers()
            .iter()
            .enumerate()
            .map(|(i, iss)| (iss.name().to_string(), i))
            .collect()
    }

    /// Distinct factors across all issuers; the first weight seen for a
    /// name wins
    pub fn factors(&self) -> Vec<Factor> {
        let mut names = BTreeSet::new();
        let mut out = Vec::new();
        for issuer in self.issuers() {
            for f in issuer.factors() {
                if names.insert(f.name().to_string()) {
                    out.push(f.clone());
                }
            }
        }
        out
    }

    pub fn factor_indices(&self) -> HashMap<String, usize> {
        self.factors()
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name().to_string(), i))
            .collect()
    }

    /// Default probabilities of the assets that have an issuer
    pub fn default_probabilities(&self) -> BTreeMap<String, f64> {
        self.assets
            .values()
            .filter(|a| a.issuer.is_some())
            .map(|a| (a.name.clone(), a.dp))
            .collect()
    }

    pub fn asset_issuer_map(&self) -> BTreeMap<String, Arc<Issuer>> {
        self.assets
            .values()
            .filter_map(|a| a.issuer.as_ref().map(|i| (a.name.clone(), Arc::clone(i))))
            .collect()
    }

    pub fn issuer_asset_map(&self) -> BTreeMap<String, Vec<&Asset>> {
        let mut map: BTreeMap<String, Vec<&Asset>> = BTreeMap::new();
        for asset in self.assets.values() {
            if let Some(issuer) = &asset.issuer {
                map.entry(issuer.name().to_string()).or_default().push(asset);
            }
        }
        map
    }
}
