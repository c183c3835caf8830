//! Simulator registry
//!
//! Maps a simulator name to a constructor. Workers get a factory injected
//! and build one simulator per run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use collab_core::{CollabError, CollabResult, Portfolio};

use crate::{Copula, DenseGaussianCopula, SparseGaussianCopula, DENSE, SPARSE};

/// Builds a simulator for a portfolio with the given random source
pub type SimulatorConstructor =
    Arc<dyn Fn(&Portfolio, StdRng) -> CollabResult<Box<dyn Copula>> + Send + Sync>;

/// Named simulator constructors
#[derive(Clone, Default)]
pub struct SimulatorFactory {
    constructors: BTreeMap<String, SimulatorConstructor>,
    seed: Option<u64>,
}

impl SimulatorFactory {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `sparse` and `dense` simulators
    pub fn with_defaults() -> Self {
        Self::new()
            .with(SPARSE, |p, rng| {
                Ok(Box::new(SparseGaussianCopula::new(p, rng)?) as Box<dyn Copula>)
            })
            .with(DENSE, |p, rng| {
                Ok(Box::new(DenseGaussianCopula::new(p, rng)?) as Box<dyn Copula>)
            })
    }

    /// Fix the random seed of every simulator built from now on
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with<F>(mut self, name: &str, constructor: F) -> Self
    where
        F: Fn(&Portfolio, StdRng) -> CollabResult<Box<dyn Copula>> + Send + Sync + 'static,
    {
        self.register(name, constructor);
        self
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&Portfolio, StdRng) -> CollabResult<Box<dyn Copula>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build the simulator registered under `name`
    pub fn build(&self, name: &str, portfolio: &Portfolio) -> CollabResult<Box<dyn Copula>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| CollabError::UnknownSimulator(name.to_string()))?;

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        tracing::debug!(simulator = name, portfolio = portfolio.name(), "building simulator");
        constructor(portfolio, rng)
    }
}

impl fmt::Debug for SimulatorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatorFactory")
            .field("names", &self.constructors.keys().collect::<Vec<_>>())
            .field("seed", &self.seed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_core::{Asset, Factor, Histogram, Issuer};

    fn portfolio() -> Portfolio {
        let iss = Arc::new(Issuer::new("i", vec![Factor::new("f", 0.3)]));
        Portfolio::new("p").with_asset(Asset::new("a").with_dp(0.3).with_issuer(iss))
    }

    #[test]
    fn test_builtins_registered() {
        let f = SimulatorFactory::with_defaults();
        assert_eq!(f.names().collect::<Vec<_>>(), [DENSE, SPARSE]);
        assert_eq!(f.build(SPARSE, &portfolio()).unwrap().kind(), SPARSE);
        assert_eq!(f.build(DENSE, &portfolio()).unwrap().kind(), DENSE);
    }

    #[test]
    fn test_unknown_simulator() {
        let f = SimulatorFactory::with_defaults();
        match f.build("scipy", &portfolio()) {
            Err(CollabError::UnknownSimulator(name)) => assert_eq!(name, "scipy"),
            other => panic!("unexpected {:?}", other.map(|s| s.kind())),
        }
    }

    #[test]
    fn test_seeded_builds_repeat() {
        let f = SimulatorFactory::with_defaults().with_seed(99);
        let run = || {
            let mut sim = f.build(SPARSE, &portfolio()).unwrap();
            let mut h = Histogram::new();
            sim.copula(10, 10, &mut h).unwrap();
            h
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_custom_constructor_errors_propagate() {
        let f = SimulatorFactory::new().with("broken", |_, _| {
            Err(CollabError::SimulationFailed("no kernel".into()))
        });
        assert!(f.contains("broken"));
        assert!(matches!(
            f.build("broken", &portfolio()),
            Err(CollabError::SimulationFailed(_))
        ));
    }
}
