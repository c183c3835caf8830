//! Portfolio layout shared by the simulator variants
//!
//! Issuers are indexed in order of first reference, factors in order of
//! first appearance. The latent vector has one slot per issuer; the draw
//! vector has `factors + issuers` slots, factors first.

use statrs::distribution::{ContinuousCDF, Normal};

use collab_core::{CollabError, CollabResult, Portfolio};

/// Default threshold for a default probability: `Φ⁻¹(dp)`
pub fn default_threshold(normal: &Normal, dp: f64) -> f64 {
    if dp <= 0.0 {
        f64::NEG_INFINITY
    } else if dp >= 1.0 {
        f64::INFINITY
    } else {
        normal.inverse_cdf(dp)
    }
}

/// Index form of a portfolio
#[derive(Clone, Debug)]
pub struct CopulaLayout {
    pub n_factors: usize,
    pub n_issuers: usize,
    /// Per issuer: (column, loading) pairs, idiosyncratic column last
    pub rows: Vec<Vec<(usize, f64)>>,
    /// Per defaultable asset: (issuer index, threshold)
    pub assets: Vec<(usize, f64)>,
}

impl CopulaLayout {
    pub fn new(portfolio: &Portfolio) -> CollabResult<Self> {
        let normal = standard_normal()?;
        let issuers = portfolio.issuers();
        let issuer_indices = portfolio.issuer_indices();
        let factor_indices = portfolio.factor_indices();
        let n_factors = factor_indices.len();
        let n_issuers = issuers.len();

        let mut rows = Vec::with_capacity(n_issuers);
        for (i, issuer) in issuers.iter().enumerate() {
            let mut row = Vec::with_capacity(issuer.factors().len() + 1);
            let mut systematic = 0.0;
            for factor in issuer.factors() {
                let column = factor_indices.get(factor.name()).copied().ok_or_else(|| {
                    CollabError::SimulationFailed(format!("unindexed factor {}", factor.name()))
                })?;
                let w = factor.weight().max(0.0);
                row.push((column, w.sqrt()));
                systematic += w;
            }
            row.push((n_factors + i, (1.0 - systematic).max(0.0).sqrt()));
            rows.push(row);
        }

        let mut assets = Vec::new();
        for asset in portfolio.assets() {
            // Assets without an issuer carry no latent variable and never default
            if let Some(issuer) = asset.issuer() {
                let index = issuer_indices.get(issuer.name()).copied().ok_or_else(|| {
                    CollabError::SimulationFailed(format!("unindexed issuer {}", issuer.name()))
                })?;
                assets.push((index, default_threshold(&normal, asset.dp())));
            }
        }

        Ok(CopulaLayout {
            n_factors,
            n_issuers,
            rows,
            assets,
        })
    }

    /// Length of the draw vector
    pub fn n_draws(&self) -> usize {
        self.n_factors + self.n_issuers
    }

    /// Number of assets whose issuer latent lies below the asset threshold
    pub fn count_defaults(&self, latent: &[f64]) -> usize {
        self.assets
            .iter()
            .filter(|(issuer, threshold)| latent[*issuer] < *threshold)
            .count()
    }
}

pub(crate) fn standard_normal() -> CollabResult<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| CollabError::SimulationFailed(e.to_string()))
}
