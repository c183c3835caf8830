//! Gaussian copula simulators
//!
//! Both variants draw the same standard normals in the same order, so for
//! one seed they produce identical histograms. They differ only in how the
//! loading matrix is stored.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use statrs::distribution::Normal;

use collab_core::{CollabError, CollabResult, Histogram, Portfolio};

use crate::layout::standard_normal;
use crate::{Copula, CopulaLayout};

pub const SPARSE: &str = "sparse";
pub const DENSE: &str = "dense";

fn tally(defaults: &mut Histogram, defaulted: usize) -> CollabResult<()> {
    let point = i64::try_from(defaulted)
        .map_err(|_| CollabError::SimulationFailed("default count overflow".into()))?;
    *defaults.entry(point).or_insert(0) += 1;
    Ok(())
}

fn check_shape(batch: usize, repeats: usize) -> CollabResult<()> {
    if batch.checked_mul(repeats).is_none() {
        return Err(CollabError::SimulationFailed(format!(
            "chunk {} x {} too large",
            batch, repeats
        )));
    }
    Ok(())
}

/// Loadings kept as per-issuer (column, weight) rows
pub struct SparseGaussianCopula {
    layout: CopulaLayout,
    normal: Normal,
    rng: StdRng,
    draws: Vec<f64>,
    latent: Vec<f64>,
}

impl SparseGaussianCopula {
    pub fn new(portfolio: &Portfolio, rng: StdRng) -> CollabResult<Self> {
        let layout = CopulaLayout::new(portfolio)?;
        let draws = vec![0.0; layout.n_draws()];
        let latent = vec![0.0; layout.n_issuers];
        Ok(SparseGaussianCopula {
            layout,
            normal: standard_normal()?,
            rng,
            draws,
            latent,
        })
    }

    pub fn layout(&self) -> &CopulaLayout {
        &self.layout
    }
}

impl Copula for SparseGaussianCopula {
    fn copula(
        &mut self,
        batch: usize,
        repeats: usize,
        defaults: &mut Histogram,
    ) -> CollabResult<()> {
        check_shape(batch, repeats)?;
        for _ in 0..repeats {
            for _ in 0..batch {
                for d in self.draws.iter_mut() {
                    *d = self.rng.sample(self.normal);
                }
                for (latent, row) in self.latent.iter_mut().zip(&self.layout.rows) {
                    *latent = row.iter().map(|(col, w)| w * self.draws[*col]).sum();
                }
                tally(defaults, self.layout.count_defaults(&self.latent))?;
            }
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        SPARSE
    }
}

/// Loadings kept as a dense `issuers x (factors + issuers)` matrix
pub struct DenseGaussianCopula {
    layout: CopulaLayout,
    weights: DMatrix<f64>,
    normal: Normal,
    rng: StdRng,
}

impl DenseGaussianCopula {
    pub fn new(portfolio: &Portfolio, rng: StdRng) -> CollabResult<Self> {
        let layout = CopulaLayout::new(portfolio)?;
        let mut weights = DMatrix::zeros(layout.n_issuers, layout.n_draws());
        for (i, row) in layout.rows.iter().enumerate() {
            for (col, w) in row {
                weights[(i, *col)] = *w;
            }
        }
        Ok(DenseGaussianCopula {
            layout,
            weights,
            normal: standard_normal()?,
            rng,
        })
    }

    pub fn weights(&self) -> &DMatrix<f64> {
        &self.weights
    }
}

impl Copula for DenseGaussianCopula {
    fn copula(
        &mut self,
        batch: usize,
        repeats: usize,
        defaults: &mut Histogram,
    ) -> CollabResult<()> {
        check_shape(batch, repeats)?;
        let n = self.layout.n_draws();
        for _ in 0..repeats {
            // one column of draws per trial
            let mut draws = DMatrix::<f64>::zeros(n, batch);
            for j in 0..batch {
                for i in 0..n {
                    draws[(i, j)] = self.rng.sample(self.normal);
                }
            }
            let latent = &self.weights * &draws;
            for j in 0..batch {
                let column: DVector<f64> = latent.column(j).into_owned();
                tally(defaults, self.layout.count_defaults(column.as_slice()))?;
            }
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        DENSE
    }
}
