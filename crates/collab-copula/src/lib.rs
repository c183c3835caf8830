//! Collab Copula - Correlated default simulation
//!
//! Multi-factor, single step Gaussian copula:
//! - Each issuer's latent variable is a weighted sum of shared factor
//!   draws and one idiosyncratic draw
//! - An asset defaults when its issuer's latent variable falls below the
//!   normal quantile of the asset's default probability
//! - Every trial adds one count to the histogram point equal to the number
//!   of defaulted assets
//!
//! Simulators are built by name from a [`SimulatorFactory`].

pub mod layout;
pub mod gaussian;
pub mod factory;

pub use layout::*;
pub use gaussian::*;
pub use factory::*;

use collab_core::{CollabResult, Histogram};

/// A simulator bound to one portfolio
pub trait Copula: Send {
    /// Run `batch * repeats` trials, tallying the number of defaults per
    /// trial into `defaults`
    fn copula(&mut self, batch: usize, repeats: usize, defaults: &mut Histogram)
        -> CollabResult<()>;

    /// Registry key this simulator was built under
    fn kind(&self) -> &'static str;
}
