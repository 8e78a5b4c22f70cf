//! Analysis stages.
//!
//! Every stage here is a pure function from records to rows: no stage
//! mutates its input, and rounding happens at fixed, documented points.

pub mod aggregator;
pub mod expressions;
pub mod movement;
pub mod rolling;

pub use aggregator::*;
pub use expressions::*;
pub use movement::*;
pub use rolling::*;

use serde::{Deserialize, Serialize};

/// Number of decimal places numeric outputs are rounded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Precision(u32);

impl Precision {
    /// Largest precision accepted from configuration.
    pub const MAX_DECIMALS: u32 = 6;

    pub const ONE: Precision = Precision(1);
    pub const TWO: Precision = Precision(2);
    pub const FINE: Precision = Precision(Self::MAX_DECIMALS);

    pub fn new(decimals: u32) -> Option<Self> {
        (decimals <= Self::MAX_DECIMALS).then_some(Precision(decimals))
    }

    pub fn decimals(&self) -> u32 {
        self.0
    }

    /// Round half away from zero, so `45.25` becomes `45.3` rather than the
    /// half-to-even `45.2`. Negative zero is folded to zero so that rounded
    /// outputs compare and render identically across runs.
    pub fn round(&self, value: f64) -> f64 {
        let factor = 10f64.powi(self.0 as i32);
        let rounded = (value * factor).round() / factor;
        if rounded == 0.0 {
            0.0
        } else {
            rounded
        }
    }
}

impl Default for Precision {
    fn default() -> Self {
        Precision::ONE
    }
}
