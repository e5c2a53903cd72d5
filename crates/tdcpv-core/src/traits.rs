//! Core traits for tdcpv
//!
//! High-level inference logic (optimiser, MLE) depends on [`LogDensityModel`] only, not on the
//! concrete decay-time model.

use crate::Result;

/// Model interface for maximum-likelihood fits.
pub trait LogDensityModel: Send + Sync {
    /// Number of (free) parameters.
    fn dim(&self) -> usize;

    /// Parameter names (stable order).
    fn parameter_names(&self) -> Vec<String>;

    /// Parameter bounds (min, max) (stable order).
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Suggested initial values (stable order).
    fn parameter_init(&self) -> Vec<f64>;

    /// Negative log-likelihood.
    fn nll(&self, params: &[f64]) -> Result<f64>;

    /// Gradient of NLL.
    ///
    /// Default: central differences with an adaptive step.
    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        let n = params.len();
        let mut grad = vec![0.0; n];
        let mut work = params.to_vec();
        for i in 0..n {
            let eps = 1e-6 * params[i].abs().max(1.0);
            work[i] = params[i] + eps;
            let f_plus = self.nll(&work)?;
            work[i] = params[i] - eps;
            let f_minus = self.nll(&work)?;
            work[i] = params[i];
            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }
        Ok(grad)
    }
}
