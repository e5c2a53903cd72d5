//! Maximum Likelihood Estimation

use crate::optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
use nalgebra::DMatrix;
use tdcpv_core::{FitResult, LogDensityModel, Result};

struct ModelObjective<'a, M: LogDensityModel> {
    model: &'a M,
}

impl<M: LogDensityModel> ObjectiveFunction for ModelObjective<'_, M> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        self.model.nll(params)
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        self.model.grad_nll(params)
    }
}

/// Maximum Likelihood Estimator
///
/// Minimises the NLL with bounded L-BFGS, then estimates the covariance from a
/// finite-difference Hessian.
#[derive(Debug, Clone, Default)]
pub struct MaximumLikelihoodEstimator {
    config: OptimizerConfig,
}

impl MaximumLikelihoodEstimator {
    /// Create a new MLE with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create MLE with custom optimizer configuration
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Fit from `model.parameter_init()`.
    pub fn fit<M: LogDensityModel>(&self, model: &M) -> Result<FitResult> {
        self.fit_from(model, &model.parameter_init())
    }

    /// Fit from an explicit starting point.
    pub fn fit_from<M: LogDensityModel>(&self, model: &M, initial_params: &[f64]) -> Result<FitResult> {
        let result = self.fit_minimum_from(model, initial_params)?;
        let n = result.parameters.len();
        let hessian = self.compute_hessian(model, &result.parameters)?;

        let (uncertainties, covariance) = match self.invert_hessian(&hessian, n) {
            Some(cov) => {
                let unc = (0..n).map(|i| cov[(i, i)].sqrt()).collect();
                // Row-major flat.
                let flat = (0..n).flat_map(|i| (0..n).map(move |j| (i, j))).map(|ij| cov[ij]).collect();
                (unc, Some(flat))
            }
            None => {
                log::warn!("Hessian inversion failed, using diagonal approximation");
                (self.diagonal_uncertainties(&hessian, n), None)
            }
        };
        if !result.converged {
            log::warn!("fit did not converge: {}", result.message);
        }
        log::info!("fit: nll={:.4} after {} iterations (converged={})", result.fval, result.n_iter, result.converged);

        Ok(FitResult {
            parameter_names: model.parameter_names(),
            parameters: result.parameters,
            uncertainties,
            covariance,
            nll: result.fval,
            converged: result.converged,
            n_iter: result.n_iter,
        })
    }

    /// Minimise the NLL without the Hessian.
    pub fn fit_minimum_from<M: LogDensityModel>(
        &self,
        model: &M,
        initial_params: &[f64],
    ) -> Result<OptimizationResult> {
        let objective = ModelObjective { model };
        let bounds = model.parameter_bounds();
        LbfgsbOptimizer::new(self.config.clone()).minimize(&objective, initial_params, &bounds)
    }

    /// Forward differences of the gradient, symmetrised.
    fn compute_hessian(&self, model: &impl LogDensityModel, best: &[f64]) -> Result<DMatrix<f64>> {
        let n = best.len();
        let bounds = model.parameter_bounds();
        let grad_center = model.grad_nll(best)?;
        let mut hessian = DMatrix::zeros(n, n);
        for j in 0..n {
            let mut eps = 1e-4 * best[j].abs().max(1.0);
            // Step inwards at an upper bound.
            if best[j] + eps > bounds[j].1 {
                eps = -eps;
            }
            let mut shifted = best.to_vec();
            shifted[j] += eps;
            let grad = model.grad_nll(&shifted)?;
            for i in 0..n {
                hessian[(i, j)] = (grad[i] - grad_center[i]) / eps;
            }
        }
        let ht = hessian.transpose();
        Ok((&hessian + &ht) * 0.5)
    }

    /// Damped Cholesky inverse; `None` unless every variance is finite and positive.
    fn invert_hessian(&self, hessian: &DMatrix<f64>, n: usize) -> Option<DMatrix<f64>> {
        let identity = DMatrix::identity(n, n);
        let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);
        let mut damped = hessian.clone();
        let mut damping = 0.0_f64;
        for _ in 0..10 {
            if let Some(chol) = nalgebra::linalg::Cholesky::new(damped.clone()) {
                let cov = chol.solve(&identity);
                if (0..n).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] > 0.0) {
                    if damping > 0.0 {
                        log::debug!("Hessian needed diagonal damping {damping:.3e}");
                    }
                    return Some(cov);
                }
                return None;
            }
            let next = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
            for i in 0..n {
                damped[(i, i)] += next - damping;
            }
            damping = next;
        }
        None
    }

    fn diagonal_uncertainties(&self, hessian: &DMatrix<f64>, n: usize) -> Vec<f64> {
        (0..n).map(|i| 1.0 / hessian[(i, i)].abs().max(1e-12).sqrt()).collect()
    }
}
