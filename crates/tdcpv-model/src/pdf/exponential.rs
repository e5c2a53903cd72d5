use crate::event_store::{EventStore, ObservableSpec};
use crate::math::{log_diff_exp, u01};
use crate::pdf::UnbinnedPdf;
use tdcpv_core::{Error, Result};

/// Exponential-family PDF `p(x) ∝ exp(λ x)` normalized on the observable bounds.
///
/// The usual combinatorial-background mass shape; `λ` may take any real value.
#[derive(Debug, Clone)]
pub struct ExponentialPdf {
    observables: [String; 1],
}

impl ExponentialPdf {
    /// Create a new exponential PDF over the given observable.
    pub fn new(observable: impl Into<String>) -> Self {
        Self { observables: [observable.into()] }
    }
}

fn check_lambda(params: &[f64]) -> Result<f64> {
    if params.len() != 1 {
        return Err(Error::Validation(format!(
            "ExponentialPdf expects 1 param (lambda), got {}",
            params.len()
        )));
    }
    let lambda = params[0];
    if !lambda.is_finite() {
        return Err(Error::Validation(format!(
            "ExponentialPdf parameter must be finite, got lambda={lambda}"
        )));
    }
    Ok(lambda)
}

impl UnbinnedPdf for ExponentialPdf {
    fn n_params(&self) -> usize {
        1
    }

    fn observables(&self) -> &[String] {
        &self.observables
    }

    fn log_prob_batch(&self, events: &EventStore, params: &[f64], out: &mut [f64]) -> Result<()> {
        let lambda = check_lambda(params)?;
        let n = events.n_events();
        if out.len() != n {
            return Err(Error::Validation(format!(
                "ExponentialPdf out length mismatch: expected {n}, got {}",
                out.len()
            )));
        }

        let obs = self.observables[0].as_str();
        let xs = events.require_column(obs)?;
        let (a, b) = events
            .bounds(obs)
            .ok_or_else(|| Error::Validation(format!("missing bounds for '{obs}'")))?;

        let log_z = log_norm(lambda, a, b);
        for (o, &x) in out.iter_mut().zip(xs) {
            *o = lambda * x - log_z;
        }
        Ok(())
    }

    fn sample(
        &self,
        params: &[f64],
        n_events: usize,
        support: &[(f64, f64)],
        rng: &mut dyn rand::RngCore,
    ) -> Result<EventStore> {
        let lambda = check_lambda(params)?;
        if support.len() != 1 {
            return Err(Error::Validation(format!(
                "ExponentialPdf sample expects 1D support, got {}D",
                support.len()
            )));
        }
        let (a, b) = support[0];
        if !a.is_finite() || !b.is_finite() || a >= b {
            return Err(Error::Validation(format!(
                "ExponentialPdf sample requires finite support with low < high, got ({a}, {b})"
            )));
        }

        let width = b - a;
        let xs = (0..n_events)
            .map(|_| {
                let u = u01(rng);
                let x = if lambda.abs() < 1e-12 {
                    a + u * width
                } else if lambda < 0.0 {
                    a + (u * (lambda * width).exp_m1()).ln_1p() / lambda
                } else {
                    b + (u + (1.0 - u) * (-lambda * width).exp()).ln() / lambda
                };
                x.clamp(a, b)
            })
            .collect::<Vec<_>>();

        let name = self.observables[0].clone();
        EventStore::from_columns(vec![ObservableSpec::branch(name.clone(), (a, b))], vec![(name, xs)])
    }
}

/// `log ∫_a^b exp(λ x) dx`.
fn log_norm(lambda: f64, a: f64, b: f64) -> f64 {
    if lambda.abs() < 1e-12 {
        return (b - a).ln();
    }
    let (t_a, t_b) = (lambda * a, lambda * b);
    let (hi, lo) = if t_b >= t_a { (t_b, t_a) } else { (t_a, t_b) };
    log_diff_exp(hi, lo) - lambda.abs().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn test_sample_mean_matches_truncated_exponential() {
        let pdf = ExponentialPdf::new("m");
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let lambda = -0.5;
        let (a, b) = (0.0, 4.0);
        let store = pdf.sample(&[lambda], 40_000, &[(a, b)], &mut rng).unwrap();
        let xs = store.column("m").unwrap();
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        // E[x] = (b e^{λb} - a e^{λa}) / (e^{λb} - e^{λa}) - 1/λ
        let expected = (b * (lambda * b).exp() - a * (lambda * a).exp())
            / ((lambda * b).exp() - (lambda * a).exp())
            - 1.0 / lambda;
        assert_relative_eq!(mean, expected, epsilon = 0.02);
    }

    #[test]
    fn test_log_norm_flat_limit() {
        assert_relative_eq!(log_norm(0.0, 1.0, 3.0), 2f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(log_norm(1e-9, 1.0, 3.0), 2f64.ln(), epsilon = 1e-6);
    }
}
