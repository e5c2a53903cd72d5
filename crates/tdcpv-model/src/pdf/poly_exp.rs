use crate::event_store::{EventStore, ObservableSpec};
use crate::math::u01;
use crate::normalize::{CompositeRule, QuadratureOrder};
use crate::pdf::UnbinnedPdf;
use tdcpv_core::{Error, Result};

/// Polynomial × exponential shape `p(x) ∝ xⁿ exp(-x/τ)` on a non-negative support.
///
/// Mock per-event decay-time-error distribution. The exponent `n` is fixed at construction;
/// `τ` is the only shape parameter.
#[derive(Debug, Clone)]
pub struct PolyExpPdf {
    observables: [String; 1],
    exponent: f64,
}

impl PolyExpPdf {
    /// Create a new shape over `observable` with fixed exponent `n ≥ 0`.
    pub fn new(observable: impl Into<String>, exponent: f64) -> Result<Self> {
        if !exponent.is_finite() || exponent < 0.0 {
            return Err(Error::Validation(format!(
                "PolyExpPdf exponent must be finite and >=0, got {exponent}"
            )));
        }
        Ok(Self { observables: [observable.into()], exponent })
    }

    fn log_shape(&self, x: f64, tau: f64) -> f64 {
        if self.exponent == 0.0 {
            -x / tau
        } else {
            self.exponent * x.ln() - x / tau
        }
    }

    fn check(&self, params: &[f64], a: f64, b: f64) -> Result<f64> {
        if params.len() != 1 {
            return Err(Error::Validation(format!(
                "PolyExpPdf expects 1 param (tau), got {}",
                params.len()
            )));
        }
        let tau = params[0];
        if !tau.is_finite() || tau <= 0.0 {
            return Err(Error::Validation(format!("PolyExpPdf tau must be > 0, got {tau}")));
        }
        if !(a.is_finite() && b.is_finite() && 0.0 <= a && a < b) {
            return Err(Error::Validation(format!(
                "PolyExpPdf requires a finite support with 0 <= low < high, got ({a}, {b})"
            )));
        }
        Ok(tau)
    }

    fn log_norm(&self, tau: f64, a: f64, b: f64) -> Result<f64> {
        let peak = self.log_shape((self.exponent * tau).clamp(a, b), tau);
        let rule = CompositeRule::new(QuadratureOrder::N32);
        let z = rule.integrate(a, b, (b - a) / 16.0, |x| (self.log_shape(x, tau) - peak).exp());
        if !(z.is_finite() && z > 0.0) {
            return Err(Error::Computation(format!(
                "PolyExpPdf normalization failed on ({a}, {b}) with tau={tau}"
            )));
        }
        Ok(z.ln() + peak)
    }
}

impl UnbinnedPdf for PolyExpPdf {
    fn n_params(&self) -> usize {
        1
    }

    fn observables(&self) -> &[String] {
        &self.observables
    }

    fn log_prob_batch(&self, events: &EventStore, params: &[f64], out: &mut [f64]) -> Result<()> {
        let obs = self.observables[0].as_str();
        let xs = events.require_column(obs)?;
        let (a, b) = events
            .bounds(obs)
            .ok_or_else(|| Error::Validation(format!("missing bounds for '{obs}'")))?;
        let tau = self.check(params, a, b)?;
        if out.len() != xs.len() {
            return Err(Error::Validation(format!(
                "PolyExpPdf out length mismatch: expected {}, got {}",
                xs.len(),
                out.len()
            )));
        }
        let log_z = self.log_norm(tau, a, b)?;
        for (o, &x) in out.iter_mut().zip(xs) {
            *o = self.log_shape(x, tau) - log_z;
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
        if support.len() != 1 {
            return Err(Error::Validation(format!(
                "PolyExpPdf sample expects 1D support, got {}D",
                support.len()
            )));
        }
        let (a, b) = support[0];
        let tau = self.check(params, a, b)?;
        let peak = self.log_shape((self.exponent * tau).clamp(a, b), tau);

        let mut xs = Vec::with_capacity(n_events);
        while xs.len() < n_events {
            let x = a + (b - a) * u01(rng);
            if u01(rng).ln() < self.log_shape(x, tau) - peak {
                xs.push(x);
            }
        }

        let name = self.observables[0].clone();
        EventStore::from_columns(vec![ObservableSpec::branch(name.clone(), (a, b))], vec![(name, xs)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn test_density_integrates_to_one() {
        let pdf = PolyExpPdf::new("sigma_t", 2.0).unwrap();
        let (a, b) = (0.01, 0.1);
        let tau = 0.012;
        let log_z = pdf.log_norm(tau, a, b).unwrap();
        let rule = CompositeRule::new(QuadratureOrder::N16);
        let total = rule.integrate(a, b, 0.01, |x| (pdf.log_shape(x, tau) - log_z).exp());
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_sample_mode_near_n_tau() {
        let pdf = PolyExpPdf::new("sigma_t", 3.0).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let store = pdf.sample(&[0.01], 5000, &[(0.0, 0.15)], &mut rng).unwrap();
        let xs = store.column("sigma_t").unwrap();
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        // Gamma(n+1, τ) mean, essentially untruncated on this support.
        assert_relative_eq!(mean, 0.04, epsilon = 0.002);
    }
}
