use crate::event_store::{EventStore, ObservableSpec};
use crate::math::{standard_normal_cdf, standard_normal_logpdf, u01};
use crate::pdf::UnbinnedPdf;
use tdcpv_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, Normal};

/// Truncated Gaussian PDF `N(μ, σ)` normalized on the observable bounds.
///
/// Also serves as the "mock" mistag distribution when no template is available.
#[derive(Debug, Clone)]
pub struct GaussianPdf {
    observables: [String; 1],
}

impl GaussianPdf {
    /// Create a new Gaussian PDF over the given observable.
    pub fn new(observable: impl Into<String>) -> Self {
        Self { observables: [observable.into()] }
    }
}

fn check_params(params: &[f64]) -> Result<(f64, f64)> {
    if params.len() != 2 {
        return Err(Error::Validation(format!(
            "GaussianPdf expects 2 params (mu, sigma), got {}",
            params.len()
        )));
    }
    let (mu, sigma) = (params[0], params[1]);
    if !mu.is_finite() || !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!(
            "GaussianPdf parameters must be finite with sigma > 0, got mu={mu}, sigma={sigma}"
        )));
    }
    Ok((mu, sigma))
}

impl UnbinnedPdf for GaussianPdf {
    fn n_params(&self) -> usize {
        2
    }

    fn observables(&self) -> &[String] {
        &self.observables
    }

    fn log_prob_batch(&self, events: &EventStore, params: &[f64], out: &mut [f64]) -> Result<()> {
        let (mu, sigma) = check_params(params)?;

        let n = events.n_events();
        if out.len() != n {
            return Err(Error::Validation(format!(
                "GaussianPdf out length mismatch: expected {n}, got {}",
                out.len()
            )));
        }

        let obs = self.observables[0].as_str();
        let xs = events.require_column(obs)?;
        let (a, b) = events
            .bounds(obs)
            .ok_or_else(|| Error::Validation(format!("missing bounds for '{obs}'")))?;

        let inv_sigma = 1.0 / sigma;
        let mut z = standard_normal_cdf((b - mu) * inv_sigma) - standard_normal_cdf((a - mu) * inv_sigma);
        if !z.is_finite() || z <= 0.0 {
            // Extreme truncation: keep the cost finite.
            z = f64::MIN_POSITIVE;
        }
        let log_norm = z.ln() + sigma.ln();

        for (o, &x) in out.iter_mut().zip(xs) {
            *o = standard_normal_logpdf((x - mu) * inv_sigma) - log_norm;
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
        let (mu, sigma) = check_params(params)?;
        if support.len() != 1 {
            return Err(Error::Validation(format!(
                "GaussianPdf sample expects 1D support, got {}D",
                support.len()
            )));
        }
        let (a, b) = support[0];
        if !a.is_finite() || !b.is_finite() || a >= b {
            return Err(Error::Validation(format!(
                "GaussianPdf sample requires finite support with low < high, got ({a}, {b})"
            )));
        }

        let stdn = Normal::new(0.0, 1.0).map_err(|e| {
            Error::Computation(format!("failed to construct standard normal distribution: {e}"))
        })?;

        // Avoid inverse_cdf(0/1) infinities.
        let eps = 1e-15;
        let u_lo = stdn.cdf((a - mu) / sigma).clamp(eps, 1.0 - eps);
        let u_hi = stdn.cdf((b - mu) / sigma).clamp(eps, 1.0 - eps);
        if !(u_lo < u_hi) {
            return Err(Error::Validation(format!(
                "GaussianPdf sample has degenerate truncated CDF range: [{u_lo}, {u_hi}]"
            )));
        }

        let xs = (0..n_events)
            .map(|_| {
                let u = u_lo + (u_hi - u_lo) * u01(rng);
                (mu + sigma * stdn.inverse_cdf(u)).clamp(a, b)
            })
            .collect::<Vec<_>>();

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
    fn test_truncated_gaussian_normalizes_on_support() {
        let pdf = GaussianPdf::new("m");
        let n = 2001;
        let xs: Vec<f64> = (0..n).map(|i| 5300.0 + 500.0 * i as f64 / (n - 1) as f64).collect();
        let events = EventStore::from_columns(
            vec![ObservableSpec::branch("m", (5300.0, 5800.0))],
            vec![("m".to_string(), xs)],
        )
        .unwrap();
        let mut out = vec![0.0; n];
        pdf.log_prob_batch(&events, &[5367.0, 20.0], &mut out).unwrap();
        let h = 500.0 / (n - 1) as f64;
        let integral: f64 = out
            .iter()
            .enumerate()
            .map(|(i, lp)| if i == 0 || i == n - 1 { 0.5 * lp.exp() } else { lp.exp() })
            .sum::<f64>()
            * h;
        assert_relative_eq!(integral, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_sample_respects_support() {
        let pdf = GaussianPdf::new("eta");
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let store = pdf.sample(&[0.35, 0.2], 500, &[(0.0, 0.5)], &mut rng).unwrap();
        let col = store.column("eta").unwrap();
        assert_eq!(col.len(), 500);
        assert!(col.iter().all(|&x| (0.0..=0.5).contains(&x)));
    }
}
