use crate::event_store::{EventStore, ObservableSpec};
use crate::math::u01;
use crate::pdf::UnbinnedPdf;
use tdcpv_core::{Error, Result};

/// Piecewise-constant histogram PDF normalized on the bin edges.
///
/// Templates for mistag and per-event time-error distributions are usually given this way.
/// The density is constant within each bin:
///
/// `p(x) = p_i / (x_{i+1} - x_i)` for `x ∈ [x_i, x_{i+1})`
#[derive(Debug, Clone)]
pub struct HistogramPdf {
    observables: [String; 1],
    bin_edges: Vec<f64>,
    log_density: Vec<f64>,
    /// Normalized cumulative bin masses, last entry exactly 1.
    cdf: Vec<f64>,
}

impl HistogramPdf {
    /// Construct a histogram PDF from edges and non-negative bin contents.
    ///
    /// `pseudo_count` is added to every bin content before normalization.
    pub fn from_edges_and_contents(
        observable: impl Into<String>,
        bin_edges: Vec<f64>,
        bin_content: Vec<f64>,
        pseudo_count: f64,
    ) -> Result<Self> {
        if bin_edges.len() < 2 {
            return Err(Error::Validation(format!(
                "HistogramPdf requires at least 2 bin edges, got {}",
                bin_edges.len()
            )));
        }
        if bin_content.len() + 1 != bin_edges.len() {
            return Err(Error::Validation(format!(
                "HistogramPdf bin_content length mismatch: expected {}, got {}",
                bin_edges.len() - 1,
                bin_content.len()
            )));
        }
        if !pseudo_count.is_finite() || pseudo_count < 0.0 {
            return Err(Error::Validation(format!(
                "HistogramPdf pseudo_count must be finite and >=0, got {pseudo_count}"
            )));
        }
        for (i, w) in bin_content.iter().enumerate() {
            if !w.is_finite() || *w < 0.0 {
                return Err(Error::Validation(format!(
                    "HistogramPdf bin_content[{i}] must be finite and >=0, got {w}"
                )));
            }
        }
        for i in 0..bin_edges.len() {
            let e = bin_edges[i];
            if !e.is_finite() {
                return Err(Error::Validation(format!(
                    "HistogramPdf bin_edges[{i}] must be finite, got {e}"
                )));
            }
            if i > 0 && bin_edges[i - 1] >= e {
                return Err(Error::Validation(format!(
                    "HistogramPdf bin edges must be strictly increasing, got edges[{}]={} and edges[{}]={}",
                    i - 1,
                    bin_edges[i - 1],
                    i,
                    e
                )));
            }
        }

        let total: f64 = bin_content.iter().map(|w| w + pseudo_count).sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(Error::Validation(format!(
                "HistogramPdf total content must be finite and >0 after pseudo_count, got {total}"
            )));
        }
        let log_total = total.ln();

        let mut log_density = Vec::with_capacity(bin_content.len());
        let mut cdf = Vec::with_capacity(bin_content.len());
        let mut cum = 0.0;
        for (i, &content) in bin_content.iter().enumerate() {
            let w = content + pseudo_count;
            let width = bin_edges[i + 1] - bin_edges[i];
            log_density.push(if w > 0.0 { w.ln() - log_total - width.ln() } else { f64::NEG_INFINITY });
            cum += w / total;
            cdf.push(cum);
        }
        if let Some(last) = cdf.last_mut() {
            *last = 1.0;
        }

        Ok(Self { observables: [observable.into()], bin_edges, log_density, cdf })
    }

    fn range(&self) -> (f64, f64) {
        (self.bin_edges[0], self.bin_edges[self.bin_edges.len() - 1])
    }

    fn check_support(&self, a: f64, b: f64) -> Result<()> {
        let (x_min, x_max) = self.range();
        let eps = 1e-12;
        if (a - x_min).abs() > eps || (b - x_max).abs() > eps {
            return Err(Error::Validation(format!(
                "HistogramPdf support mismatch: pdf=[{x_min}, {x_max}], support=({a}, {b})"
            )));
        }
        Ok(())
    }

    fn bin_index(&self, x: f64) -> Result<usize> {
        let (x_min, x_max) = self.range();
        if !x.is_finite() || x < x_min || x > x_max {
            return Err(Error::Validation(format!(
                "HistogramPdf x out of range: x={x} not in [{x_min}, {x_max}]"
            )));
        }
        let n_bins = self.log_density.len();
        // `k` is the number of edges <= x, so bin index is k-1.
        let k = self.bin_edges.partition_point(|e| *e <= x);
        Ok(k.saturating_sub(1).min(n_bins - 1))
    }
}

impl UnbinnedPdf for HistogramPdf {
    fn n_params(&self) -> usize {
        0
    }

    fn observables(&self) -> &[String] {
        &self.observables
    }

    fn log_prob_batch(&self, events: &EventStore, _params: &[f64], out: &mut [f64]) -> Result<()> {
        let n = events.n_events();
        if out.len() != n {
            return Err(Error::Validation(format!(
                "HistogramPdf out length mismatch: expected {n}, got {}",
                out.len()
            )));
        }
        let obs = self.observables[0].as_str();
        let xs = events.require_column(obs)?;
        let (a, b) = events
            .bounds(obs)
            .ok_or_else(|| Error::Validation(format!("missing bounds for '{obs}'")))?;
        self.check_support(a, b)?;

        for (o, &x) in out.iter_mut().zip(xs) {
            *o = self.log_density[self.bin_index(x)?];
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
        if !params.is_empty() {
            return Err(Error::Validation(format!(
                "HistogramPdf expects 0 params, got {}",
                params.len()
            )));
        }
        if support.len() != 1 {
            return Err(Error::Validation(format!(
                "HistogramPdf sample expects 1D support, got {}D",
                support.len()
            )));
        }
        let (a, b) = support[0];
        self.check_support(a, b)?;

        let n_bins = self.cdf.len();
        let xs = (0..n_events)
            .map(|_| {
                let u = u01(rng);
                let idx = self.cdf.partition_point(|p| *p < u).min(n_bins - 1);
                let lo = self.bin_edges[idx];
                let hi = self.bin_edges[idx + 1];
                (lo + (hi - lo) * u01(rng)).clamp(a, b)
            })
            .collect::<Vec<_>>();

        let name = self.observables[0].clone();
        EventStore::from_columns(vec![ObservableSpec::branch(name.clone(), (a, b))], vec![(name, xs)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_empty_bins_are_never_sampled() {
        let pdf = HistogramPdf::from_edges_and_contents(
            "sigma_t",
            vec![0.01, 0.03, 0.05, 0.08],
            vec![10.0, 0.0, 5.0],
            0.0,
        )
        .unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let store = pdf.sample(&[], 2000, &[(0.01, 0.08)], &mut rng).unwrap();
        let xs = store.column("sigma_t").unwrap();
        assert!(xs.iter().all(|&x| !(x > 0.03 && x < 0.05)));
    }

    #[test]
    fn test_rejects_non_increasing_edges() {
        let err =
            HistogramPdf::from_edges_and_contents("x", vec![0.0, 1.0, 1.0], vec![1.0, 1.0], 0.0);
        assert!(err.is_err());
    }
}
