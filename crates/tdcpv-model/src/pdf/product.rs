use std::sync::Arc;

use crate::event_store::{EventStore, ObservableSpec};
use crate::pdf::UnbinnedPdf;
use tdcpv_core::{Error, Result};

/// Product of independent PDFs: `p(x₁, x₂, …) = p₁(x₁) × p₂(x₂) × …`
///
/// Each component PDF reads its own observable columns from the shared [`EventStore`].
/// Shape parameters are packed contiguously: `[comp0_params…, comp1_params…, …]`.
pub struct ProductPdf {
    components: Vec<Arc<dyn UnbinnedPdf>>,
    /// Flattened observable names (stable order).
    all_observables: Vec<String>,
    total_params: usize,
    /// Component `i` owns params `[offsets[i]..offsets[i+1])`.
    param_offsets: Vec<usize>,
}

impl std::fmt::Debug for ProductPdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductPdf")
            .field("observables", &self.all_observables)
            .field("n_params", &self.total_params)
            .finish()
    }
}

impl ProductPdf {
    /// Build a product PDF from a list of independent component PDFs.
    ///
    /// Observable names across components must be disjoint.
    pub fn new(components: Vec<Arc<dyn UnbinnedPdf>>) -> Result<Self> {
        if components.is_empty() {
            return Err(Error::Validation("ProductPdf requires at least one component".into()));
        }

        let mut all_observables: Vec<String> = Vec::new();
        let mut param_offsets = Vec::with_capacity(components.len() + 1);
        let mut total_params = 0usize;

        for (i, comp) in components.iter().enumerate() {
            for name in comp.observables() {
                if all_observables.contains(name) {
                    return Err(Error::Validation(format!(
                        "ProductPdf: observable '{name}' appears in component {i} but was already \
                         claimed by an earlier component"
                    )));
                }
                all_observables.push(name.clone());
            }
            param_offsets.push(total_params);
            total_params += comp.n_params();
        }
        param_offsets.push(total_params);

        Ok(Self { components, all_observables, total_params, param_offsets })
    }

    fn check_params(&self, params: &[f64]) -> Result<()> {
        if params.len() != self.total_params {
            return Err(Error::Validation(format!(
                "ProductPdf expects {} params, got {}",
                self.total_params,
                params.len()
            )));
        }
        Ok(())
    }
}

impl UnbinnedPdf for ProductPdf {
    fn n_params(&self) -> usize {
        self.total_params
    }

    fn observables(&self) -> &[String] {
        &self.all_observables
    }

    fn log_prob_batch(&self, events: &EventStore, params: &[f64], out: &mut [f64]) -> Result<()> {
        self.check_params(params)?;
        let n = events.n_events();
        if out.len() != n {
            return Err(Error::Validation(format!(
                "ProductPdf out length mismatch: expected {n}, got {}",
                out.len()
            )));
        }

        out.fill(0.0);
        let mut tmp = vec![0.0f64; n];
        for (i, comp) in self.components.iter().enumerate() {
            let comp_params = &params[self.param_offsets[i]..self.param_offsets[i + 1]];
            comp.log_prob_batch(events, comp_params, &mut tmp)?;
            for (o, t) in out.iter_mut().zip(&tmp) {
                *o += t;
            }
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
        self.check_params(params)?;
        if support.len() != self.all_observables.len() {
            return Err(Error::Validation(format!(
                "ProductPdf sample expects {}D support, got {}D",
                self.all_observables.len(),
                support.len()
            )));
        }

        // Sample each component independently, then merge columns.
        let mut all_columns: Vec<(String, Vec<f64>)> = Vec::new();
        let mut obs_offset = 0usize;
        for (i, comp) in self.components.iter().enumerate() {
            let comp_params = &params[self.param_offsets[i]..self.param_offsets[i + 1]];
            let comp_n_obs = comp.observables().len();
            let comp_support = &support[obs_offset..obs_offset + comp_n_obs];
            let comp_events = comp.sample(comp_params, n_events, comp_support, rng)?;

            for obs_name in comp.observables() {
                let col = comp_events.column(obs_name).ok_or_else(|| {
                    Error::Computation(format!(
                        "ProductPdf: component {i} sample() did not produce column '{obs_name}'"
                    ))
                })?;
                all_columns.push((obs_name.clone(), col.to_vec()));
            }
            obs_offset += comp_n_obs;
        }

        let obs_specs: Vec<ObservableSpec> = self
            .all_observables
            .iter()
            .zip(support)
            .map(|(name, &bounds)| ObservableSpec::branch(name.clone(), bounds))
            .collect();
        EventStore::from_columns(obs_specs, all_columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::{ExponentialPdf, GaussianPdf};
    use rand::SeedableRng;

    #[test]
    fn test_product_sums_component_log_probs() {
        let product = ProductPdf::new(vec![
            Arc::new(GaussianPdf::new("mass")),
            Arc::new(ExponentialPdf::new("pid")),
        ])
        .unwrap();
        assert_eq!(product.n_params(), 3);

        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let params = [5367.0, 20.0, -0.3];
        let support = [(5300.0, 5800.0), (0.0, 5.0)];
        let events = product.sample(&params, 50, &support, &mut rng).unwrap();

        let mut total = vec![0.0; 50];
        product.log_prob_batch(&events, &params, &mut total).unwrap();

        let mut g = vec![0.0; 50];
        let mut e = vec![0.0; 50];
        GaussianPdf::new("mass").log_prob_batch(&events, &params[..2], &mut g).unwrap();
        ExponentialPdf::new("pid").log_prob_batch(&events, &params[2..], &mut e).unwrap();
        for i in 0..50 {
            assert!((total[i] - g[i] - e[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rejects_shared_observables() {
        let err = ProductPdf::new(vec![
            Arc::new(GaussianPdf::new("mass")),
            Arc::new(ExponentialPdf::new("mass")),
        ]);
        assert!(err.is_err());
    }
}
