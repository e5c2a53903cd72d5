//! Unbinned probability density functions for mass, PID and auxiliary observables.
//!
//! These are the collaborator shapes multiplied with the decay-time PDF. The set is minimal:
//! enough to run the pipeline end to end, not a catalogue.

use crate::event_store::EventStore;
use tdcpv_core::{Error, Result};
use rand::RngCore;
use std::sync::Arc;

mod exponential;
mod gaussian;
mod histogram;
mod poly_exp;
mod product;

pub use exponential::ExponentialPdf;
pub use gaussian::GaussianPdf;
pub use histogram::HistogramPdf;
pub use poly_exp::PolyExpPdf;
pub use product::ProductPdf;

/// Trait for normalized PDFs used in event-level likelihoods.
///
/// Implementations are expected to define a **proper density** on the observable support `Ω`
/// described by [`EventStore::bounds`].
pub trait UnbinnedPdf: Send + Sync {
    /// Number of shape parameters for this PDF.
    fn n_params(&self) -> usize;

    /// Observable names required by this PDF (stable order).
    fn observables(&self) -> &[String];

    /// Evaluate `log p(x | params)` for all events in the store.
    ///
    /// `out` must have length `events.n_events()`.
    fn log_prob_batch(&self, events: &EventStore, params: &[f64], out: &mut [f64]) -> Result<()>;

    /// Sample `n_events` from this PDF on the provided observable support `Ω`.
    ///
    /// `support` must be in the same order as [`Self::observables`].
    fn sample(
        &self,
        params: &[f64],
        n_events: usize,
        support: &[(f64, f64)],
        rng: &mut dyn RngCore,
    ) -> Result<EventStore>;
}

/// A 1-D PDF with frozen parameters, used to draw proto-data (mistag, time error).
#[derive(Clone)]
pub struct AuxiliaryPdf {
    pdf: Arc<dyn UnbinnedPdf>,
    params: Vec<f64>,
    support: (f64, f64),
}

impl std::fmt::Debug for AuxiliaryPdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxiliaryPdf")
            .field("observable", &self.pdf.observables())
            .field("params", &self.params)
            .field("support", &self.support)
            .finish()
    }
}

impl AuxiliaryPdf {
    /// Freeze `pdf` at `params` on `support`.
    pub fn new(pdf: Arc<dyn UnbinnedPdf>, params: Vec<f64>, support: (f64, f64)) -> Result<Self> {
        if pdf.observables().len() != 1 {
            return Err(Error::Validation(format!(
                "auxiliary PDFs must be 1-D, got {} observables",
                pdf.observables().len()
            )));
        }
        if pdf.n_params() != params.len() {
            return Err(Error::Validation(format!(
                "auxiliary PDF expects {} params, got {}",
                pdf.n_params(),
                params.len()
            )));
        }
        Ok(Self { pdf, params, support })
    }

    /// Observable name of the sampled column.
    pub fn observable(&self) -> &str {
        &self.pdf.observables()[0]
    }

    /// Draw `n` values.
    pub fn sample_column(&self, n: usize, rng: &mut dyn RngCore) -> Result<Vec<f64>> {
        let store = self.pdf.sample(&self.params, n, &[self.support], rng)?;
        Ok(store.require_column(self.observable())?.to_vec())
    }
}
