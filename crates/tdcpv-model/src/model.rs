//! Extended unbinned likelihood over all (process × submode × charge) cells.
//!
//! `NLL = Σ_c ν_c − Σ_events log Σ_{c ∈ cells(event)} ν_c · p_c(x)`, where the cells of an
//! event are the components sharing its submode and final-state charge. Mistag and time-error
//! columns enter as conditional observables.

use std::sync::Arc;

use tdcpv_core::{Error, LogDensityModel, Result};

use crate::component::ComponentPdf;
use crate::context::{ParamId, Parameter};
use crate::decay_rate::DecayTimePdf;
use crate::event_store::EventStore;
use crate::math::logsumexp;
use crate::spec::CompiledAnalysis;

/// Added to the NLL per event whose mixture density is not positive.
pub const INVALID_EVENT_PENALTY: f64 = 1e4;

/// Events of one (submode, charge) cell and the components that can produce them.
#[derive(Debug, Clone)]
struct CellData {
    events: EventStore,
    /// Indices into `CpFitModel::components`.
    components: Vec<usize>,
}

/// Fit model for one dataset.
///
/// Free parameters are the non-constant parameters of the build context, in registration
/// order. Constant parameters stay at their configured values.
#[derive(Debug, Clone)]
pub struct CpFitModel {
    parameters: Vec<Parameter>,
    free: Vec<ParamId>,
    components: Vec<Arc<ComponentPdf>>,
    /// Per component: index of its process in `processes`.
    process_of: Vec<usize>,
    processes: Vec<Arc<DecayTimePdf>>,
    cells: Vec<CellData>,
    n_events: usize,
}

impl CpFitModel {
    /// Bind a compiled analysis to a dataset.
    ///
    /// The dataset needs every column the decay-time PDFs read, plus the submode column when
    /// more than one submode is declared.
    pub fn new(analysis: &CompiledAnalysis, data: &EventStore) -> Result<Self> {
        let parameters = analysis.context.parameters().to_vec();
        let free = parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.constant)
            .map(|(i, _)| ParamId(i))
            .collect::<Vec<_>>();

        let processes = analysis.processes.iter().map(|p| p.time.clone()).collect::<Vec<_>>();
        let mut components = Vec::new();
        let mut process_of = Vec::new();
        for (pi, p) in analysis.processes.iter().enumerate() {
            for c in &p.components {
                components.push(c.clone());
                process_of.push(pi);
            }
        }
        if components.is_empty() {
            return Err(Error::config("model", "no components to fit"));
        }
        for time in &processes {
            for col in time.required_columns() {
                data.require_column(&col)?;
            }
        }

        let charge = data.require_column(&analysis.layout.charge.name)?;
        let n = data.n_events();
        let submode: Vec<usize> = match data.column(&analysis.layout.submode.name) {
            Some(col) => col.iter().map(|&v| v.round() as usize).collect(),
            None if analysis.submodes.len() == 1 => vec![0; n],
            None => {
                return Err(Error::Validation(format!(
                    "dataset has no '{}' column but {} submodes are declared",
                    analysis.layout.submode.name,
                    analysis.submodes.len()
                )));
            }
        };

        let n_sub = analysis.submodes.len();
        let mut rows: Vec<Vec<usize>> = vec![Vec::new(); 2 * n_sub];
        for i in 0..n {
            if submode[i] >= n_sub {
                return Err(Error::Validation(format!("event {i}: submode index {} out of range", submode[i])));
            }
            rows[2 * submode[i] + usize::from(charge[i] < 0.0)].push(i);
        }

        let mut cells = Vec::new();
        for (key, rows) in rows.into_iter().enumerate() {
            let members = components
                .iter()
                .enumerate()
                .filter(|(_, c)| 2 * c.submode_index() + usize::from(c.charge().sign() < 0.0) == key)
                .map(|(k, _)| k)
                .collect::<Vec<_>>();
            if rows.is_empty() {
                continue;
            }
            if members.is_empty() {
                return Err(Error::Validation(format!(
                    "{} event(s) in submode '{}' with charge {} have no component to describe them",
                    rows.len(),
                    analysis.submodes[key / 2],
                    if key % 2 == 0 { "+1" } else { "-1" }
                )));
            }
            cells.push(CellData { events: data.select(&rows)?, components: members });
        }

        log::debug!(
            "fit model: {} events, {} components, {} free parameters",
            n,
            components.len(),
            free.len()
        );
        Ok(Self { parameters, free, components, process_of, processes, cells, n_events: n })
    }

    /// Number of events in the dataset.
    pub fn n_events(&self) -> usize {
        self.n_events
    }

    /// All parameters (free and constant) at their initial values.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Full parameter vector with the free entries replaced by `free_values`.
    pub fn expand(&self, free_values: &[f64]) -> Result<Vec<f64>> {
        if free_values.len() != self.free.len() {
            return Err(Error::Validation(format!(
                "expected {} free parameter values, got {}",
                self.free.len(),
                free_values.len()
            )));
        }
        let mut full = self.parameters.iter().map(|p| p.value).collect::<Vec<_>>();
        for (id, &v) in self.free.iter().zip(free_values) {
            full[id.0] = v;
        }
        Ok(full)
    }

    /// NLL at a full parameter vector.
    pub fn nll_full(&self, params: &[f64]) -> Result<f64> {
        let prepared = self.processes.iter().map(|p| p.prepare(params)).collect::<Result<Vec<_>>>()?;

        let mut nll = 0.0;
        let mut invalid = 0usize;
        for c in &self.components {
            nll += c.expected_events(params);
        }

        for cell in &self.cells {
            let n = cell.events.n_events();
            let mut logps = Vec::with_capacity(cell.components.len());
            let mut log_nu = Vec::with_capacity(cell.components.len());
            for &k in &cell.components {
                let comp = &self.components[k];
                let mut out = vec![0.0; n];
                comp.log_prob_prepared(&prepared[self.process_of[k]], &cell.events, params, &mut out)?;
                logps.push(out);
                let nu = comp.expected_events(params);
                log_nu.push(if nu > 0.0 { nu.ln() } else { f64::NEG_INFINITY });
            }
            let mut terms = vec![0.0; cell.components.len()];
            for i in 0..n {
                for (j, t) in terms.iter_mut().enumerate() {
                    *t = log_nu[j] + logps[j][i];
                }
                let lse = logsumexp(&terms);
                if lse.is_finite() {
                    nll -= lse;
                } else {
                    invalid += 1;
                }
            }
        }
        if invalid > 0 {
            log::debug!("{invalid} event(s) with non-positive density, NLL penalised");
            nll += INVALID_EVENT_PENALTY * invalid as f64;
        }
        if nll.is_nan() {
            return Err(Error::Computation("NLL evaluated to NaN".into()));
        }
        Ok(nll)
    }
}

impl LogDensityModel for CpFitModel {
    fn dim(&self) -> usize {
        self.free.len()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.free.iter().map(|id| self.parameters[id.0].name.clone()).collect()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.free.iter().map(|id| self.parameters[id.0].bounds).collect()
    }

    fn parameter_init(&self) -> Vec<f64> {
        self.free.iter().map(|id| self.parameters[id.0].value).collect()
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        self.nll_full(&self.expand(params)?)
    }
}
