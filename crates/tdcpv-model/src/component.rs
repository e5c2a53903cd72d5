//! Components: decay-time PDF × mass/PID shapes × yield, one per
//! (process, submode, final-state charge) cell.

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tdcpv_core::{Error, Result};

use crate::context::{BuildContext, ParamId};
use crate::decay_rate::{DecayTimePdf, PreparedDecayTime};
use crate::event_store::{EventStore, ObservableSpec};
use crate::pdf::{AuxiliaryPdf, ExponentialPdf, GaussianPdf, HistogramPdf, ProductPdf, UnbinnedPdf};
use crate::spec::{ShapePdfSpec, ShapeSpec, YieldSpec};

/// Column holding the index of the generating process in toys.
pub const TRUE_ID_COLUMN: &str = "true_id";
/// Column holding the submode index.
pub const SUBMODE_COLUMN: &str = "submode";

/// Final-state charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Charge {
    Plus,
    Minus,
}

impl Charge {
    pub const BOTH: [Charge; 2] = [Charge::Plus, Charge::Minus];

    /// `qf = ±1`.
    pub fn sign(self) -> f64 {
        match self {
            Self::Plus => 1.0,
            Self::Minus => -1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Plus => "plus",
            Self::Minus => "minus",
        }
    }
}

/// Split a total yield into `(plus, minus)` with the detection asymmetry `A`:
/// `plus = Y/2 (1 + A)`, `minus = Y - plus`.
///
/// The smaller share is computed first and the larger one as the remainder, so that the two
/// always add up to `Y` exactly.
pub fn split_yield(total: f64, detection_asymmetry: Option<f64>) -> Result<(f64, f64)> {
    if !(total.is_finite() && total >= 0.0) {
        return Err(Error::Validation(format!("yield must be finite and >= 0, got {total}")));
    }
    let a = detection_asymmetry.unwrap_or(0.0);
    if !(a.is_finite() && a.abs() <= 1.0) {
        return Err(Error::Validation(format!("detection asymmetry {a} outside [-1, 1]")));
    }
    if a >= 0.0 {
        let minus = 0.5 * total * (1.0 - a);
        Ok((total - minus, minus))
    } else {
        let plus = 0.5 * total * (1.0 + a);
        Ok((plus, total - plus))
    }
}

/// Column layout of every dataset built from one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetLayout {
    pub time: ObservableSpec,
    pub time_error: Option<ObservableSpec>,
    pub charge: ObservableSpec,
    /// Decision column per tagger.
    pub decisions: Vec<ObservableSpec>,
    /// Mistag column per tagger, for per-event mistags.
    pub mistags: Vec<Option<ObservableSpec>>,
    pub extra: Vec<ObservableSpec>,
    pub true_id: ObservableSpec,
    pub submode: ObservableSpec,
}

impl DatasetLayout {
    /// All observables in storage order.
    pub fn observables(&self) -> Vec<ObservableSpec> {
        let mut out = vec![self.time.clone()];
        out.extend(self.time_error.iter().cloned());
        out.extend(self.decisions.iter().cloned());
        out.extend(self.mistags.iter().flatten().cloned());
        out.push(self.charge.clone());
        out.extend(self.extra.iter().cloned());
        out.push(self.true_id.clone());
        out.push(self.submode.clone());
        out
    }
}

/// Per-event conditional inputs drawn before the main generation step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtoData {
    /// Mistag per tagger (`None` for average-mistag taggers).
    pub mistags: Vec<Option<Vec<f64>>>,
    pub time_error: Option<Vec<f64>>,
}

/// Mass/PID shapes of a process with their parameter handles.
#[derive(Debug, Clone)]
pub struct ShapeModel {
    pdf: Arc<ProductPdf>,
    params: Vec<ParamId>,
    support: Vec<(f64, f64)>,
}

impl ShapeModel {
    /// Build one factor per observable, registering `<process>_<observable>_<param>`.
    ///
    /// The shapes must cover `extra` exactly.
    pub fn build(
        ctx: &mut BuildContext,
        process: &str,
        shapes: &[ShapeSpec],
        extra: &[ObservableSpec],
    ) -> Result<Option<Self>> {
        let component = format!("process '{process}'");
        for obs in extra {
            if !shapes.iter().any(|s| s.observable == obs.name) {
                return Err(Error::config(&component, format!("no shape for observable '{}'", obs.name)));
            }
        }
        if shapes.is_empty() {
            return Ok(None);
        }
        let mut factors: Vec<Arc<dyn UnbinnedPdf>> = Vec::with_capacity(shapes.len());
        let mut params = Vec::new();
        let mut support = Vec::with_capacity(shapes.len());
        for shape in shapes {
            let obs = extra.iter().find(|o| o.name == shape.observable).ok_or_else(|| {
                Error::config(&component, format!("shape for undeclared observable '{}'", shape.observable))
            })?;
            let (lo, hi) = obs.bounds;
            let prefix = format!("{process}_{}", obs.name);
            let pdf: Arc<dyn UnbinnedPdf> = match &shape.pdf {
                ShapePdfSpec::Gaussian { mu, sigma } => {
                    params.push(ctx.get_or_create_param(&format!("{prefix}_mu"), *mu, (lo, hi))?);
                    params.push(ctx.get_or_create_param(
                        &format!("{prefix}_sigma"),
                        *sigma,
                        (0.0, (hi - lo).max(*sigma)),
                    )?);
                    Arc::new(GaussianPdf::new(obs.name.clone()))
                }
                ShapePdfSpec::Exponential { lambda } => {
                    params.push(ctx.get_or_create_param(
                        &format!("{prefix}_lambda"),
                        *lambda,
                        (lambda.min(-1.0), lambda.max(1.0)),
                    )?);
                    Arc::new(ExponentialPdf::new(obs.name.clone()))
                }
                ShapePdfSpec::Histogram { edges, contents } => {
                    if edges.first() != Some(&lo) || edges.last() != Some(&hi) {
                        return Err(Error::config(
                            &component,
                            format!("histogram edges of '{}' must span its range [{lo}, {hi}]", obs.name),
                        ));
                    }
                    Arc::new(
                        HistogramPdf::from_edges_and_contents(obs.name.clone(), edges.clone(), contents.clone(), 0.0)
                            .map_err(|e| Error::config(&component, e.to_string()))?,
                    )
                }
            };
            factors.push(pdf);
            support.push((lo, hi));
        }
        let pdf = Arc::new(ProductPdf::new(factors).map_err(|e| Error::config(&component, e.to_string()))?);
        Ok(Some(Self { pdf, params, support }))
    }

    fn values(&self, params: &[f64]) -> Vec<f64> {
        self.params.iter().map(|p| params[p.0]).collect()
    }

    pub fn log_prob_batch(&self, events: &EventStore, params: &[f64], out: &mut [f64]) -> Result<()> {
        self.pdf.log_prob_batch(events, &self.values(params), out)
    }

    pub fn sample(&self, params: &[f64], n: usize, rng: &mut dyn RngCore) -> Result<EventStore> {
        self.pdf.sample(&self.values(params), n, &self.support, rng)
    }
}

/// One (process, submode, charge) cell.
#[derive(Debug)]
pub struct ComponentPdf {
    name: String,
    process: String,
    process_index: usize,
    submode: String,
    submode_index: usize,
    charge: Charge,
    time: Arc<DecayTimePdf>,
    shapes: Option<Arc<ShapeModel>>,
    yield_param: ParamId,
    /// Generation PDF of the mistag, per tagger.
    mistag_pdfs: Vec<Option<Arc<AuxiliaryPdf>>>,
    time_error_pdf: Option<Arc<AuxiliaryPdf>>,
}

/// Everything a [`ComponentPdf`] is built from, apart from its yield value.
#[derive(Debug, Clone)]
pub struct CellSource {
    pub process: String,
    pub process_index: usize,
    pub submode: String,
    pub submode_index: usize,
    pub time: Arc<DecayTimePdf>,
    pub shapes: Option<Arc<ShapeModel>>,
    pub mistag_pdfs: Vec<Option<Arc<AuxiliaryPdf>>>,
    pub time_error_pdf: Option<Arc<AuxiliaryPdf>>,
}

impl ComponentPdf {
    /// Build both charge components of a submode and register them in the context as
    /// `<process>_<submode>_<plus|minus>`.
    pub fn build_pair(
        ctx: &mut BuildContext,
        source: &CellSource,
        yield_spec: &YieldSpec,
        detection_asymmetry: Option<f64>,
    ) -> Result<[Arc<Self>; 2]> {
        let (plus, minus) = match *yield_spec {
            YieldSpec::Total { value } => split_yield(value, detection_asymmetry).map_err(|e| {
                Error::config(format!("process '{}'", source.process), e.to_string())
            })?,
            YieldSpec::PerCharge { plus, minus } => (plus, minus),
        };
        let mut built = Vec::with_capacity(2);
        for (charge, value) in [(Charge::Plus, plus), (Charge::Minus, minus)] {
            let name = format!("{}_{}_{}", source.process, source.submode, charge.label());
            let component: Arc<Self> = ctx.get_or_create(&name, |ctx| {
                let yield_param =
                    ctx.get_or_create_param(&format!("n_{name}"), value, (0.0, 10.0 * value + 100.0))?;
                Ok(Self {
                    name: name.clone(),
                    process: source.process.clone(),
                    process_index: source.process_index,
                    submode: source.submode.clone(),
                    submode_index: source.submode_index,
                    charge,
                    time: source.time.clone(),
                    shapes: source.shapes.clone(),
                    yield_param,
                    mistag_pdfs: source.mistag_pdfs.clone(),
                    time_error_pdf: source.time_error_pdf.clone(),
                })
            })?;
            built.push(component);
        }
        let minus = built.pop();
        let plus = built.pop();
        match (plus, minus) {
            (Some(p), Some(m)) => Ok([p, m]),
            _ => Err(Error::Computation("component pair construction failed".into())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> &str {
        &self.process
    }

    pub fn process_index(&self) -> usize {
        self.process_index
    }

    pub fn submode(&self) -> &str {
        &self.submode
    }

    pub fn submode_index(&self) -> usize {
        self.submode_index
    }

    pub fn charge(&self) -> Charge {
        self.charge
    }

    pub fn time_pdf(&self) -> &Arc<DecayTimePdf> {
        &self.time
    }

    pub fn yield_param(&self) -> ParamId {
        self.yield_param
    }

    /// Expected number of events `ν`.
    pub fn expected_events(&self, params: &[f64]) -> f64 {
        params[self.yield_param.0]
    }

    /// `log p(x)` for every event given an already prepared decay-time PDF of this process.
    pub fn log_prob_prepared(
        &self,
        prepared: &PreparedDecayTime<'_>,
        events: &EventStore,
        params: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        prepared.log_prob_batch(events, out)?;
        if let Some(shapes) = &self.shapes {
            let mut shape = vec![0.0; events.n_events()];
            shapes.log_prob_batch(events, params, &mut shape)?;
            for (o, s) in out.iter_mut().zip(&shape) {
                *o += s;
            }
        }
        Ok(())
    }

    /// `log p(x)` for every event.
    pub fn log_prob_batch(&self, events: &EventStore, params: &[f64], out: &mut [f64]) -> Result<()> {
        let prepared = self.time.prepare(params)?;
        self.log_prob_prepared(&prepared, events, params, out)
    }

    /// Check that every per-event input of `layout` can be generated for this cell.
    pub fn check_generation(&self, layout: &DatasetLayout) -> Result<()> {
        let component = format!("process '{}'", self.process);
        for (i, t) in self.time.tagging().taggers().iter().enumerate() {
            if t.mistag_column().is_some() && self.mistag_pdfs.get(i).and_then(Option::as_ref).is_none() {
                return Err(Error::config(
                    component,
                    format!("tagger '{}' has per-event mistag but no mistag PDF to generate it", t.name),
                ));
            }
        }
        if layout.time_error.is_some() && self.time_error_pdf.is_none() {
            return Err(Error::config(
                component,
                "time-error observable declared but no time-error PDF to generate it",
            ));
        }
        Ok(())
    }

    /// Draw the per-event conditional inputs (mistags, time error).
    pub fn sample_proto(&self, layout: &DatasetLayout, n: usize, rng: &mut dyn RngCore) -> Result<ProtoData> {
        self.check_generation(layout)?;
        let mut mistags = Vec::with_capacity(self.mistag_pdfs.len());
        for (t, pdf) in self.time.tagging().taggers().iter().zip(&self.mistag_pdfs) {
            mistags.push(match (t.mistag_column(), pdf) {
                (Some(_), Some(pdf)) => Some(pdf.sample_column(n, rng)?),
                _ => None,
            });
        }
        let time_error = match (&layout.time_error, &self.time_error_pdf) {
            (Some(_), Some(pdf)) => Some(pdf.sample_column(n, rng)?),
            _ => None,
        };
        Ok(ProtoData { mistags, time_error })
    }

    /// Draw the full events of this cell, conditional on `proto`.
    pub fn sample_main(
        &self,
        layout: &DatasetLayout,
        params: &[f64],
        proto: &ProtoData,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<EventStore> {
        let prepared = self.time.prepare(params)?;
        let n_taggers = self.time.tagging().taggers().len();
        let qf = self.charge.sign();
        let mut eta = prepared.average_eta();
        let mut times = Vec::with_capacity(n);
        let mut decisions = vec![Vec::with_capacity(n); n_taggers];
        for i in 0..n {
            for (j, col) in proto.mistags.iter().enumerate() {
                if let Some(col) = col {
                    eta[j] = col[i];
                }
            }
            let sigma_t = proto.time_error.as_ref().map(|c| c[i]);
            let (t, q) = prepared.sample_event(rng, &eta, sigma_t, qf)?;
            times.push(t);
            for (col, qj) in decisions.iter_mut().zip(q) {
                col.push(f64::from(qj));
            }
        }

        let mut columns: Vec<(String, Vec<f64>)> = vec![(layout.time.name.clone(), times)];
        if let (Some(spec), Some(col)) = (&layout.time_error, &proto.time_error) {
            columns.push((spec.name.clone(), col.clone()));
        }
        for (spec, col) in layout.decisions.iter().zip(decisions) {
            columns.push((spec.name.clone(), col));
        }
        for (spec, col) in layout.mistags.iter().zip(&proto.mistags) {
            if let (Some(spec), Some(col)) = (spec, col) {
                columns.push((spec.name.clone(), col.clone()));
            }
        }
        columns.push((layout.charge.name.clone(), vec![qf; n]));
        if let Some(shapes) = &self.shapes {
            let drawn = shapes.sample(params, n, rng)?;
            for spec in &layout.extra {
                columns.push((spec.name.clone(), drawn.require_column(&spec.name)?.to_vec()));
            }
        }
        columns.push((layout.true_id.name.clone(), vec![self.process_index as f64; n]));
        columns.push((layout.submode.name.clone(), vec![self.submode_index as f64; n]));
        EventStore::from_columns(layout.observables(), columns)
    }
}

/// A process with its decay-time PDF, shapes and cells.
#[derive(Debug, Clone)]
pub struct ProcessModel {
    pub name: String,
    pub index: usize,
    pub time: Arc<DecayTimePdf>,
    pub shapes: Option<Arc<ShapeModel>>,
    /// Cells in (submode, charge) order.
    pub components: Vec<Arc<ComponentPdf>>,
}
