//! Analysis configuration (`tdcpv_analysis_spec_v0`) and its compilation into a model.
//!
//! The JSON layout mirrors the analysis: global observables and submodes, the taggers, a
//! default resolution and acceptance, and one entry per physics process. Variant choices
//! (`cp`, `resolution`, `acceptance`, mistag and time-error PDFs, yields) are tagged unions
//! keyed by `"type"`.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tdcpv_core::{Error, Result};

use crate::acceptance::AcceptanceModel;
use crate::component::{
    CellSource, ComponentPdf, DatasetLayout, ProcessModel, ShapeModel, SUBMODE_COLUMN, TRUE_ID_COLUMN,
};
use crate::context::BuildContext;
use crate::decay_rate::DecayTimePdf;
use crate::event_store::ObservableSpec;
use crate::pdf::{AuxiliaryPdf, GaussianPdf, HistogramPdf, PolyExpPdf, UnbinnedPdf};
use crate::resolution::ResolutionModel;
use crate::tagging::TaggingModel;

pub const ANALYSIS_SPEC_V0: &str = "tdcpv_analysis_spec_v0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSpecV0 {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema_uri: Option<String>,
    pub schema_version: String,
    pub observables: ObservablesSpec,
    pub submodes: Vec<String>,
    #[serde(default)]
    pub taggers: Vec<TaggerSpec>,
    #[serde(default)]
    pub tagging: TaggingSpec,
    pub resolution: ResolutionSpec,
    #[serde(default)]
    pub acceptance: AcceptanceSpec,
    pub processes: Vec<ProcessSpec>,
    /// Parameter names (a trailing `*` matches a prefix) held fixed in fits.
    #[serde(default)]
    pub constant_params: Vec<String>,
    /// Parameters released again after `constant_params` was applied.
    #[serde(default)]
    pub floating_params: Vec<String>,
    /// Interval of floating CP coefficients.
    #[serde(default = "default_coefficient_interval")]
    pub coefficient_interval: [f64; 2],
    #[serde(default)]
    pub generation: GenerationSpec,
}

fn default_coefficient_interval() -> [f64; 2] {
    [-4.0, 4.0]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservablesSpec {
    pub time: RangeSpec,
    /// Per-event decay-time error. Required by `per_event` resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_error: Option<RangeSpec>,
    /// Final-state charge column.
    #[serde(default = "default_charge_column")]
    pub charge: String,
    /// Mass / PID observables consumed by the process shapes.
    #[serde(default)]
    pub extra: Vec<RangeSpec>,
}

fn default_charge_column() -> String {
    "qf".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeSpec {
    pub name: String,
    pub range: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggerSpec {
    pub name: String,
    /// Decision column (values -1, 0, +1).
    pub decision: String,
    pub calibration: CalibrationSpec,
    #[serde(default)]
    pub mistag: MistagSpec,
    /// Declared domain of the raw mistag η; must lie inside `[0, 1)`.
    #[serde(default = "default_eta_domain")]
    pub eta_domain: [f64; 2],
    pub efficiency: f64,
    #[serde(default)]
    pub efficiency_asymmetry: f64,
}

fn default_eta_domain() -> [f64; 2] {
    [0.0, 0.5]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationSpec {
    pub p0: f64,
    pub p1: f64,
    #[serde(default)]
    pub dp0: f64,
    #[serde(default)]
    pub dp1: f64,
    pub avg_eta: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MistagSpec {
    /// η ≡ ⟨η⟩ for every event.
    #[default]
    Average,
    /// η is an event column; generation draws it from `pdf`.
    PerEvent {
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pdf: Option<AuxPdfSpec>,
    },
}

/// Auxiliary (proto-data) distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuxPdfSpec {
    /// Template from bin edges and contents.
    Histogram { edges: Vec<f64>, contents: Vec<f64> },
    /// Parametric stand-in: a truncated Gaussian for mistags, `xⁿ exp(-x/τ)` for time errors.
    Mock {
        #[serde(default)]
        mean: Option<f64>,
        #[serde(default)]
        sigma: Option<f64>,
        #[serde(default)]
        exponent: Option<f64>,
        #[serde(default)]
        tau: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagCombinationSpec {
    #[default]
    Product,
    Sum,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaggingSpec {
    #[serde(default)]
    pub combination: TagCombinationSpec,
    /// Perfect tagging: ω = 0, ε = 1. Only valid with a single tagger.
    #[serde(default)]
    pub perfect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionSpec {
    Perfect,
    Mean {
        components: Vec<GaussComponentSpec>,
        #[serde(default = "one")]
        scale: f64,
        #[serde(default)]
        bias: f64,
    },
    PerEvent {
        #[serde(default = "one")]
        scale: f64,
        #[serde(default)]
        offset: f64,
        #[serde(default)]
        bias: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_error_pdf: Option<AuxPdfSpec>,
    },
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GaussComponentSpec {
    pub sigma: f64,
    /// Ignored for the last component (1 - Σ others).
    #[serde(default)]
    pub fraction: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcceptanceSpec {
    #[default]
    None,
    Spline {
        knots: Vec<f64>,
        coefficients: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        binning: Option<usize>,
    },
    PowerLaw {
        beta: f64,
        exponent: f64,
        #[serde(default)]
        offset: f64,
        #[serde(default)]
        slope: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ratio: Option<AcceptanceRatioSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        binning: Option<usize>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcceptanceRatioSpec {
    Fixed { value: f64 },
    Histogram { edges: Vec<f64>, values: Vec<f64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CpSpec {
    Amplitudes {
        #[serde(default)]
        arg_lf: Option<f64>,
        #[serde(default)]
        arg_lbar_fbar: Option<f64>,
        #[serde(default)]
        mod_lf: Option<f64>,
    },
    Phases {
        #[serde(default)]
        strong_phase: Option<f64>,
        #[serde(default)]
        weak_phase: Option<f64>,
        #[serde(default)]
        modulus: Option<f64>,
    },
    Direct {
        #[serde(default)]
        c: Option<f64>,
        #[serde(default)]
        s: Option<f64>,
        #[serde(default)]
        d: Option<f64>,
        #[serde(default)]
        sbar: Option<f64>,
        #[serde(default)]
        dbar: Option<f64>,
    },
    FlavourSpecific,
    NonMixing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecaySpec {
    pub gamma: f64,
    #[serde(default)]
    pub delta_gamma: f64,
    #[serde(default)]
    pub delta_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    /// Prefix of the decay-constant parameters; processes of the same meson share them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meson: Option<String>,
    pub decay: DecaySpec,
    pub cp: CpSpec,
    #[serde(default)]
    pub production_asymmetry: f64,
    /// `None` disables the detection asymmetry (50/50 charge split).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_asymmetry: Option<f64>,
    /// Per-tagger efficiency overriding the tagger default.
    #[serde(default)]
    pub tag_efficiency: BTreeMap<String, f64>,
    /// Per-tagger efficiency asymmetry overriding the tagger default.
    #[serde(default)]
    pub tag_efficiency_asymmetry: BTreeMap<String, f64>,
    /// Per-tagger mistag PDF overriding the tagger's.
    #[serde(default)]
    pub mistag_pdf: BTreeMap<String, AuxPdfSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<AcceptanceSpec>,
    #[serde(default)]
    pub shapes: Vec<ShapeSpec>,
    pub yields: Vec<SubmodeYieldSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeSpec {
    pub observable: String,
    pub pdf: ShapePdfSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShapePdfSpec {
    Gaussian { mu: f64, sigma: f64 },
    Exponential { lambda: f64 },
    Histogram { edges: Vec<f64>, contents: Vec<f64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmodeYieldSpec {
    pub submode: String,
    #[serde(rename = "yield")]
    pub value: YieldSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum YieldSpec {
    /// Total yield, split by the detection asymmetry.
    Total { value: f64 },
    PerCharge { plus: f64, minus: f64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationSpec {
    /// Draw cell counts from Poisson(yield) instead of rounding.
    #[serde(default)]
    pub poisson_yields: bool,
}

impl AnalysisSpecV0 {
    /// Parse a configuration from JSON text and check the schema tag.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(text)?;
        if spec.schema_version != ANALYSIS_SPEC_V0 {
            return Err(Error::config(
                "schema_version",
                format!("expected '{ANALYSIS_SPEC_V0}', got '{}'", spec.schema_version),
            ));
        }
        Ok(spec)
    }

    /// Read and parse a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

/// A configuration compiled into parameters, PDFs and components.
#[derive(Debug)]
pub struct CompiledAnalysis {
    pub context: BuildContext,
    pub layout: DatasetLayout,
    pub tagging: Arc<TaggingModel>,
    pub processes: Vec<ProcessModel>,
    pub submodes: Vec<String>,
    pub poisson_yields: bool,
}

impl CompiledAnalysis {
    /// Every component, in (process, submode, charge) order.
    pub fn components(&self) -> impl Iterator<Item = &Arc<ComponentPdf>> + '_ {
        self.processes.iter().flat_map(|p| p.components.iter())
    }
}

fn range_of(r: &RangeSpec) -> Result<(f64, f64)> {
    let (lo, hi) = (r.range[0], r.range[1]);
    if !(lo.is_finite() && hi.is_finite() && lo < hi) {
        return Err(Error::config(
            format!("observable '{}'", r.name),
            format!("invalid range [{lo}, {hi}]"),
        ));
    }
    Ok((lo, hi))
}

/// What an auxiliary distribution describes; selects the `mock` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuxKind {
    Mistag,
    TimeError,
}

fn build_aux_pdf(
    component: &str,
    spec: &AuxPdfSpec,
    observable: &str,
    domain: (f64, f64),
    kind: AuxKind,
) -> Result<AuxiliaryPdf> {
    let (lo, hi) = domain;
    let as_config = |e: Error| Error::config(component, e.to_string());
    match spec {
        AuxPdfSpec::Histogram { edges, contents } => {
            let (a, b) = match (edges.first(), edges.last()) {
                (Some(&a), Some(&b)) => (a, b),
                _ => return Err(Error::config(component, "histogram needs bin edges")),
            };
            if a < lo || b > hi {
                return Err(Error::config(
                    component,
                    format!("histogram edges [{a}, {b}] exceed the '{observable}' domain [{lo}, {hi}]"),
                ));
            }
            let pdf = HistogramPdf::from_edges_and_contents(observable, edges.clone(), contents.clone(), 0.0)
                .map_err(as_config)?;
            AuxiliaryPdf::new(Arc::new(pdf), Vec::new(), (a, b)).map_err(as_config)
        }
        AuxPdfSpec::Mock { mean, sigma, exponent, tau } => match kind {
            AuxKind::Mistag => {
                let (m, s) = match (mean, sigma) {
                    (Some(m), Some(s)) => (*m, *s),
                    _ => return Err(Error::config(component, "mock mistag PDF needs 'mean' and 'sigma'")),
                };
                if !(s > 0.0) {
                    return Err(Error::config(component, format!("mock mistag sigma must be > 0, got {s}")));
                }
                let pdf: Arc<dyn UnbinnedPdf> = Arc::new(GaussianPdf::new(observable));
                AuxiliaryPdf::new(pdf, vec![m, s], domain).map_err(as_config)
            }
            AuxKind::TimeError => {
                let t = tau.ok_or_else(|| Error::config(component, "mock time-error PDF needs 'tau'"))?;
                if !(t > 0.0) || lo < 0.0 {
                    return Err(Error::config(
                        component,
                        format!("mock time-error PDF needs tau > 0 and a non-negative range, got tau={t}"),
                    ));
                }
                let pdf = PolyExpPdf::new(observable, exponent.unwrap_or(0.0)).map_err(as_config)?;
                AuxiliaryPdf::new(Arc::new(pdf), vec![t], domain).map_err(as_config)
            }
        },
    }
}

fn time_error_pdf(
    ctx: &mut BuildContext,
    name: &str,
    spec: &ResolutionSpec,
    time_error: Option<&RangeSpec>,
) -> Result<Option<Arc<AuxiliaryPdf>>> {
    let ResolutionSpec::PerEvent { time_error_pdf: Some(pdf), .. } = spec else {
        return Ok(None);
    };
    let obs = time_error.ok_or_else(|| {
        Error::config(name, "a time-error PDF requires observables.time_error")
    })?;
    let domain = range_of(obs)?;
    ctx.get_or_create(&format!("{name}_time_error_pdf"), |_| {
        build_aux_pdf(name, pdf, &obs.name, domain, AuxKind::TimeError)
    })
    .map(Some)
}

/// Compile a configuration.
///
/// Objects are built in dependency order: taggers, the default resolution and acceptance,
/// then per process the decay-time PDF, shapes and the (submode, charge) components.
/// `constant_params` is applied after everything is registered, `floating_params` last.
pub fn compile_model(spec: &AnalysisSpecV0) -> Result<CompiledAnalysis> {
    if spec.processes.is_empty() {
        return Err(Error::config("processes", "at least one process is required"));
    }
    if spec.submodes.is_empty() {
        return Err(Error::config("submodes", "at least one submode is required"));
    }
    let mut seen = HashSet::new();
    for s in &spec.submodes {
        if !seen.insert(s.as_str()) {
            return Err(Error::config("submodes", format!("'{s}' declared twice")));
        }
    }
    let [c_lo, c_hi] = spec.coefficient_interval;
    if !(c_lo < c_hi) {
        return Err(Error::config("coefficient_interval", format!("invalid interval [{c_lo}, {c_hi}]")));
    }

    let obs = &spec.observables;
    let time_range = range_of(&obs.time)?;
    let time_error = obs
        .time_error
        .as_ref()
        .map(|r| range_of(r).map(|b| ObservableSpec::branch(r.name.clone(), b)))
        .transpose()?;
    let extra = obs
        .extra
        .iter()
        .map(|r| range_of(r).map(|b| ObservableSpec::branch(r.name.clone(), b)))
        .collect::<Result<Vec<_>>>()?;
    let n_proc = spec.processes.len();
    let layout = DatasetLayout {
        time: ObservableSpec::branch(obs.time.name.clone(), time_range),
        time_error,
        charge: ObservableSpec::branch(obs.charge.clone(), (-1.0, 1.0)),
        decisions: spec.taggers.iter().map(|t| ObservableSpec::branch(t.decision.clone(), (-1.0, 1.0))).collect(),
        mistags: spec
            .taggers
            .iter()
            .map(|t| match &t.mistag {
                MistagSpec::Average => None,
                MistagSpec::PerEvent { column, .. } => {
                    Some(ObservableSpec::branch(column.clone(), (t.eta_domain[0], t.eta_domain[1])))
                }
            })
            .collect(),
        extra,
        true_id: ObservableSpec::branch(TRUE_ID_COLUMN, (0.0, n_proc.max(1) as f64)),
        submode: ObservableSpec::branch(SUBMODE_COLUMN, (0.0, spec.submodes.len().max(1) as f64)),
    };
    let mut names = HashSet::new();
    for o in layout.observables() {
        if !names.insert(o.name.clone()) {
            return Err(Error::config("observables", format!("column '{}' is used twice", o.name)));
        }
    }

    let mut ctx = BuildContext::new();

    let mut tagger_pdfs = Vec::with_capacity(spec.taggers.len());
    for t in &spec.taggers {
        let pdf = match &t.mistag {
            MistagSpec::PerEvent { column, pdf: Some(pdf) } => {
                let component = format!("tagger '{}'", t.name);
                let domain = (t.eta_domain[0], t.eta_domain[1]);
                Some(ctx.get_or_create(&format!("{}_mistag_pdf", t.name), |_| {
                    build_aux_pdf(&component, pdf, column, domain, AuxKind::Mistag)
                })?)
            }
            _ => None,
        };
        tagger_pdfs.push(pdf);
    }
    let tagging: Arc<TaggingModel> = ctx.get_or_create("tagging", |ctx| {
        TaggingModel::build(ctx, &spec.taggers, &spec.tagging, tagger_pdfs.clone())
    })?;

    let te_spec = obs.time_error.as_ref();
    let te_name = layout.time_error.as_ref().map(|o| o.name.as_str());
    let default_te_pdf = time_error_pdf(&mut ctx, "resolution", &spec.resolution, te_spec)?;
    let resolution: Arc<ResolutionModel> = ctx.get_or_create("resolution", |ctx| {
        ResolutionModel::build(ctx, "resolution", &spec.resolution, te_name, default_te_pdf.clone())
    })?;
    let acceptance: Arc<AcceptanceModel> = ctx.get_or_create("acceptance", |ctx| {
        AcceptanceModel::build(ctx, "acceptance", &spec.acceptance, time_range)
    })?;

    let mut processes = Vec::with_capacity(n_proc);
    let mut process_names = HashSet::new();
    for (index, p) in spec.processes.iter().enumerate() {
        let name = p.name.as_str();
        let component = format!("process '{name}'");
        if !process_names.insert(name) {
            return Err(Error::config(component, "declared twice"));
        }

        let (resolution, te_pdf) = match &p.resolution {
            Some(r) => {
                let prefix = format!("{name}_resolution");
                let te = time_error_pdf(&mut ctx, &prefix, r, te_spec)?;
                let te_for_model = te.clone();
                let model: Arc<ResolutionModel> = ctx.get_or_create(&prefix, |ctx| {
                    ResolutionModel::build(ctx, &prefix, r, te_name, te_for_model)
                })?;
                (model, te.or_else(|| default_te_pdf.clone()))
            }
            None => (resolution.clone(), default_te_pdf.clone()),
        };
        let acceptance = match &p.acceptance {
            Some(a) => {
                let key = format!("{name}_acceptance");
                ctx.get_or_create(&key, |ctx| AcceptanceModel::build(ctx, &key, a, time_range))?
            }
            None => acceptance.clone(),
        };

        let time: Arc<DecayTimePdf> = ctx.get_or_create(&format!("{name}_decay_time"), |ctx| {
            DecayTimePdf::build(ctx, p, obs, (c_lo, c_hi), tagging.clone(), resolution, acceptance)
        })?;
        let shapes = ShapeModel::build(&mut ctx, name, &p.shapes, &layout.extra)?.map(Arc::new);

        for key in p.mistag_pdf.keys() {
            if !spec.taggers.iter().any(|t| &t.name == key) {
                return Err(Error::config(&component, format!("mistag PDF override for unknown tagger '{key}'")));
            }
        }
        let mut mistag_pdfs = Vec::with_capacity(spec.taggers.len());
        for (t, default) in spec.taggers.iter().zip(&tagger_pdfs) {
            let pdf = match (p.mistag_pdf.get(&t.name), &t.mistag) {
                (Some(over), MistagSpec::PerEvent { column, .. }) => {
                    let domain = (t.eta_domain[0], t.eta_domain[1]);
                    Some(ctx.get_or_create(&format!("{name}_{}_mistag_pdf", t.name), |_| {
                        build_aux_pdf(&component, over, column, domain, AuxKind::Mistag)
                    })?)
                }
                (Some(_), MistagSpec::Average) => {
                    return Err(Error::config(
                        &component,
                        format!("mistag PDF override for tagger '{}' which uses the average mistag", t.name),
                    ));
                }
                (None, _) => default.clone(),
            };
            mistag_pdfs.push(pdf);
        }

        let mut components = Vec::with_capacity(2 * p.yields.len());
        let mut submodes_seen = HashSet::new();
        for y in &p.yields {
            let submode_index = spec.submodes.iter().position(|s| s == &y.submode).ok_or_else(|| {
                Error::config(&component, format!("yield for unknown submode '{}'", y.submode))
            })?;
            if !submodes_seen.insert(submode_index) {
                return Err(Error::config(&component, format!("submode '{}' has two yields", y.submode)));
            }
            let source = CellSource {
                process: name.to_string(),
                process_index: index,
                submode: y.submode.clone(),
                submode_index,
                time: time.clone(),
                shapes: shapes.clone(),
                mistag_pdfs: mistag_pdfs.clone(),
                time_error_pdf: te_pdf.clone(),
            };
            components.extend(ComponentPdf::build_pair(&mut ctx, &source, &y.value, p.detection_asymmetry)?);
        }
        if components.is_empty() {
            log::warn!("{component}: no yields, the process contributes no events");
        }
        processes.push(ProcessModel { name: name.to_string(), index, time, shapes, components });
    }

    for pattern in &spec.constant_params {
        let n = ctx.set_constant(pattern)?;
        log::debug!("constant_params: '{pattern}' fixed {n} parameter(s)");
    }
    for name in &spec.floating_params {
        ctx.set_floating(name)?;
    }

    let n_free = ctx.parameters().iter().filter(|p| !p.constant).count();
    log::info!(
        "compiled analysis: {} process(es), {} component(s), {} parameter(s) ({} floating)",
        processes.len(),
        processes.iter().map(|p| p.components.len()).sum::<usize>(),
        ctx.parameters().len(),
        n_free
    );

    Ok(CompiledAnalysis {
        context: ctx,
        layout,
        tagging,
        processes,
        submodes: spec.submodes.clone(),
        poisson_yields: spec.generation.poisson_yields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Charge;

    const BASE: &str = r#"{
        "schema_version": "tdcpv_analysis_spec_v0",
        "observables": {
            "time": { "name": "t", "range": [0.4, 15.0] },
            "time_error": { "name": "sigma_t", "range": [0.01, 0.1] },
            "charge": "qf",
            "extra": [{ "name": "mass", "range": [5300.0, 5800.0] }]
        },
        "submodes": ["kkpi", "pipipi"],
        "taggers": [
            {
                "name": "os", "decision": "q_os",
                "calibration": { "p0": 0.37, "p1": 1.0, "avg_eta": 0.37 },
                "mistag": { "type": "per_event", "column": "eta_os",
                            "pdf": { "type": "mock", "mean": 0.37, "sigma": 0.08 } },
                "eta_domain": [0.0, 0.5],
                "efficiency": 0.4
            },
            {
                "name": "ss", "decision": "q_ss",
                "calibration": { "p0": 0.44, "p1": 1.0, "avg_eta": 0.44 },
                "eta_domain": [0.3, 0.5],
                "efficiency": 0.6
            }
        ],
        "resolution": {
            "type": "per_event", "scale": 1.2,
            "time_error_pdf": { "type": "mock", "exponent": 3.0, "tau": 0.01 }
        },
        "processes": [
            {
                "name": "signal", "meson": "bs",
                "decay": { "gamma": 0.661, "delta_gamma": -0.105, "delta_m": 17.69 },
                "cp": { "type": "phases", "strong_phase": 0.6, "weak_phase": 1.2, "modulus": 0.37 },
                "detection_asymmetry": 0.01,
                "shapes": [{ "observable": "mass", "pdf": { "type": "gaussian", "mu": 5367.0, "sigma": 18.0 } }],
                "yields": [
                    { "submode": "kkpi", "yield": { "type": "total", "value": 1000.0 } },
                    { "submode": "pipipi", "yield": { "type": "per_charge", "plus": 200.0, "minus": 210.0 } }
                ]
            },
            {
                "name": "ds_pi", "meson": "bs",
                "decay": { "gamma": 0.661, "delta_gamma": -0.105, "delta_m": 17.69 },
                "cp": { "type": "flavour_specific" },
                "shapes": [{ "observable": "mass", "pdf": { "type": "exponential", "lambda": -0.002 } }],
                "yields": [{ "submode": "kkpi", "yield": { "type": "total", "value": 300.0 } }]
            }
        ],
        "constant_params": ["bs_*", "os_p1"],
        "floating_params": ["bs_gamma"]
    }"#;

    fn parse(text: &str) -> AnalysisSpecV0 {
        AnalysisSpecV0::from_json_str(text).unwrap()
    }

    fn with(f: impl FnOnce(&mut serde_json::Value)) -> AnalysisSpecV0 {
        let mut v: serde_json::Value = serde_json::from_str(BASE).unwrap();
        f(&mut v);
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_compile_builds_cells_and_layout() {
        let compiled = compile_model(&parse(BASE)).unwrap();
        assert_eq!(compiled.processes.len(), 2);
        assert_eq!(compiled.components().count(), 6);

        let names: Vec<String> =
            compiled.layout.observables().into_iter().map(|o| o.name).collect();
        assert_eq!(
            names,
            ["t", "sigma_t", "q_os", "q_ss", "eta_os", "qf", "mass", "true_id", "submode"]
        );

        let signal = &compiled.processes[0];
        assert_eq!(signal.components[2].submode(), "pipipi");
        assert_eq!(signal.components[3].charge(), Charge::Minus);
        assert!(Arc::ptr_eq(signal.components[0].time_pdf(), &signal.time));
        for c in compiled.components() {
            c.check_generation(&compiled.layout).unwrap();
        }
    }

    #[test]
    fn test_shared_meson_parameters_and_constant_patterns() {
        let compiled = compile_model(&parse(BASE)).unwrap();
        let ctx = &compiled.context;
        let gamma = ctx.require_param("bs_gamma").unwrap();
        let dm = ctx.require_param("bs_delta_m").unwrap();
        assert!(!ctx.param(gamma).constant);
        assert!(ctx.param(dm).constant);
        assert!(ctx.param(ctx.require_param("os_p1").unwrap()).constant);
        assert!(!ctx.param(ctx.require_param("signal_S").unwrap()).constant);
        assert!(ctx.param(ctx.require_param("ds_pi_C").unwrap()).constant);
        assert!(ctx.param_id("ds_pi_gamma").is_none());
    }

    #[test]
    fn test_acceptance_coefficients_follow_constant_and_floating_lists() {
        let spline = serde_json::json!({
            "type": "spline", "knots": [0.5, 1.0, 2.0, 5.0], "coefficients": [0.4, 0.7, 0.95, 1.0]
        });
        let floating = compile_model(&with(|v| v["acceptance"] = spline.clone())).unwrap();
        let ctx = &floating.context;
        let is_constant = |ctx: &BuildContext, name: &str| ctx.param(ctx.require_param(name).unwrap()).constant;
        assert!(!is_constant(ctx, "acceptance_c0"));
        assert!(!is_constant(ctx, "acceptance_c2"));
        assert!(is_constant(ctx, "acceptance_c3"));

        let pinned = compile_model(&with(|v| {
            v["acceptance"] = spline.clone();
            v["constant_params"] = serde_json::json!(["bs_*", "acceptance_c*"]);
            v["floating_params"] = serde_json::json!(["acceptance_c1"]);
        }))
        .unwrap();
        let ctx = &pinned.context;
        assert!(is_constant(ctx, "acceptance_c0"));
        assert!(!is_constant(ctx, "acceptance_c1"));
        assert!(is_constant(ctx, "acceptance_c2"));

        // A per-process acceptance registers its own coefficients.
        let own = compile_model(&with(|v| v["processes"][1]["acceptance"] = spline.clone())).unwrap();
        assert!(own.context.param_id("ds_pi_acceptance_c0").is_some());
        assert!(own.context.param_id("acceptance_c0").is_none());
    }

    #[test]
    fn test_unknown_submode_in_yields_is_config_error() {
        let spec = with(|v| v["processes"][1]["yields"][0]["submode"] = "kpipi".into());
        let err = compile_model(&spec).unwrap_err();
        assert!(matches!(&err, Error::Config { component, .. } if component.contains("ds_pi")));
    }

    #[test]
    fn test_mistag_override_for_unknown_tagger_is_config_error() {
        let spec = with(|v| {
            v["processes"][0]["mistag_pdf"] =
                serde_json::json!({ "vtx": { "type": "mock", "mean": 0.3, "sigma": 0.1 } })
        });
        assert!(matches!(compile_model(&spec), Err(Error::Config { .. })));
    }

    #[test]
    fn test_per_event_mistag_without_pdf_fails_generation_check() {
        let spec = with(|v| {
            v["taggers"][0]["mistag"] = serde_json::json!({ "type": "per_event", "column": "eta_os" })
        });
        let compiled = compile_model(&spec).unwrap();
        let first = compiled.components().next().unwrap();
        assert!(matches!(first.check_generation(&compiled.layout), Err(Error::Config { .. })));
    }

    #[test]
    fn test_perfect_tagging_with_two_taggers_is_rejected() {
        let spec = with(|v| v["tagging"] = serde_json::json!({ "perfect": true }));
        assert!(matches!(compile_model(&spec), Err(Error::Config { .. })));
    }

    #[test]
    fn test_missing_shape_for_extra_observable_is_rejected() {
        let spec = with(|v| v["processes"][1]["shapes"] = serde_json::json!([]));
        assert!(matches!(compile_model(&spec), Err(Error::Config { .. })));
    }

    #[test]
    fn test_wrong_schema_version_is_rejected() {
        let text = BASE.replace("tdcpv_analysis_spec_v0", "tdcpv_analysis_spec_v9");
        assert!(AnalysisSpecV0::from_json_str(&text).is_err());
    }
}
