//! Decay-time PDF of one physics process.
//!
//! For final-state charge `qf` and tag-decision vector `q`:
//!
//! ```text
//! P(t, q | η, σ_t, qf) = acc(t) Σ_k c_k(q) B_k(t) / Σ_q' Σ_k c_k(q') ∫ acc B_k
//!
//! Cosh = W (E - A_P O)            Cos = qf Odd C
//! Sinh = Cosh D_eff(qf)           Sin = -qf Odd S_eff(qf)
//! Odd  = W (O - A_P E [tagged])
//! ```
//!
//! with `(E, O, W)` from [`PreparedTagging::terms`]. The normalisation is conditional on the
//! event's mistags and time error; it is cached when neither varies per event.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::RngCore;
use tdcpv_core::{Error, Result};

use crate::acceptance::{AcceptanceModel, TimeAcceptance};
use crate::coefficients::{build_cp_coefficients, CpCoefficients, CpParams};
use crate::context::{BuildContext, ParamId};
use crate::event_store::EventStore;
use crate::kernel::{basis_at, BasisValues, DecayConstants, Envelope};
use crate::math::u01;
use crate::normalize::CompositeRule;
use crate::resolution::{GaussKernel, PreparedResolution, ResolutionModel};
use crate::spec::{ObservablesSpec, ProcessSpec};
use crate::tagging::{PreparedTagging, TagEfficiency, TaggingModel};

/// Consecutive rejections after which sampling gives up.
pub const MAX_REJECTIONS: usize = 1_000_000;

/// Decay-time PDF with tagging, resolution and acceptance of one process.
#[derive(Debug)]
pub struct DecayTimePdf {
    process: String,
    gamma: ParamId,
    delta_gamma: ParamId,
    delta_m: ParamId,
    cp: CpParams,
    production_asymmetry: ParamId,
    tagging: Arc<TaggingModel>,
    efficiencies: Vec<TagEfficiency>,
    resolution: Arc<ResolutionModel>,
    acceptance: Arc<AcceptanceModel>,
    time: String,
    time_range: (f64, f64),
    charge: String,
    rule: CompositeRule,
    envelope_warned: AtomicBool,
    integral_evaluations: AtomicUsize,
}

fn widen((lo, hi): (f64, f64), v: f64) -> (f64, f64) {
    (lo.min(v), hi.max(v))
}

impl DecayTimePdf {
    /// Register the process parameters and assemble the PDF.
    ///
    /// Decay constants are named after `meson` (or the process) so that processes of the same
    /// meson share them; CP coefficients, production asymmetry and efficiency overrides are
    /// per process.
    pub fn build(
        ctx: &mut BuildContext,
        process: &ProcessSpec,
        observables: &ObservablesSpec,
        coefficient_interval: (f64, f64),
        tagging: Arc<TaggingModel>,
        resolution: Arc<ResolutionModel>,
        acceptance: Arc<AcceptanceModel>,
    ) -> Result<Self> {
        let name = process.name.as_str();
        let component = format!("process '{name}'");
        let prefix = process.meson.as_deref().unwrap_or(name);
        let d = process.decay;
        let gamma = ctx.get_or_create_param(&format!("{prefix}_gamma"), d.gamma, widen((0.0, 10.0), d.gamma))?;
        let delta_gamma = ctx.get_or_create_param(
            &format!("{prefix}_delta_gamma"),
            d.delta_gamma,
            widen((-1.0, 1.0), d.delta_gamma),
        )?;
        let delta_m = ctx.get_or_create_param(&format!("{prefix}_delta_m"), d.delta_m, widen((0.0, 30.0), d.delta_m))?;
        let constants = DecayConstants {
            gamma: ctx.param(gamma).value,
            delta_gamma: ctx.param(delta_gamma).value,
            delta_m: ctx.param(delta_m).value,
        };
        constants.validate(name).map_err(|e| Error::config(&component, e.to_string()))?;

        let cp = build_cp_coefficients(ctx, name, &process.cp, coefficient_interval)?;
        let production_asymmetry =
            ctx.get_or_create_param(&format!("{name}_aprod"), process.production_asymmetry, (-1.0, 1.0))?;

        for key in process.tag_efficiency.keys().chain(process.tag_efficiency_asymmetry.keys()) {
            if !tagging.taggers().iter().any(|t| &t.name == key) {
                return Err(Error::config(&component, format!("tag efficiency override for unknown tagger '{key}'")));
            }
        }
        let mut efficiencies = Vec::with_capacity(tagging.taggers().len());
        for t in tagging.taggers() {
            let eff = match process.tag_efficiency.get(&t.name) {
                Some(&v) => ctx.get_or_create_param(&format!("{name}_{}_eff", t.name), v, (0.0, 1.0))?,
                None => t.efficiency.eff,
            };
            let asym = match process.tag_efficiency_asymmetry.get(&t.name) {
                Some(&v) => ctx.get_or_create_param(&format!("{name}_{}_aeff", t.name), v, (-1.0, 1.0))?,
                None => t.efficiency.asym,
            };
            efficiencies.push(TagEfficiency { eff, asym });
        }

        let time_range = (observables.time.range[0], observables.time.range[1]);
        if acceptance.range() != time_range {
            return Err(Error::config(&component, "acceptance range differs from the time observable range"));
        }

        log::debug!("{component}: decay-time PDF with {} tagger(s), constants {constants:?}", efficiencies.len());
        Ok(Self {
            process: name.to_string(),
            gamma,
            delta_gamma,
            delta_m,
            cp,
            production_asymmetry,
            tagging,
            efficiencies,
            resolution,
            acceptance,
            time: observables.time.name.clone(),
            time_range,
            charge: observables.charge.clone(),
            rule: CompositeRule::default(),
            envelope_warned: AtomicBool::new(false),
            integral_evaluations: AtomicUsize::new(0),
        })
    }

    pub fn process(&self) -> &str {
        &self.process
    }

    pub fn tagging(&self) -> &Arc<TaggingModel> {
        &self.tagging
    }

    pub fn resolution(&self) -> &Arc<ResolutionModel> {
        &self.resolution
    }

    pub fn acceptance(&self) -> &Arc<AcceptanceModel> {
        &self.acceptance
    }

    /// Number of acceptance-weighted normalisation integrals computed so far.
    pub fn integral_evaluations(&self) -> usize {
        self.integral_evaluations.load(Ordering::Relaxed)
    }

    pub fn time_observable(&self) -> &str {
        &self.time
    }

    pub fn time_range(&self) -> (f64, f64) {
        self.time_range
    }

    pub fn charge_column(&self) -> &str {
        &self.charge
    }

    /// Tag efficiency handles used by this process, one per tagger.
    pub fn efficiencies(&self) -> &[TagEfficiency] {
        &self.efficiencies
    }

    /// Event columns read by [`PreparedDecayTime::log_prob_batch`].
    pub fn required_columns(&self) -> Vec<String> {
        let mut cols = vec![self.time.clone(), self.charge.clone()];
        for t in self.tagging.taggers() {
            cols.push(t.decision_column.clone());
            if let Some(c) = t.mistag_column() {
                cols.push(c.to_string());
            }
        }
        if let Some(c) = self.resolution.time_error_column() {
            cols.push(c.to_string());
        }
        cols
    }

    /// Resolve every parameter-dependent piece at one parameter point.
    pub fn prepare(&self, params: &[f64]) -> Result<PreparedDecayTime<'_>> {
        let dc = DecayConstants {
            gamma: params[self.gamma.0],
            delta_gamma: params[self.delta_gamma.0],
            delta_m: params[self.delta_m.0],
        };
        dc.validate(&self.process)?;
        let aprod = params[self.production_asymmetry.0];
        if !(aprod.is_finite() && aprod.abs() <= 1.0) {
            return Err(Error::Validation(format!(
                "process '{}': production asymmetry {aprod} outside [-1, 1]",
                self.process
            )));
        }
        let tagging = self.tagging.prepare(params, &self.efficiencies)?;
        let resolution = self.resolution.prepare(params)?;
        let acceptance = self.acceptance.prepare(params)?;
        let mut prepared = PreparedDecayTime {
            pdf: self,
            dc,
            cp: self.cp.values(params),
            aprod,
            tagging,
            resolution,
            acceptance,
            fixed: None,
        };
        if !prepared.resolution.is_per_event() {
            let kernels = prepared.kernel_cache(None)?;
            let integrals = prepared.integrals(&kernels);
            prepared.fixed = Some(FixedCache { kernels, integrals });
        }
        Ok(prepared)
    }
}

/// Resolution kernels and the sampling envelope for one time error.
#[derive(Debug, Clone)]
struct KernelCache {
    kernels: Vec<GaussKernel>,
    envelope: Envelope,
}

/// Kernels plus normalisation integrals, when the resolution does not vary per event.
#[derive(Debug, Clone)]
struct FixedCache {
    kernels: KernelCache,
    integrals: BasisValues,
}

/// A [`DecayTimePdf`] at one parameter point.
#[derive(Debug)]
pub struct PreparedDecayTime<'a> {
    pdf: &'a DecayTimePdf,
    dc: DecayConstants,
    cp: CpCoefficients,
    aprod: f64,
    tagging: PreparedTagging,
    resolution: PreparedResolution,
    acceptance: Arc<TimeAcceptance>,
    fixed: Option<FixedCache>,
}

impl<'a> PreparedDecayTime<'a> {
    pub fn constants(&self) -> DecayConstants {
        self.dc
    }

    pub fn cp(&self) -> CpCoefficients {
        self.cp
    }

    /// Mistag used for every tagger when no per-event value is available: `⟨η⟩`.
    pub fn average_eta(&self) -> Vec<f64> {
        (0..self.pdf.tagging.taggers().len()).map(|i| self.tagging.calibration(i).avg_eta).collect()
    }

    /// `[Cosh, Sinh, Cos, Sin]` for decision vector `q`.
    pub fn coefficients(&self, q: &[i8], eta: &[f64], qf: f64) -> [f64; 4] {
        let terms = self.tagging.terms(q, eta);
        let cosh = terms.weight * (terms.even - self.aprod * terms.odd);
        let tagged = if terms.tagged { 1.0 } else { 0.0 };
        let odd = terms.weight * (terms.odd - self.aprod * terms.even * tagged);
        [
            cosh,
            cosh * self.cp.d_eff(qf),
            qf * odd * self.cp.c,
            -qf * odd * self.cp.s_eff(qf),
        ]
    }

    /// Normalised acceptance at this parameter point.
    pub fn acceptance(&self) -> &TimeAcceptance {
        &self.acceptance
    }

    fn kernel_cache(&self, sigma_t: Option<f64>) -> Result<KernelCache> {
        let kernels = self.resolution.kernels(sigma_t)?;
        let envelope = Envelope::new(&self.dc, &kernels);
        Ok(KernelCache { kernels, envelope })
    }

    fn integrals(&self, kernels: &KernelCache) -> BasisValues {
        self.pdf.integral_evaluations.fetch_add(1, Ordering::Relaxed);
        self.acceptance.basis_integral(&self.dc, &kernels.kernels, &self.pdf.rule)
    }

    /// Kernels and envelope only; enough for sampling.
    fn kernels(&self, sigma_t: Option<f64>) -> Result<Cow<'_, KernelCache>> {
        match &self.fixed {
            Some(c) => Ok(Cow::Borrowed(&c.kernels)),
            None => Ok(Cow::Owned(self.kernel_cache(sigma_t)?)),
        }
    }

    /// Kernels with their normalisation integrals.
    fn cache(&self, sigma_t: Option<f64>) -> Result<Cow<'_, FixedCache>> {
        match &self.fixed {
            Some(c) => Ok(Cow::Borrowed(c)),
            None => {
                let kernels = self.kernel_cache(sigma_t)?;
                let integrals = self.integrals(&kernels);
                Ok(Cow::Owned(FixedCache { kernels, integrals }))
            }
        }
    }

    fn norm_with(&self, integrals: &BasisValues, eta: &[f64], qf: f64) -> Result<f64> {
        let mut total = 0.0;
        for q in self.pdf.tagging.decision_vectors() {
            total += integrals.dot(&self.coefficients(q, eta, qf));
        }
        if !(total.is_finite() && total > 0.0) {
            return Err(Error::Computation(format!(
                "process '{}': decay-time normalisation is {total} (eta={eta:?}, qf={qf})",
                self.pdf.process
            )));
        }
        Ok(total)
    }

    /// `Σ_q Σ_k c_k(q) ∫ acc B_k` for one event's conditional inputs.
    pub fn normalisation(&self, eta: &[f64], sigma_t: Option<f64>, qf: f64) -> Result<f64> {
        let cache = self.cache(sigma_t)?;
        self.norm_with(&cache.integrals, eta, qf)
    }

    /// Normalised density at `(t, q)`.
    pub fn density(&self, t: f64, q: &[i8], eta: &[f64], sigma_t: Option<f64>, qf: f64) -> Result<f64> {
        let cache = self.cache(sigma_t)?;
        let norm = self.norm_with(&cache.integrals, eta, qf)?;
        let value =
            self.acceptance.eval(t) * basis_at(&self.dc, t, &cache.kernels.kernels).dot(&self.coefficients(q, eta, qf));
        Ok(value / norm)
    }

    /// `log P` for every event; `out.len()` must equal `events.n_events()`.
    pub fn log_prob_batch(&self, events: &EventStore, out: &mut [f64]) -> Result<()> {
        let n = events.n_events();
        if out.len() != n {
            return Err(Error::Validation(format!("out length mismatch: expected {n}, got {}", out.len())));
        }
        let pdf = self.pdf;
        let times = events.require_column(&pdf.time)?;
        let charges = events.require_column(&pdf.charge)?;
        let taggers = pdf.tagging.taggers();
        let decisions =
            taggers.iter().map(|t| events.require_column(&t.decision_column)).collect::<Result<Vec<_>>>()?;
        let mistags = taggers
            .iter()
            .map(|t| t.mistag_column().map(|c| events.require_column(c)).transpose())
            .collect::<Result<Vec<_>>>()?;
        let sigma_col = pdf.resolution.time_error_column().map(|c| events.require_column(c)).transpose()?;

        let per_event_eta = mistags.iter().any(Option::is_some);
        let mut eta = self.average_eta();
        let mut q = vec![0i8; taggers.len()];
        // Cached normalisations for qf = +1 / -1 when nothing varies per event.
        let mut norms: [Option<f64>; 2] = [None, None];

        for i in 0..n {
            let qf = if charges[i] >= 0.0 { 1.0 } else { -1.0 };
            for (j, col) in decisions.iter().enumerate() {
                q[j] = col[i].round() as i8;
            }
            for (j, col) in mistags.iter().enumerate() {
                if let Some(col) = col {
                    eta[j] = col[i];
                }
            }
            let sigma_t = sigma_col.map(|c| c[i]);
            let cache = self.cache(sigma_t)?;
            let norm = if per_event_eta || sigma_t.is_some() {
                self.norm_with(&cache.integrals, &eta, qf)?
            } else {
                let slot = usize::from(qf < 0.0);
                match norms[slot] {
                    Some(v) => v,
                    None => {
                        let v = self.norm_with(&cache.integrals, &eta, qf)?;
                        norms[slot] = Some(v);
                        v
                    }
                }
            };
            let value = self.acceptance.eval(times[i])
                * basis_at(&self.dc, times[i], &cache.kernels.kernels).dot(&self.coefficients(&q, &eta, qf));
            out[i] = if value > 0.0 { (value / norm).ln() } else { f64::NEG_INFINITY };
        }
        Ok(())
    }

    /// Mean decay time of events with decision vector `q`.
    pub fn mean_time(&self, q: &[i8], eta: &[f64], sigma_t: Option<f64>, qf: f64) -> Result<f64> {
        let cache = self.cache(sigma_t)?;
        let c = self.coefficients(q, eta, qf);
        let moment = self.acceptance.basis_moment(&self.dc, &cache.kernels.kernels, &self.pdf.rule);
        let mass = cache.integrals.dot(&c);
        if !(mass.is_finite() && mass > 0.0) {
            return Err(Error::Computation(format!(
                "process '{}': decision {q:?} has probability {mass}",
                self.pdf.process
            )));
        }
        Ok(moment.dot(&c) / mass)
    }

    /// Draw `(t, q)` for one event by accept-reject under the envelope
    /// `acc_max · Σ_k |c_k(q)| · exp(-Γ_L max(0, t - s0))`.
    pub fn sample_event(
        &self,
        rng: &mut dyn RngCore,
        eta: &[f64],
        sigma_t: Option<f64>,
        qf: f64,
    ) -> Result<(f64, Vec<i8>)> {
        let pdf = self.pdf;
        let cache = self.kernels(sigma_t)?;
        let decisions = pdf.tagging.decision_vectors();
        let coeffs: Vec<[f64; 4]> = decisions.iter().map(|q| self.coefficients(q, eta, qf)).collect();
        let bounds: Vec<f64> = coeffs.iter().map(|c| c.iter().map(|x| x.abs()).sum()).collect();
        let total: f64 = bounds.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(Error::Computation(format!(
                "process '{}': no decision has positive weight (eta={eta:?}, qf={qf})",
                pdf.process
            )));
        }
        let acc_max = self.acceptance.max();
        let (lo, hi) = pdf.time_range;

        for _ in 0..MAX_REJECTIONS {
            let mut u = u01(rng) * total;
            let mut j = 0;
            while j + 1 < bounds.len() && u >= bounds[j] {
                u -= bounds[j];
                j += 1;
            }
            let t = cache.envelope.sample(lo, hi, rng);
            let f = self.acceptance.eval(t) * basis_at(&self.dc, t, &cache.kernels).dot(&coeffs[j]);
            let ratio = f / (acc_max * bounds[j] * cache.envelope.value(t));
            if ratio > 1.0 + 1e-9 && !pdf.envelope_warned.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "process '{}': sampling envelope exceeded (ratio {ratio:.6} at t={t:.4}); \
                     generated times may be biased",
                    pdf.process
                );
            }
            if u01(rng) < ratio {
                return Ok((t, decisions[j].clone()));
            }
        }
        Err(Error::Computation(format!(
            "process '{}': accept-reject gave up after {MAX_REJECTIONS} consecutive rejections",
            pdf.process
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::ObservableSpec;
    use crate::kernel::basis_integral;
    use crate::spec::{
        AcceptanceSpec, CalibrationSpec, CpSpec, DecaySpec, GaussComponentSpec, MistagSpec,
        RangeSpec, ResolutionSpec, TaggerSpec, TaggingSpec,
    };
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn observables() -> ObservablesSpec {
        ObservablesSpec {
            time: RangeSpec { name: "t".into(), range: [0.2, 15.0] },
            time_error: None,
            charge: "qf".into(),
            extra: Vec::new(),
        }
    }

    fn process(cp: CpSpec, decay: DecaySpec, aprod: f64) -> ProcessSpec {
        ProcessSpec {
            name: "sig".into(),
            meson: None,
            decay,
            cp,
            production_asymmetry: aprod,
            detection_asymmetry: None,
            tag_efficiency: BTreeMap::new(),
            tag_efficiency_asymmetry: BTreeMap::new(),
            mistag_pdf: BTreeMap::new(),
            resolution: None,
            acceptance: None,
            shapes: Vec::new(),
            yields: Vec::new(),
        }
    }

    fn os_tagger() -> TaggerSpec {
        TaggerSpec {
            name: "os".into(),
            decision: "tag_os".into(),
            calibration: CalibrationSpec { p0: 0.39, p1: 1.0, dp0: 0.0, dp1: 0.0, avg_eta: 0.39 },
            mistag: MistagSpec::Average,
            eta_domain: [0.0, 0.5],
            efficiency: 0.4,
            efficiency_asymmetry: 0.0,
        }
    }

    fn build(
        ctx: &mut BuildContext,
        proc_spec: &ProcessSpec,
        resolution: &ResolutionSpec,
        acceptance: &AcceptanceSpec,
    ) -> DecayTimePdf {
        let tagging = Arc::new(
            TaggingModel::build(ctx, &[os_tagger()], &TaggingSpec::default(), Vec::new()).unwrap(),
        );
        let resolution = Arc::new(ResolutionModel::build(ctx, "resolution", resolution, None, None).unwrap());
        let acceptance = Arc::new(AcceptanceModel::build(ctx, "acceptance", acceptance, (0.2, 15.0)).unwrap());
        DecayTimePdf::build(ctx, proc_spec, &observables(), (-4.0, 4.0), tagging, resolution, acceptance)
            .unwrap()
    }

    fn mean_resolution() -> ResolutionSpec {
        ResolutionSpec::Mean {
            components: vec![GaussComponentSpec { sigma: 0.04, fraction: None }],
            scale: 1.15,
            bias: 0.0,
        }
    }

    #[test]
    fn test_density_integrates_to_one_over_time_and_decisions() {
        let mut ctx = BuildContext::new();
        let cp = CpSpec::Direct { c: Some(0.93), s: Some(-0.08), d: Some(-0.35), sbar: Some(0.3), dbar: Some(-0.2) };
        let spec = process(cp, DecaySpec { gamma: 0.661, delta_gamma: -0.105, delta_m: 17.69 }, 0.01);
        let pdf = build(&mut ctx, &spec, &mean_resolution(), &AcceptanceSpec::None);
        let params = ctx.values();
        let prepared = pdf.prepare(&params).unwrap();
        let eta = prepared.average_eta();
        let rule = CompositeRule::new(crate::normalize::QuadratureOrder::N32);
        for qf in [1.0, -1.0] {
            let mut total = 0.0;
            for q in [[1i8], [-1], [0]] {
                total += rule.integrate(0.2, 15.0, 0.02, |t| prepared.density(t, &q, &eta, None, qf).unwrap());
            }
            assert_relative_eq!(total, 1.0, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_non_mixing_without_width_difference_is_exponential() {
        let mut ctx = BuildContext::new();
        let spec = process(CpSpec::NonMixing, DecaySpec { gamma: 0.66, delta_gamma: 0.0, delta_m: 0.51 }, 0.0);
        let pdf = build(&mut ctx, &spec, &ResolutionSpec::Perfect, &AcceptanceSpec::None);
        let prepared = pdf.prepare(&ctx.values()).unwrap();
        let eta = prepared.average_eta();
        let norm = (-0.66f64 * 0.2).exp() - (-0.66f64 * 15.0).exp();
        for &t in &[0.3, 1.0, 4.0, 11.0] {
            // Summed over decisions the density is the truncated exponential.
            let p: f64 = [[1i8], [-1], [0]]
                .iter()
                .map(|q| prepared.density(t, q, &eta, None, 1.0).unwrap())
                .sum();
            assert_relative_eq!(p, 0.66 * (-0.66 * t).exp() / norm, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_untagged_events_have_no_oscillation() {
        let mut ctx = BuildContext::new();
        let cp = CpSpec::Phases { strong_phase: Some(0.3), weak_phase: Some(1.1), modulus: Some(0.4) };
        let spec = process(cp, DecaySpec { gamma: 0.661, delta_gamma: -0.105, delta_m: 17.69 }, 0.05);
        let pdf = build(&mut ctx, &spec, &mean_resolution(), &AcceptanceSpec::None);
        let prepared = pdf.prepare(&ctx.values()).unwrap();
        for qf in [1.0, -1.0] {
            let c = prepared.coefficients(&[0], &prepared.average_eta(), qf);
            assert_eq!(c[2], 0.0);
            assert_eq!(c[3], 0.0);
            assert!(c[0] > 0.0);
        }
    }

    #[test]
    fn test_log_prob_batch_matches_density() {
        let mut ctx = BuildContext::new();
        let cp = CpSpec::Direct { c: Some(0.5), s: Some(0.4), d: Some(-0.3), sbar: Some(-0.2), dbar: Some(0.1) };
        let spec = process(cp, DecaySpec { gamma: 0.66, delta_gamma: 0.08, delta_m: 17.7 }, 0.0);
        let pdf = build(&mut ctx, &spec, &mean_resolution(), &AcceptanceSpec::None);
        let prepared = pdf.prepare(&ctx.values()).unwrap();
        let events = EventStore::from_columns(
            vec![
                ObservableSpec::branch("t", (0.2, 15.0)),
                ObservableSpec::branch("qf", (-1.0, 1.0)),
                ObservableSpec::branch("tag_os", (-1.0, 1.0)),
            ],
            vec![
                ("t".to_string(), vec![0.5, 1.7, 3.2]),
                ("qf".to_string(), vec![1.0, -1.0, 1.0]),
                ("tag_os".to_string(), vec![1.0, -1.0, 0.0]),
            ],
        )
        .unwrap();
        let mut out = vec![0.0; 3];
        prepared.log_prob_batch(&events, &mut out).unwrap();
        let eta = prepared.average_eta();
        let expected = prepared.density(1.7, &[-1], &eta, None, -1.0).unwrap().ln();
        assert_relative_eq!(out[1], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_mean_time_of_pure_exponential() {
        let mut ctx = BuildContext::new();
        let spec = process(CpSpec::NonMixing, DecaySpec { gamma: 0.5, delta_gamma: 0.0, delta_m: 0.0 }, 0.0);
        let pdf = build(&mut ctx, &spec, &ResolutionSpec::Perfect, &AcceptanceSpec::None);
        let prepared = pdf.prepare(&ctx.values()).unwrap();
        let eta = prepared.average_eta();
        let (a, b, g) = (0.2f64, 15.0f64, 0.5f64);
        let num = (a + 1.0 / g) * (-g * a).exp() - (b + 1.0 / g) * (-g * b).exp();
        let den = (-g * a).exp() - (-g * b).exp();
        assert_relative_eq!(prepared.mean_time(&[1], &eta, None, 1.0).unwrap(), num / den, epsilon = 1e-10);
        let k = [GaussKernel { mu: 0.0, sigma: 0.0, weight: 1.0 }];
        let i = basis_integral(&prepared.constants(), a, b, &k);
        assert_relative_eq!(i.cosh, den / g, epsilon = 1e-12);
    }

    #[test]
    fn test_sampled_times_stay_in_range_and_follow_tag_rates() {
        let mut ctx = BuildContext::new();
        let cp = CpSpec::Direct { c: Some(0.93), s: Some(-0.08), d: Some(-0.35), sbar: Some(0.3), dbar: Some(-0.2) };
        let spec = process(cp, DecaySpec { gamma: 0.661, delta_gamma: -0.105, delta_m: 17.69 }, 0.0);
        let pdf = build(&mut ctx, &spec, &mean_resolution(), &AcceptanceSpec::None);
        let prepared = pdf.prepare(&ctx.values()).unwrap();
        let eta = prepared.average_eta();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let n = 5000;
        let mut untagged = 0;
        for _ in 0..n {
            let (t, q) = prepared.sample_event(&mut rng, &eta, None, 1.0).unwrap();
            assert!((0.2..=15.0).contains(&t));
            if q[0] == 0 {
                untagged += 1;
            }
        }
        // P(untagged) = 2(1 - ε) / 2 = 0.6
        let frac = untagged as f64 / n as f64;
        assert!((frac - 0.6).abs() < 5.0 * (0.24f64 / n as f64).sqrt(), "untagged fraction {frac}");
    }

    #[test]
    fn test_non_positive_light_width_is_config_error() {
        let mut ctx = BuildContext::new();
        let spec = process(CpSpec::NonMixing, DecaySpec { gamma: 0.1, delta_gamma: 0.5, delta_m: 0.0 }, 0.0);
        let tagging = Arc::new(
            TaggingModel::build(&mut ctx, &[os_tagger()], &TaggingSpec::default(), Vec::new()).unwrap(),
        );
        let resolution = Arc::new(ResolutionModel::Perfect);
        let acceptance =
            Arc::new(AcceptanceModel::build(&mut ctx, "acceptance", &AcceptanceSpec::None, (0.2, 15.0)).unwrap());
        let err = DecayTimePdf::build(&mut ctx, &spec, &observables(), (-4.0, 4.0), tagging, resolution, acceptance)
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }), "{err}");
    }

    #[test]
    fn test_per_event_sampling_skips_normalisation_integrals() {
        let mut ctx = BuildContext::new();
        let cp = CpSpec::Direct { c: Some(0.93), s: Some(-0.08), d: Some(-0.35), sbar: Some(0.3), dbar: Some(-0.2) };
        let spec = process(cp, DecaySpec { gamma: 0.661, delta_gamma: -0.105, delta_m: 17.69 }, 0.0);
        let resolution = ResolutionSpec::PerEvent { scale: 1.1, offset: 0.005, bias: 0.0, time_error_pdf: None };
        let acceptance = AcceptanceSpec::Spline {
            knots: vec![0.5, 1.0, 2.0, 5.0, 10.0],
            coefficients: vec![0.4, 0.7, 0.95, 1.0, 1.02],
            binning: None,
        };
        let tagging = Arc::new(
            TaggingModel::build(&mut ctx, &[os_tagger()], &TaggingSpec::default(), Vec::new()).unwrap(),
        );
        let resolution =
            Arc::new(ResolutionModel::build(&mut ctx, "resolution", &resolution, Some("sigma_t"), None).unwrap());
        let acceptance = Arc::new(AcceptanceModel::build(&mut ctx, "acceptance", &acceptance, (0.2, 15.0)).unwrap());
        let pdf = DecayTimePdf::build(&mut ctx, &spec, &observables(), (-4.0, 4.0), tagging, resolution, acceptance)
            .unwrap();

        let prepared = pdf.prepare(&ctx.values()).unwrap();
        let eta = prepared.average_eta();
        let before = pdf.integral_evaluations();
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        for i in 0..200 {
            let sigma_t = 0.02 + 0.0002 * i as f64;
            let (t, _) = prepared.sample_event(&mut rng, &eta, Some(sigma_t), 1.0).unwrap();
            assert!((0.2..=15.0).contains(&t));
        }
        assert_eq!(pdf.integral_evaluations(), before);

        prepared.normalisation(&eta, Some(0.03), -1.0).unwrap();
        assert_eq!(pdf.integral_evaluations(), before + 1);
    }
}
