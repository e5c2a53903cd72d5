//! Flavour tagging: mistag calibration, tag-decision weights and tagger combination.
//!
//! Per tagger and decision `q ∈ {+1, -1}` the calibrated mistag is
//!
//! ```text
//! ω(η, q) = p0 + q Δp0/2 + (p1 + q Δp1/2) (η - ⟨η⟩)
//! ```
//!
//! clamped to `[0, 0.5]` when evaluated. The decision weight is `ε(1 + a)` for `q = +1`,
//! `ε(1 - a)` for `q = -1` and `1 - ε` for untagged events, times the multiplicity
//! `(2 - |q|)`. Summed over decisions this gives 2 for every tagger.

use std::sync::Arc;

use tdcpv_core::{Error, Result};

use crate::context::{BuildContext, ParamId};
use crate::pdf::AuxiliaryPdf;
use crate::spec::{TagCombinationSpec, TaggerSpec, TaggingSpec};

/// Slack allowed when validating the calibrated mistag range.
pub const MISTAG_RANGE_TOLERANCE: f64 = 1e-9;

/// Numeric calibration of one tagger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Mistag at `η = ⟨η⟩`, averaged over the two decision branches.
    pub p0: f64,
    /// Slope of the mistag in `η - ⟨η⟩`.
    pub p1: f64,
    /// Difference of `p0` between the `+1` and `-1` branches.
    pub dp0: f64,
    /// Difference of `p1` between the `+1` and `-1` branches.
    pub dp1: f64,
    /// Pivot `⟨η⟩` of the linear calibration.
    pub avg_eta: f64,
}

impl Calibration {
    /// Unclamped calibrated mistag for decision branch `q` (`±1`).
    #[inline]
    pub fn raw_mistag(&self, eta: f64, q: i8) -> f64 {
        let qf = f64::from(q);
        self.p0 + 0.5 * qf * self.dp0 + (self.p1 + 0.5 * qf * self.dp1) * (eta - self.avg_eta)
    }

    /// Calibrated mistag clamped to `[0, 0.5]`.
    #[inline]
    pub fn mistag(&self, eta: f64, q: i8) -> f64 {
        self.raw_mistag(eta, q).clamp(0.0, 0.5)
    }

    /// Check `ω(η, ±1) ∈ [0, 0.5]` at both ends of the η domain.
    ///
    /// `ω` is linear in `η`, so the endpoints bound the whole domain.
    pub fn validate(&self, tagger: &str, domain: (f64, f64)) -> Result<()> {
        let (lo, hi) = domain;
        if !(0.0 <= lo && lo <= hi && hi < 1.0) {
            return Err(Error::config(
                format!("tagger '{tagger}'"),
                format!("eta domain [{lo}, {hi}] must lie inside [0, 1)"),
            ));
        }
        for &eta in &[lo, hi] {
            for &q in &[1i8, -1] {
                let w = self.raw_mistag(eta, q);
                if !(w.is_finite()
                    && w >= -MISTAG_RANGE_TOLERANCE
                    && w <= 0.5 + MISTAG_RANGE_TOLERANCE)
                {
                    return Err(Error::config(
                        format!("tagger '{tagger}'"),
                        format!(
                            "calibrated mistag {w} outside [0, 0.5] at eta={eta}, decision={q:+} \
                             (p0={}, p1={}, dp0={}, dp1={}, <eta>={})",
                            self.p0, self.p1, self.dp0, self.dp1, self.avg_eta
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parameter handles of a tagger calibration.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationParams {
    /// `<tagger>_p0`
    pub p0: ParamId,
    /// `<tagger>_p1`
    pub p1: ParamId,
    /// `<tagger>_dp0`
    pub dp0: ParamId,
    /// `<tagger>_dp1`
    pub dp1: ParamId,
    /// `<tagger>_avg_eta`, registered as a constant.
    pub avg_eta: ParamId,
}

impl CalibrationParams {
    fn values(&self, params: &[f64]) -> Calibration {
        Calibration {
            p0: params[self.p0.0],
            p1: params[self.p1.0],
            dp0: params[self.dp0.0],
            dp1: params[self.dp1.0],
            avg_eta: params[self.avg_eta.0],
        }
    }
}

/// How several taggers combine into one even/odd pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagCombination {
    /// Independent taggers, exact.
    Product,
    /// First-order sum of dilutions.
    Sum,
}

impl From<TagCombinationSpec> for TagCombination {
    fn from(s: TagCombinationSpec) -> Self {
        match s {
            TagCombinationSpec::Product => Self::Product,
            TagCombinationSpec::Sum => Self::Sum,
        }
    }
}

/// Source of the per-event mistag η.
#[derive(Debug, Clone)]
pub enum MistagModel {
    /// η ≡ ⟨η⟩.
    Average,
    /// η read from `column`; `pdf` is required to generate it.
    PerEvent { column: String, pdf: Option<Arc<AuxiliaryPdf>> },
}

/// A named flavour tagger.
#[derive(Debug, Clone)]
pub struct Tagger {
    /// Tagger name, prefix of its parameters.
    pub name: String,
    /// Column holding the tag decision in `{-1, 0, +1}`.
    pub decision_column: String,
    /// Calibration parameters mapping `η` to the mistag.
    pub calibration: CalibrationParams,
    /// Average or per-event mistag estimate.
    pub mistag: MistagModel,
    /// Allowed range of `η`; calibrated mistags are checked at its ends.
    pub eta_domain: (f64, f64),
    /// Default efficiency / asymmetry, used by processes that do not override them.
    pub efficiency: TagEfficiency,
}

impl Tagger {
    /// Mistag column, if η is per event.
    pub fn mistag_column(&self) -> Option<&str> {
        match &self.mistag {
            MistagModel::Average => None,
            MistagModel::PerEvent { column, .. } => Some(column),
        }
    }
}

/// Tagging efficiency and its asymmetry for one (process, tagger) pair.
#[derive(Debug, Clone, Copy)]
pub struct TagEfficiency {
    pub eff: ParamId,
    pub asym: ParamId,
}

/// All taggers of the analysis with the combination policy.
#[derive(Debug, Clone)]
pub struct TaggingModel {
    taggers: Vec<Tagger>,
    combination: TagCombination,
    perfect: bool,
    decisions: Vec<Vec<i8>>,
}

/// Even/odd tagging terms for one decision vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TagTerms {
    /// `E`
    pub even: f64,
    /// `O`
    pub odd: f64,
    /// `W = Π (2 - |q_i|) w_i(q_i)`
    pub weight: f64,
    /// At least one tagger gave a decision.
    pub tagged: bool,
}

fn widen((lo, hi): (f64, f64), v: f64) -> (f64, f64) {
    (lo.min(v), hi.max(v))
}

fn check_efficiency(component: &str, eff: f64, asym: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&eff) {
        return Err(Error::config(component, format!("tagging efficiency {eff} outside [0, 1]")));
    }
    if !(asym.is_finite() && asym.abs() <= 1.0) {
        return Err(Error::config(
            component,
            format!("tagging efficiency asymmetry {asym} outside [-1, 1]"),
        ));
    }
    Ok(())
}

impl TaggingModel {
    /// Build the taggers, registering their calibration and efficiency parameters.
    ///
    /// `mistag_pdfs` maps tagger index to an already built mistag PDF (if configured).
    pub fn build(
        ctx: &mut BuildContext,
        specs: &[TaggerSpec],
        tagging: &TaggingSpec,
        mut mistag_pdfs: Vec<Option<Arc<AuxiliaryPdf>>>,
    ) -> Result<Self> {
        if tagging.perfect && specs.len() > 1 {
            return Err(Error::config(
                "tagging",
                format!(
                    "perfect tagging is only meaningful for a single tagger, {} are active",
                    specs.len()
                ),
            ));
        }
        mistag_pdfs.resize(specs.len(), None);

        let mut taggers = Vec::with_capacity(specs.len());
        for (spec, pdf) in specs.iter().zip(mistag_pdfs) {
            let name = &spec.name;
            let component = format!("tagger '{name}'");
            if taggers.iter().any(|t: &Tagger| &t.name == name) {
                return Err(Error::config(component, "declared twice".to_string()));
            }
            let cal = spec.calibration;
            let numeric = Calibration {
                p0: cal.p0,
                p1: cal.p1,
                dp0: cal.dp0,
                dp1: cal.dp1,
                avg_eta: cal.avg_eta,
            };
            let domain = (spec.eta_domain[0], spec.eta_domain[1]);
            if !tagging.perfect {
                numeric.validate(name, domain)?;
            }
            check_efficiency(&component, spec.efficiency, spec.efficiency_asymmetry)?;

            let calibration = CalibrationParams {
                p0: ctx.get_or_create_param(&format!("{name}_p0"), cal.p0, widen((0.0, 0.5), cal.p0))?,
                p1: ctx.get_or_create_param(&format!("{name}_p1"), cal.p1, widen((0.0, 2.0), cal.p1))?,
                dp0: ctx.get_or_create_param(&format!("{name}_dp0"), cal.dp0, widen((-0.5, 0.5), cal.dp0))?,
                dp1: ctx.get_or_create_param(&format!("{name}_dp1"), cal.dp1, widen((-1.0, 1.0), cal.dp1))?,
                avg_eta: ctx.get_or_create_constant(&format!("{name}_avg_eta"), cal.avg_eta)?,
            };
            let efficiency = TagEfficiency {
                eff: ctx.get_or_create_param(&format!("{name}_eff"), spec.efficiency, (0.0, 1.0))?,
                asym: ctx.get_or_create_param(
                    &format!("{name}_aeff"),
                    spec.efficiency_asymmetry,
                    (-1.0, 1.0),
                )?,
            };

            let mistag = match &spec.mistag {
                crate::spec::MistagSpec::Average => MistagModel::Average,
                crate::spec::MistagSpec::PerEvent { column, .. } => {
                    MistagModel::PerEvent { column: column.clone(), pdf }
                }
            };
            taggers.push(Tagger {
                name: name.clone(),
                decision_column: spec.decision.clone(),
                calibration,
                mistag,
                eta_domain: domain,
                efficiency,
            });
        }

        let decisions = enumerate_decisions(taggers.len(), tagging.perfect);
        Ok(Self { taggers, combination: tagging.combination.into(), perfect: tagging.perfect, decisions })
    }

    /// Taggers in configuration order.
    pub fn taggers(&self) -> &[Tagger] {
        &self.taggers
    }

    pub fn combination(&self) -> TagCombination {
        self.combination
    }

    pub fn is_perfect(&self) -> bool {
        self.perfect
    }

    /// Every admissible decision vector (one entry per tagger).
    pub fn decision_vectors(&self) -> &[Vec<i8>] {
        &self.decisions
    }

    /// Read calibrations and efficiencies for one parameter point.
    pub fn prepare(&self, params: &[f64], efficiencies: &[TagEfficiency]) -> Result<PreparedTagging> {
        if efficiencies.len() != self.taggers.len() {
            return Err(Error::Validation(format!(
                "expected {} tag efficiencies, got {}",
                self.taggers.len(),
                efficiencies.len()
            )));
        }
        let mut calibrations = Vec::with_capacity(self.taggers.len());
        let mut weights = Vec::with_capacity(self.taggers.len());
        for (t, e) in self.taggers.iter().zip(efficiencies) {
            let (eff, asym) = (params[e.eff.0], params[e.asym.0]);
            check_efficiency(&format!("tagger '{}'", t.name), eff, asym)?;
            calibrations.push(t.calibration.values(params));
            weights.push(if self.perfect { (1.0, asym) } else { (eff, asym) });
        }
        Ok(PreparedTagging { calibrations, weights, combination: self.combination, perfect: self.perfect })
    }
}

/// `3ⁿ` vectors over `{+1, -1, 0}`, or `2ⁿ` over `{+1, -1}` with perfect tagging.
fn enumerate_decisions(n: usize, perfect: bool) -> Vec<Vec<i8>> {
    let alphabet: &[i8] = if perfect { &[1, -1] } else { &[1, -1, 0] };
    let mut out: Vec<Vec<i8>> = vec![Vec::with_capacity(n)];
    for _ in 0..n {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                alphabet.iter().map(move |&q| {
                    let mut v = prefix.clone();
                    v.push(q);
                    v
                })
            })
            .collect();
    }
    out
}

/// Tagging state at one parameter point.
#[derive(Debug, Clone)]
pub struct PreparedTagging {
    calibrations: Vec<Calibration>,
    /// `(ε, a)` per tagger.
    weights: Vec<(f64, f64)>,
    combination: TagCombination,
    perfect: bool,
}

impl PreparedTagging {
    /// Calibration of tagger `i`.
    pub fn calibration(&self, i: usize) -> &Calibration {
        &self.calibrations[i]
    }

    /// Decision weight `w(q)` of tagger `i`, without the `(2 - |q|)` multiplicity.
    #[inline]
    pub fn decision_weight(&self, i: usize, q: i8) -> f64 {
        let (eff, asym) = self.weights[i];
        match q {
            1 => eff * (1.0 + asym),
            -1 => eff * (1.0 - asym),
            _ => 1.0 - eff,
        }
    }

    /// Dilution `1 - 2ω` of tagger `i` for decision `q` at mistag `eta`.
    #[inline]
    pub fn dilution(&self, i: usize, q: i8, eta: f64) -> f64 {
        if q == 0 {
            return 0.0;
        }
        if self.perfect {
            return 1.0;
        }
        1.0 - 2.0 * self.calibrations[i].mistag(eta, q)
    }

    /// Combined `(E, O, W)` for decision vector `q` with per-tagger mistags `eta`.
    pub fn terms(&self, q: &[i8], eta: &[f64]) -> TagTerms {
        let mut weight = 1.0;
        let mut tagged = false;
        let (mut plus, mut minus, mut sum) = (1.0, 1.0, 0.0);
        for (i, (&qi, &eta_i)) in q.iter().zip(eta).enumerate() {
            weight *= f64::from(2 - qi.abs()) * self.decision_weight(i, qi);
            if qi != 0 {
                tagged = true;
                let x = f64::from(qi) * self.dilution(i, qi, eta_i);
                plus *= 1.0 + x;
                minus *= 1.0 - x;
                sum += x;
            }
        }
        let (even, odd) = match self.combination {
            TagCombination::Product => (0.5 * (plus + minus), 0.5 * (plus - minus)),
            TagCombination::Sum => (1.0, sum),
        };
        TagTerms { even, odd, weight, tagged }
    }
}
