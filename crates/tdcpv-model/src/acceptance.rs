//! Decay-time acceptance.
//!
//! Every acceptance is evaluated through its *normalised* view (unit average over the time
//! range), which is what generation uses and what the likelihood multiplies the decay rate
//! with. An optional binned cache replaces the continuous shape by its bin averages, so that
//! normalisation integrals become sums of analytic per-bin basis integrals.

use std::sync::Arc;

use tdcpv_core::{Error, Result};

use crate::context::{BuildContext, ParamId};
use crate::kernel::{basis_at, basis_integral, basis_moment, BasisValues, DecayConstants};
use crate::normalize::{CompositeRule, QuadratureOrder};
use crate::resolution::GaussKernel;
use crate::spec::{AcceptanceRatioSpec, AcceptanceSpec};

/// Monotone cubic Hermite spline through `(knot, coefficient)` pairs.
///
/// Constant beyond the last knot; linear with the first slope below the first knot,
/// clamped at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineAcceptance {
    knots: Vec<f64>,
    values: Vec<f64>,
    slopes: Vec<f64>,
}

impl SplineAcceptance {
    /// Build from knots (strictly increasing) and non-negative coefficients.
    pub fn new(knots: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        let k = knots.len();
        if k < 2 {
            return Err(Error::Validation("spline acceptance requires at least 2 knots".into()));
        }
        if values.len() != k {
            return Err(Error::Validation(format!(
                "spline acceptance: {} knots but {} coefficients",
                k,
                values.len()
            )));
        }
        for i in 0..k {
            if !knots[i].is_finite() || !values[i].is_finite() {
                return Err(Error::Validation(format!(
                    "spline acceptance: knot {i} has non-finite value (x={}, y={})",
                    knots[i], values[i]
                )));
            }
            if values[i] < 0.0 {
                return Err(Error::Validation(format!(
                    "spline acceptance: knot {i} has negative coefficient {}",
                    values[i]
                )));
            }
        }
        for i in 1..k {
            if knots[i] <= knots[i - 1] {
                return Err(Error::Validation(format!(
                    "spline acceptance: knots must be strictly increasing, but x[{}]={} >= x[{}]={}",
                    i - 1,
                    knots[i - 1],
                    i,
                    knots[i]
                )));
            }
        }
        let slopes = fritsch_carlson_slopes(&knots, &values);
        Ok(Self { knots, values, slopes })
    }

    /// Raw (unnormalised) value.
    pub fn eval(&self, t: f64) -> f64 {
        let k = self.knots.len();
        if t < self.knots[0] {
            return (self.values[0] + self.slopes[0] * (t - self.knots[0])).max(0.0);
        }
        if t >= self.knots[k - 1] {
            return self.values[k - 1];
        }
        let i = self.knots.partition_point(|&x| x <= t).saturating_sub(1).min(k - 2);
        let h = self.knots[i + 1] - self.knots[i];
        let s = (t - self.knots[i]) / h;

        let h00 = (1.0 + 2.0 * s) * (1.0 - s) * (1.0 - s);
        let h10 = s * (1.0 - s) * (1.0 - s);
        let h01 = s * s * (3.0 - 2.0 * s);
        let h11 = s * s * (s - 1.0);

        (h00 * self.values[i]
            + h10 * h * self.slopes[i]
            + h01 * self.values[i + 1]
            + h11 * h * self.slopes[i + 1])
            .max(0.0)
    }

    /// Maximum over `[lo, hi]`. Segments are monotone, so extremes sit at knots or range ends.
    fn max_on(&self, lo: f64, hi: f64) -> f64 {
        self.knots
            .iter()
            .copied()
            .filter(|&x| x > lo && x < hi)
            .chain([lo, hi])
            .map(|t| self.eval(t))
            .fold(0.0, f64::max)
    }
}

/// Fritsch–Carlson monotone cubic interpolation slopes.
fn fritsch_carlson_slopes(x: &[f64], y: &[f64]) -> Vec<f64> {
    let k = x.len();
    debug_assert!(k >= 2);

    let delta: Vec<f64> = (0..k - 1).map(|i| (y[i + 1] - y[i]) / (x[i + 1] - x[i])).collect();

    let mut m = vec![0.0; k];
    m[0] = delta[0];
    for i in 1..k - 1 {
        m[i] = if delta[i - 1].signum() != delta[i].signum() {
            0.0
        } else {
            0.5 * (delta[i - 1] + delta[i])
        };
    }
    m[k - 1] = delta[k - 2];

    for i in 0..k - 1 {
        if delta[i].abs() < 1e-30 {
            m[i] = 0.0;
            m[i + 1] = 0.0;
        } else {
            let alpha = m[i] / delta[i];
            let beta = m[i + 1] / delta[i];
            // α² + β² ≤ 9
            let phi = alpha * alpha + beta * beta;
            if phi > 9.0 {
                let tau = 3.0 / phi.sqrt();
                m[i] = tau * alpha * delta[i];
                m[i + 1] = tau * beta * delta[i];
            }
        }
    }
    m
}

/// Multiplicative correction of the power-law acceptance.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptanceRatio {
    Fixed(f64),
    /// Piecewise constant on `edges`; the first/last bin extends beyond the edges.
    Histogram { edges: Vec<f64>, values: Vec<f64> },
}

impl AcceptanceRatio {
    fn from_spec(component: &str, spec: &AcceptanceRatioSpec) -> Result<Self> {
        match spec {
            AcceptanceRatioSpec::Fixed { value } => {
                if !(value.is_finite() && *value > 0.0) {
                    return Err(Error::config(component, format!("ratio must be > 0, got {value}")));
                }
                Ok(Self::Fixed(*value))
            }
            AcceptanceRatioSpec::Histogram { edges, values } => {
                if edges.len() < 2 || values.len() + 1 != edges.len() {
                    return Err(Error::config(
                        component,
                        format!("ratio histogram needs n+1 edges for n values, got {} edges and {} values", edges.len(), values.len()),
                    ));
                }
                if edges.windows(2).any(|w| !(w[1] > w[0])) {
                    return Err(Error::config(component, "ratio histogram edges must be strictly increasing"));
                }
                if values.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                    return Err(Error::config(component, "ratio histogram values must be finite and >= 0"));
                }
                Ok(Self::Histogram { edges: edges.clone(), values: values.clone() })
            }
        }
    }

    #[inline]
    fn eval(&self, t: f64) -> f64 {
        match self {
            Self::Fixed(r) => *r,
            Self::Histogram { edges, values } => {
                let i = edges.partition_point(|&e| e <= t).saturating_sub(1).min(values.len() - 1);
                values[i]
            }
        }
    }
}

/// `f(t) = xⁿ/(1 + xⁿ) (1 - slope t)`, `x = max(0, β (t - offset))`, clamped at zero and
/// multiplied by an optional ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerLawAcceptance {
    pub beta: f64,
    pub exponent: f64,
    pub offset: f64,
    pub slope: f64,
    pub ratio: Option<AcceptanceRatio>,
}

impl PowerLawAcceptance {
    /// Check `β > 0`, `n > 0` and finite offset and slope.
    pub fn new(beta: f64, exponent: f64, offset: f64, slope: f64, ratio: Option<AcceptanceRatio>) -> Result<Self> {
        for (key, v) in [("beta", beta), ("exponent", exponent), ("offset", offset), ("slope", slope)] {
            if !v.is_finite() {
                return Err(Error::Validation(format!("power-law acceptance: {key} must be finite, got {v}")));
            }
        }
        if beta <= 0.0 || exponent <= 0.0 {
            return Err(Error::Validation(format!(
                "power-law acceptance: beta and exponent must be > 0, got {beta} and {exponent}"
            )));
        }
        Ok(Self { beta, exponent, offset, slope, ratio })
    }

    /// Raw (unnormalised) value.
    pub fn eval(&self, t: f64) -> f64 {
        let x = (self.beta * (t - self.offset)).max(0.0);
        let xn = x.powf(self.exponent);
        let turn_on = if xn.is_infinite() { 1.0 } else { xn / (1.0 + xn) };
        let f = (turn_on * (1.0 - self.slope * t)).max(0.0);
        match &self.ratio {
            Some(r) => f * r.eval(t),
            None => f,
        }
    }
}

/// Closed set of acceptance shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    None,
    Spline(SplineAcceptance),
    PowerLaw(PowerLawAcceptance),
}

impl Acceptance {
    /// Raw (unnormalised) value.
    pub fn eval_raw(&self, t: f64) -> f64 {
        match self {
            Self::None => 1.0,
            Self::Spline(s) => s.eval(t),
            Self::PowerLaw(p) => p.eval(t),
        }
    }

    /// Points in `(lo, hi)` where the shape has a kink or jump.
    fn breakpoints(&self, lo: f64, hi: f64) -> Vec<f64> {
        let mut pts = vec![lo, hi];
        match self {
            Self::None => {}
            Self::Spline(s) => pts.extend(s.knots.iter().copied()),
            Self::PowerLaw(p) => {
                pts.push(p.offset);
                if let Some(AcceptanceRatio::Histogram { edges, .. }) = &p.ratio {
                    pts.extend(edges.iter().copied());
                }
            }
        }
        pts.retain(|&x| x >= lo && x <= hi);
        pts.sort_by(f64::total_cmp);
        pts.dedup();
        pts
    }
}

/// Bin averages of the normalised acceptance on a uniform grid.
#[derive(Debug, Clone, PartialEq)]
pub struct BinnedAcceptance {
    edges: Vec<f64>,
    values: Vec<f64>,
}

impl BinnedAcceptance {
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    fn eval(&self, t: f64) -> f64 {
        let i = self.edges.partition_point(|&e| e <= t).saturating_sub(1).min(self.values.len() - 1);
        self.values[i]
    }
}

/// Acceptance over a fixed time range, normalised to unit average.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAcceptance {
    shape: Acceptance,
    range: (f64, f64),
    /// `1 / average(raw)`.
    scale: f64,
    /// Maximum of the normalised view on the range.
    max: f64,
    binned: Option<BinnedAcceptance>,
}

const BINNING_ORDER: QuadratureOrder = QuadratureOrder::N16;

fn piecewise_integral(rule: &CompositeRule, pts: &[f64], max_width: f64, f: impl Fn(f64) -> f64) -> f64 {
    pts.windows(2).map(|w| rule.integrate(w[0], w[1], max_width, &f)).sum()
}

impl TimeAcceptance {
    /// Normalise `shape` over `range`, optionally caching `n_bins` bin averages.
    pub fn from_shape(
        component: &str,
        shape: Acceptance,
        range: (f64, f64),
        n_bins: Option<usize>,
    ) -> Result<Self> {
        let (lo, hi) = range;
        let rule = CompositeRule::new(BINNING_ORDER);
        let width = hi - lo;
        let pts = shape.breakpoints(lo, hi);
        let integral = piecewise_integral(&rule, &pts, width / 200.0, |t| shape.eval_raw(t));
        if !(integral.is_finite() && integral > 0.0) {
            return Err(Error::Computation(format!(
                "{component}: acceptance integral over [{lo}, {hi}] is {integral}"
            )));
        }
        let scale = width / integral;

        let raw_max = match &shape {
            Acceptance::None => 1.0,
            Acceptance::Spline(s) => s.max_on(lo, hi),
            Acceptance::PowerLaw(_) => {
                let n = 2000;
                let grid = (0..=n).map(|i| lo + width * i as f64 / n as f64);
                // The grid can step over the peak; keep a margin.
                1.05 * grid.chain(pts.iter().copied()).map(|t| shape.eval_raw(t)).fold(0.0, f64::max)
            }
        };

        let binned = match n_bins {
            None => None,
            Some(0) => {
                return Err(Error::config(component, "acceptance binning must be >= 1"));
            }
            Some(n) => {
                let edges: Vec<f64> = (0..=n).map(|i| lo + width * i as f64 / n as f64).collect();
                let values = edges
                    .windows(2)
                    .map(|w| {
                        let mut seg = shape.breakpoints(w[0], w[1]);
                        seg.extend([w[0], w[1]]);
                        seg.sort_by(f64::total_cmp);
                        seg.dedup();
                        scale * piecewise_integral(&rule, &seg, f64::INFINITY, |t| shape.eval_raw(t))
                            / (w[1] - w[0])
                    })
                    .collect();
                Some(BinnedAcceptance { edges, values })
            }
        };

        let max = match &binned {
            Some(b) => b.values.iter().copied().fold(0.0, f64::max),
            None => scale * raw_max,
        };
        log::debug!("{component}: acceptance normalised with scale {scale:.6}, max {max:.6}");
        Ok(Self { shape, range, scale, max, binned })
    }

    pub fn shape(&self) -> &Acceptance {
        &self.shape
    }

    pub fn range(&self) -> (f64, f64) {
        self.range
    }

    pub fn binned(&self) -> Option<&BinnedAcceptance> {
        self.binned.as_ref()
    }

    /// True if the acceptance is identically one.
    pub fn is_flat(&self) -> bool {
        matches!(self.shape, Acceptance::None)
    }

    /// Normalised value (bin average when binned).
    #[inline]
    pub fn eval(&self, t: f64) -> f64 {
        match &self.binned {
            Some(b) => b.eval(t),
            None => self.scale * self.shape.eval_raw(t),
        }
    }

    /// Raw value of the continuous shape.
    #[inline]
    pub fn eval_raw(&self, t: f64) -> f64 {
        self.shape.eval_raw(t)
    }

    /// Upper bound of [`Self::eval`] on the range.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// `∫ acc(t) B_k(t) dt` over the range.
    pub fn basis_integral(&self, dc: &DecayConstants, kernels: &[GaussKernel], rule: &CompositeRule) -> BasisValues {
        self.weighted(dc, kernels, rule, false)
    }

    /// `∫ t acc(t) B_k(t) dt` over the range.
    pub fn basis_moment(&self, dc: &DecayConstants, kernels: &[GaussKernel], rule: &CompositeRule) -> BasisValues {
        self.weighted(dc, kernels, rule, true)
    }

    fn weighted(&self, dc: &DecayConstants, kernels: &[GaussKernel], rule: &CompositeRule, moment: bool) -> BasisValues {
        let (lo, hi) = self.range;
        let exact = |a: f64, b: f64| {
            if moment { basis_moment(dc, a, b, kernels) } else { basis_integral(dc, a, b, kernels) }
        };
        if self.is_flat() {
            return exact(lo, hi);
        }
        let mut out = BasisValues::default();
        if let Some(b) = &self.binned {
            for (w, &v) in b.edges.windows(2).zip(&b.values) {
                if v == 0.0 {
                    continue;
                }
                let i = exact(w[0], w[1]);
                out.cosh += v * i.cosh;
                out.sinh += v * i.sinh;
                out.cos += v * i.cos;
                out.sin += v * i.sin;
            }
            return out;
        }
        let mut max_width = (hi - lo) / 50.0;
        if dc.delta_m.abs() > 0.0 {
            max_width = max_width.min(std::f64::consts::PI / (2.0 * dc.delta_m.abs()));
        }
        for w in self.shape.breakpoints(lo, hi).windows(2) {
            let (xs, ws) = rule.grid(w[0], w[1], max_width);
            for (&t, &wt) in xs.iter().zip(&ws) {
                let f = wt * self.eval(t) * if moment { t } else { 1.0 };
                if f == 0.0 {
                    continue;
                }
                let bv = basis_at(dc, t, kernels);
                out.cosh += f * bv.cosh;
                out.sinh += f * bv.sinh;
                out.cos += f * bv.cos;
                out.sin += f * bv.sin;
            }
        }
        out
    }
}

/// Parameter handles of an acceptance shape.
#[derive(Debug, Clone, PartialEq)]
enum ShapeParams {
    None,
    Spline { knots: Vec<f64>, coefficients: Vec<ParamId> },
    PowerLaw { beta: ParamId, exponent: ParamId, offset: ParamId, slope: ParamId, ratio: Option<AcceptanceRatio> },
}

impl ShapeParams {
    fn ids(&self) -> Vec<ParamId> {
        match self {
            Self::None => Vec::new(),
            Self::Spline { coefficients, .. } => coefficients.clone(),
            Self::PowerLaw { beta, exponent, offset, slope, .. } => vec![*beta, *exponent, *offset, *slope],
        }
    }

    /// Shape at `values`, ordered as [`Self::ids`].
    fn shape(&self, values: &[f64]) -> Result<Acceptance> {
        match self {
            Self::None => Ok(Acceptance::None),
            Self::Spline { knots, .. } => Ok(Acceptance::Spline(SplineAcceptance::new(knots.clone(), values.to_vec())?)),
            Self::PowerLaw { ratio, .. } => Ok(Acceptance::PowerLaw(PowerLawAcceptance::new(
                values[0],
                values[1],
                values[2],
                values[3],
                ratio.clone(),
            )?)),
        }
    }
}

/// Acceptance whose shape parameters live in the [`BuildContext`].
///
/// Spline coefficients are registered as `<name>_c<i>`; the last one is created constant,
/// since the normalised view does not depend on the overall scale of the coefficients.
/// Power-law parameters are `<name>_beta`, `<name>_exponent`, `<name>_offset` and
/// `<name>_slope`. The normalised view at the registered values is kept and returned by
/// [`Self::prepare`] for as long as the shape parameters keep those values.
#[derive(Debug)]
pub struct AcceptanceModel {
    name: String,
    params: ShapeParams,
    ids: Vec<ParamId>,
    range: (f64, f64),
    binning: Option<usize>,
    nominal_values: Vec<f64>,
    nominal: Arc<TimeAcceptance>,
}

fn widen((lo, hi): (f64, f64), v: f64) -> (f64, f64) {
    (lo.min(v), hi.max(v))
}

impl AcceptanceModel {
    /// Register the shape parameters under `name` and normalise over `range`.
    pub fn build(ctx: &mut BuildContext, name: &str, spec: &AcceptanceSpec, range: (f64, f64)) -> Result<Self> {
        let (lo, hi) = range;
        if !(lo.is_finite() && hi.is_finite() && hi > lo) {
            return Err(Error::config(name, format!("invalid time range [{lo}, {hi}]")));
        }
        let (params, binning) = match spec {
            AcceptanceSpec::None => (ShapeParams::None, None),
            AcceptanceSpec::Spline { knots, coefficients, binning } => {
                SplineAcceptance::new(knots.clone(), coefficients.clone())
                    .map_err(|e| Error::config(name, e.to_string()))?;
                let mut ids = Vec::with_capacity(coefficients.len());
                for (i, &v) in coefficients.iter().enumerate() {
                    ids.push(ctx.get_or_create_param(&format!("{name}_c{i}"), v, (0.0, (2.0 * v).max(10.0)))?);
                }
                ctx.set_constant(&format!("{name}_c{}", coefficients.len() - 1))?;
                (ShapeParams::Spline { knots: knots.clone(), coefficients: ids }, *binning)
            }
            AcceptanceSpec::PowerLaw { beta, exponent, offset, slope, ratio, binning } => {
                PowerLawAcceptance::new(*beta, *exponent, *offset, *slope, None)
                    .map_err(|e| Error::config(name, e.to_string()))?;
                let ratio = ratio.as_ref().map(|r| AcceptanceRatio::from_spec(name, r)).transpose()?;
                let params = ShapeParams::PowerLaw {
                    beta: ctx.get_or_create_param(&format!("{name}_beta"), *beta, (1e-6_f64.min(*beta), (10.0 * beta).max(100.0)))?,
                    exponent: ctx.get_or_create_param(
                        &format!("{name}_exponent"),
                        *exponent,
                        (1e-3_f64.min(*exponent), (10.0 * exponent).max(20.0)),
                    )?,
                    offset: ctx.get_or_create_param(&format!("{name}_offset"), *offset, widen((-5.0, 5.0), *offset))?,
                    slope: ctx.get_or_create_param(&format!("{name}_slope"), *slope, widen((-1.0, 1.0), *slope))?,
                    ratio,
                };
                (params, *binning)
            }
        };
        let ids = params.ids();
        let nominal_values: Vec<f64> = ids.iter().map(|&id| ctx.param(id).value).collect();
        let shape = params.shape(&nominal_values).map_err(|e| Error::config(name, e.to_string()))?;
        let nominal = Arc::new(TimeAcceptance::from_shape(name, shape, range, binning)?);
        Ok(Self { name: name.to_string(), params, ids, range, binning, nominal_values, nominal })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> (f64, f64) {
        self.range
    }

    /// Shape parameters, in registration order.
    pub fn parameters(&self) -> &[ParamId] {
        &self.ids
    }

    /// Normalised view at the registered parameter values.
    pub fn nominal(&self) -> &Arc<TimeAcceptance> {
        &self.nominal
    }

    /// Normalised view at `params`; the binned cache, if any, is rebuilt from these values.
    pub fn prepare(&self, params: &[f64]) -> Result<Arc<TimeAcceptance>> {
        let values: Vec<f64> = self.ids.iter().map(|id| params[id.0]).collect();
        if values == self.nominal_values {
            return Ok(self.nominal.clone());
        }
        let shape = self.params.shape(&values)?;
        Ok(Arc::new(TimeAcceptance::from_shape(&self.name, shape, self.range, self.binning)?))
    }
}
