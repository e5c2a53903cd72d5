//! CP coefficients `(C, S, D, S̄, D̄)` of the time-dependent decay rate.
//!
//! With `λ_f = |λ| e^{i arg λ_f}` and `λ̄_f̄ = |λ| e^{i arg λ̄_f̄}`:
//!
//! ```text
//! C = (1 - |λ|²) / (1 + |λ|²)
//! S = 2 Im λ_f / (1 + |λ|²)      S̄ = 2 Im λ̄_f̄ / (1 + |λ|²)
//! D = -2 Re λ_f / (1 + |λ|²)     D̄ = -2 Re λ̄_f̄ / (1 + |λ|²)
//! ```

use num_complex::Complex64;
use tdcpv_core::{Error, Result};

use crate::context::{BuildContext, ParamId};
use crate::spec::CpSpec;

/// Numeric values of the five CP coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpCoefficients {
    /// Direct CP asymmetry `C`.
    pub c: f64,
    /// Mixing-induced `S` (final state `f`).
    pub s: f64,
    /// `D` (final state `f`).
    pub d: f64,
    /// Mixing-induced `S̄` (final state `f̄`).
    pub sbar: f64,
    /// `D̄` (final state `f̄`).
    pub dbar: f64,
}

impl CpCoefficients {
    /// Mixing without CP structure: `C = 1`, everything else zero.
    pub const FLAVOUR_SPECIFIC: Self = Self { c: 1.0, s: 0.0, d: 0.0, sbar: 0.0, dbar: 0.0 };

    /// No oscillation term at all.
    pub const NON_MIXING: Self = Self { c: 0.0, s: 0.0, d: 0.0, sbar: 0.0, dbar: 0.0 };

    /// Coefficients from the amplitude-ratio arguments and common modulus.
    pub fn from_amplitudes(arg_lf: f64, arg_lbar_fbar: f64, modulus: f64) -> Self {
        let lf = Complex64::from_polar(modulus, arg_lf);
        let lbar = Complex64::from_polar(modulus, arg_lbar_fbar);
        let denom = 1.0 + modulus * modulus;
        Self {
            c: (1.0 - modulus * modulus) / denom,
            s: 2.0 * lf.im / denom,
            d: -2.0 * lf.re / denom,
            sbar: 2.0 * lbar.im / denom,
            dbar: -2.0 * lbar.re / denom,
        }
    }

    /// Coefficients from strong phase `δ`, weak phase `φ` and modulus:
    /// `arg λ_f = δ - φ`, `arg λ̄_f̄ = δ + φ`.
    pub fn from_phases(strong_phase: f64, weak_phase: f64, modulus: f64) -> Self {
        Self::from_amplitudes(strong_phase - weak_phase, strong_phase + weak_phase, modulus)
    }

    /// `S` for `qf = +1`, `S̄` for `qf = -1`.
    #[inline]
    pub fn s_eff(&self, qf: f64) -> f64 {
        if qf >= 0.0 { self.s } else { self.sbar }
    }

    /// `D` for `qf = +1`, `D̄` for `qf = -1`.
    #[inline]
    pub fn d_eff(&self, qf: f64) -> f64 {
        if qf >= 0.0 { self.d } else { self.dbar }
    }
}

/// Parameter handles of the five coefficients of one process.
#[derive(Debug, Clone, Copy)]
pub struct CpParams {
    /// `<process>_C`
    pub c: ParamId,
    /// `<process>_S`
    pub s: ParamId,
    /// `<process>_D`
    pub d: ParamId,
    /// `<process>_Sbar`
    pub sbar: ParamId,
    /// `<process>_Dbar`
    pub dbar: ParamId,
}

impl CpParams {
    /// Read the coefficients from a full parameter vector.
    pub fn values(&self, params: &[f64]) -> CpCoefficients {
        CpCoefficients {
            c: params[self.c.0],
            s: params[self.s.0],
            d: params[self.d.0],
            sbar: params[self.sbar.0],
            dbar: params[self.dbar.0],
        }
    }
}

fn require(process: &str, key: &str, v: Option<f64>) -> Result<f64> {
    match v {
        Some(x) if x.is_finite() => Ok(x),
        Some(x) => Err(Error::config(format!("process '{process}'"), format!("cp.{key} must be finite, got {x}"))),
        None => Err(Error::config(format!("process '{process}'"), format!("cp.{key} is required"))),
    }
}

/// Evaluate a CP configuration to numbers. Returns the values and whether the CP structure is
/// fixed by construction.
pub fn evaluate_cp_spec(process: &str, spec: &CpSpec) -> Result<(CpCoefficients, bool)> {
    let coeffs = match spec {
        CpSpec::Amplitudes { arg_lf, arg_lbar_fbar, mod_lf } => {
            let modulus = require(process, "mod_lf", *mod_lf)?;
            if modulus < 0.0 {
                return Err(Error::config(
                    format!("process '{process}'"),
                    format!("cp.mod_lf must be >= 0, got {modulus}"),
                ));
            }
            CpCoefficients::from_amplitudes(
                require(process, "arg_lf", *arg_lf)?,
                require(process, "arg_lbar_fbar", *arg_lbar_fbar)?,
                modulus,
            )
        }
        CpSpec::Phases { strong_phase, weak_phase, modulus } => {
            let m = require(process, "modulus", *modulus)?;
            if m < 0.0 {
                return Err(Error::config(
                    format!("process '{process}'"),
                    format!("cp.modulus must be >= 0, got {m}"),
                ));
            }
            CpCoefficients::from_phases(
                require(process, "strong_phase", *strong_phase)?,
                require(process, "weak_phase", *weak_phase)?,
                m,
            )
        }
        CpSpec::Direct { c, s, d, sbar, dbar } => CpCoefficients {
            c: require(process, "c", *c)?,
            s: require(process, "s", *s)?,
            d: require(process, "d", *d)?,
            sbar: require(process, "sbar", *sbar)?,
            dbar: require(process, "dbar", *dbar)?,
        },
        CpSpec::FlavourSpecific => return Ok((CpCoefficients::FLAVOUR_SPECIFIC, true)),
        CpSpec::NonMixing => return Ok((CpCoefficients::NON_MIXING, true)),
    };
    Ok((coeffs, false))
}

/// Register `<process>_C`, `_S`, `_D`, `_Sbar`, `_Dbar` in the context.
///
/// Coefficients of processes without CP structure are created constant.
pub fn build_cp_coefficients(
    ctx: &mut BuildContext,
    process: &str,
    spec: &CpSpec,
    interval: (f64, f64),
) -> Result<CpParams> {
    let (values, fixed) = evaluate_cp_spec(process, spec)?;
    let mut make = |suffix: &str, v: f64| -> Result<ParamId> {
        let name = format!("{process}_{suffix}");
        if fixed {
            ctx.get_or_create_constant(&name, v)
        } else {
            ctx.get_or_create_param(&name, v, interval)
        }
    };
    let params = CpParams {
        c: make("C", values.c)?,
        s: make("S", values.s)?,
        d: make("D", values.d)?,
        sbar: make("Sbar", values.sbar)?,
        dbar: make("Dbar", values.dbar)?,
    };
    log::debug!("process '{process}': CP coefficients {values:?} (fixed={fixed})");
    Ok(params)
}
