//! Decay-time resolution models.

use std::sync::Arc;

use tdcpv_core::{Error, Result};

use crate::context::{BuildContext, ParamId};
use crate::pdf::AuxiliaryPdf;
use crate::spec::ResolutionSpec;

/// One Gaussian of the resolution kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussKernel {
    /// Bias (mean).
    pub mu: f64,
    /// Width; zero means no smearing.
    pub sigma: f64,
    /// Fraction of the kernel carried by this Gaussian.
    pub weight: f64,
}

/// Resolution model of one process.
#[derive(Debug, Clone)]
pub enum ResolutionModel {
    /// Identity kernel (tests only).
    Perfect,
    /// Fixed sum of Gaussians with a global scale and bias.
    Mean {
        /// `(σ_i, f_i)`; fractions sum to 1.
        components: Vec<(f64, f64)>,
        scale: ParamId,
        bias: ParamId,
    },
    /// Gaussian with `σ = offset + scale·σ_t`, `σ_t` read per event.
    PerEvent {
        column: String,
        scale: ParamId,
        offset: ParamId,
        bias: ParamId,
        time_error_pdf: Option<Arc<AuxiliaryPdf>>,
    },
}

impl ResolutionModel {
    /// Build from configuration, registering `<prefix>_scale`, `<prefix>_bias` (and
    /// `<prefix>_offset` for per-event resolution).
    pub fn build(
        ctx: &mut BuildContext,
        prefix: &str,
        spec: &ResolutionSpec,
        time_error_column: Option<&str>,
        time_error_pdf: Option<Arc<AuxiliaryPdf>>,
    ) -> Result<Self> {
        let component = format!("resolution '{prefix}'");
        match spec {
            ResolutionSpec::Perfect => {
                log::warn!("{component}: perfect resolution is numerically fragile, use for tests only");
                Ok(Self::Perfect)
            }
            ResolutionSpec::Mean { components, scale, bias } => {
                if components.is_empty() {
                    return Err(Error::config(component, "mean resolution needs at least one Gaussian"));
                }
                let mut out = Vec::with_capacity(components.len());
                let mut used = 0.0;
                for (i, c) in components.iter().enumerate() {
                    if !(c.sigma.is_finite() && c.sigma > 0.0) {
                        return Err(Error::config(
                            &component,
                            format!("component {i}: sigma must be > 0, got {}", c.sigma),
                        ));
                    }
                    let f = if i + 1 == components.len() {
                        1.0 - used
                    } else {
                        c.fraction.ok_or_else(|| {
                            Error::config(&component, format!("component {i}: fraction is required"))
                        })?
                    };
                    if !(f.is_finite() && f >= 0.0) {
                        return Err(Error::config(
                            &component,
                            format!("component {i}: fraction must be >= 0, got {f}"),
                        ));
                    }
                    used += f;
                    out.push((c.sigma, f));
                }
                if !(*scale > 0.0) {
                    return Err(Error::config(component, format!("scale must be > 0, got {scale}")));
                }
                Ok(Self::Mean {
                    components: out,
                    scale: ctx.get_or_create_param(&format!("{prefix}_scale"), *scale, (0.0, 10.0_f64.max(*scale)))?,
                    bias: ctx.get_or_create_param(&format!("{prefix}_bias"), *bias, (-1.0_f64.min(*bias), 1.0_f64.max(*bias)))?,
                })
            }
            ResolutionSpec::PerEvent { scale, offset, bias, .. } => {
                let column = time_error_column.ok_or_else(|| {
                    Error::config(&component, "per-event resolution requires observables.time_error")
                })?;
                Ok(Self::PerEvent {
                    column: column.to_string(),
                    scale: ctx.get_or_create_param(&format!("{prefix}_scale"), *scale, (0.0, 10.0_f64.max(*scale)))?,
                    offset: ctx.get_or_create_param(&format!("{prefix}_offset"), *offset, (-1.0_f64.min(*offset), 1.0_f64.max(*offset)))?,
                    bias: ctx.get_or_create_param(&format!("{prefix}_bias"), *bias, (-1.0_f64.min(*bias), 1.0_f64.max(*bias)))?,
                    time_error_pdf,
                })
            }
        }
    }

    /// Event column carrying `σ_t`, for per-event resolution.
    pub fn time_error_column(&self) -> Option<&str> {
        match self {
            Self::PerEvent { column, .. } => Some(column),
            Self::Perfect | Self::Mean { .. } => None,
        }
    }

    /// Time-error PDF used to generate `σ_t`.
    pub fn time_error_pdf(&self) -> Option<&Arc<AuxiliaryPdf>> {
        match self {
            Self::PerEvent { time_error_pdf, .. } => time_error_pdf.as_ref(),
            Self::Perfect | Self::Mean { .. } => None,
        }
    }

    /// Resolve the kernel at one parameter point.
    pub fn prepare(&self, params: &[f64]) -> Result<PreparedResolution> {
        Ok(match self {
            Self::Perfect => {
                PreparedResolution::Fixed(vec![GaussKernel { mu: 0.0, sigma: 0.0, weight: 1.0 }])
            }
            Self::Mean { components, scale, bias } => {
                let (s, b) = (params[scale.0], params[bias.0]);
                if !(s.is_finite() && s > 0.0) {
                    return Err(Error::Validation(format!("resolution scale must be > 0, got {s}")));
                }
                PreparedResolution::Fixed(
                    components
                        .iter()
                        .map(|&(sigma, weight)| GaussKernel { mu: b, sigma: s * sigma, weight })
                        .collect(),
                )
            }
            Self::PerEvent { scale, offset, bias, .. } => PreparedResolution::PerEvent {
                scale: params[scale.0],
                offset: params[offset.0],
                bias: params[bias.0],
            },
        })
    }
}

/// Resolution kernel at one parameter point.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedResolution {
    /// Event-independent kernel.
    Fixed(Vec<GaussKernel>),
    /// Kernel built from the event's `σ_t`.
    PerEvent { scale: f64, offset: f64, bias: f64 },
}

impl PreparedResolution {
    /// Whether the kernel depends on the event.
    pub fn is_per_event(&self) -> bool {
        matches!(self, Self::PerEvent { .. })
    }

    /// Kernel for an event with time error `sigma_t` (ignored by fixed kernels).
    pub fn kernels(&self, sigma_t: Option<f64>) -> Result<Vec<GaussKernel>> {
        match self {
            Self::Fixed(k) => Ok(k.clone()),
            Self::PerEvent { scale, offset, bias } => {
                let st = sigma_t.ok_or_else(|| {
                    Error::Validation("per-event resolution needs a time-error value".into())
                })?;
                let sigma = offset + scale * st;
                if !(sigma.is_finite() && sigma > 0.0) {
                    return Err(Error::Validation(format!(
                        "effective resolution {sigma} must be > 0 (offset={offset}, scale={scale}, sigma_t={st})"
                    )));
                }
                Ok(vec![GaussKernel { mu: *bias, sigma, weight: 1.0 }])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::GaussComponentSpec;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_resolution_last_fraction_is_complement() {
        let mut ctx = BuildContext::new();
        let spec = ResolutionSpec::Mean {
            components: vec![
                GaussComponentSpec { sigma: 0.03, fraction: Some(0.6) },
                GaussComponentSpec { sigma: 0.06, fraction: Some(0.3) },
                GaussComponentSpec { sigma: 0.12, fraction: None },
            ],
            scale: 1.15,
            bias: 0.0,
        };
        let model = ResolutionModel::build(&mut ctx, "resolution", &spec, None, None).unwrap();
        let prepared = model.prepare(&ctx.values()).unwrap();
        let kernels = prepared.kernels(None).unwrap();
        assert_eq!(kernels.len(), 3);
        assert_relative_eq!(kernels[2].weight, 0.1, epsilon = 1e-12);
        assert_relative_eq!(kernels[0].sigma, 0.0345, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_fraction_is_rejected() {
        let mut ctx = BuildContext::new();
        let spec = ResolutionSpec::Mean {
            components: vec![
                GaussComponentSpec { sigma: 0.03, fraction: Some(0.8) },
                GaussComponentSpec { sigma: 0.06, fraction: Some(0.4) },
                GaussComponentSpec { sigma: 0.12, fraction: None },
            ],
            scale: 1.0,
            bias: 0.0,
        };
        assert!(ResolutionModel::build(&mut ctx, "resolution", &spec, None, None).is_err());
    }

    #[test]
    fn test_per_event_width_uses_offset_and_scale() {
        let mut ctx = BuildContext::new();
        let spec = ResolutionSpec::PerEvent { scale: 1.2, offset: 0.01, bias: -0.002, time_error_pdf: None };
        let model = ResolutionModel::build(&mut ctx, "resolution", &spec, Some("sigma_t"), None).unwrap();
        assert_eq!(model.time_error_column(), Some("sigma_t"));
        let prepared = model.prepare(&ctx.values()).unwrap();
        let k = prepared.kernels(Some(0.04)).unwrap();
        assert_relative_eq!(k[0].sigma, 0.01 + 1.2 * 0.04, epsilon = 1e-15);
        assert_eq!(k[0].mu, -0.002);
        assert!(prepared.kernels(None).is_err());
    }

    #[test]
    fn test_per_event_without_time_error_observable_is_config_error() {
        let mut ctx = BuildContext::new();
        let spec = ResolutionSpec::PerEvent { scale: 1.0, offset: 0.0, bias: 0.0, time_error_pdf: None };
        let err = ResolutionModel::build(&mut ctx, "resolution", &spec, None, None).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
