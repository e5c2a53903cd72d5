//! # tdcpv-inference
//!
//! Toy generation and maximum-likelihood fitting for tdcpv models.
//!
//! This crate provides:
//! - Bounded L-BFGS minimisation on top of argmin ([`optimizer`])
//! - Maximum-likelihood fits with Hessian-based covariance ([`mle`])
//! - The staged toy sampler with partitioned RNG streams ([`toys`])
//!
//! Fits depend on [`tdcpv_core::LogDensityModel`] only, not on the concrete decay-time model.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Maximum-likelihood estimation via L-BFGS.
pub mod mle;
/// Generic numerical optimizer (L-BFGS backend).
pub mod optimizer;
/// Toy generation: proto-data, main generation, merge.
pub mod toys;

pub use mle::MaximumLikelihoodEstimator;
pub use optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use toys::{ToyDataset, ToySampler, ToyStage, pull, stream_rng, stream_seed};
