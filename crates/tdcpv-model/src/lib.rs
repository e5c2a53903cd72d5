//! # tdcpv-model
//!
//! Time-dependent CP-violation decay-time model.
//!
//! This crate provides:
//! - CP coefficients from amplitudes, phases or direct values ([`coefficients`])
//! - Flavour-tagging calibration and tag combination ([`tagging`])
//! - Resolution kernels, decay-time acceptance and the convolved basis ([`resolution`],
//!   [`acceptance`], [`kernel`])
//! - The decay-time PDF and its accept-reject sampler ([`decay_rate`])
//! - Per-cell composite PDFs with yields ([`component`]) and the extended likelihood
//!   ([`model`]), implementing [`tdcpv_core::LogDensityModel`]
//! - Typed JSON configuration and its compilation ([`spec`]), persisted state ([`workspace`])

#![warn(clippy::all)]

pub mod acceptance;
pub mod coefficients;
pub mod component;
pub mod context;
pub mod decay_rate;
pub mod event_store;
pub mod kernel;
pub mod model;
pub mod normalize;
pub mod pdf;
pub mod resolution;
pub mod spec;
pub mod tagging;
pub mod workspace;

mod math;

pub use component::{Charge, ComponentPdf, DatasetLayout, ProcessModel, ProtoData};
pub use context::{BuildContext, ParamId, Parameter};
pub use decay_rate::{DecayTimePdf, PreparedDecayTime};
pub use event_store::{EventStore, ObservableSpec};
pub use math::faddeeva;
pub use model::CpFitModel;
pub use pdf::{AuxiliaryPdf, UnbinnedPdf};
pub use spec::{compile_model, AnalysisSpecV0, CompiledAnalysis, ANALYSIS_SPEC_V0};
pub use workspace::{CellSummary, Workspace};
