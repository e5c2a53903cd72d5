//! Toy generation with correlated proto-data.
//!
//! A toy is generated in three stages ([`ToyStage`]): per-event conditional inputs (mistag,
//! time error) are drawn first for every cell, the decay time, tag decisions and shapes are
//! then drawn conditional on them, and finally the cells are merged into one dataset.
//!
//! Every cell draws from its own RNG sub-stream derived from the seed and the label
//! `<stage>/<process>/<submode>/<charge>`, so adding or removing a process leaves the draws of
//! the other cells untouched.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};
use sha2::{Digest, Sha256};
use std::fmt;

use tdcpv_core::{Error, Result};
use tdcpv_model::{CellSummary, CompiledAnalysis, ComponentPdf, EventStore, Parameter, Workspace};

/// Stream label of the cell-count draws.
pub const COUNT_STREAM: &str = "count";

/// Stage of a toy generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToyStage {
    /// Per-event conditional inputs.
    ProtoGen,
    /// Decay time, tag decisions and shapes.
    MainGen,
    /// Cells concatenated into one dataset.
    Merge,
}

impl ToyStage {
    /// Label used in stream names and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::ProtoGen => "proto",
            Self::MainGen => "main",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for ToyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Seed of the sub-stream `label`: `seed` mixed with the first 8 bytes of SHA-256(label).
pub fn stream_seed(seed: u64, label: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    splitmix64(seed ^ u64::from_le_bytes(head))
}

/// RNG of the sub-stream `label`.
pub fn stream_rng(seed: u64, label: &str) -> StdRng {
    StdRng::seed_from_u64(stream_seed(seed, label))
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn cell_label(prefix: &str, c: &ComponentPdf) -> String {
    format!("{prefix}/{}/{}/{}", c.process(), c.submode(), c.charge().label())
}

/// Pull `(fitted − generated) / error`; `None` for a non-positive or non-finite error.
pub fn pull(fitted: f64, generated: f64, error: f64) -> Option<f64> {
    (error.is_finite() && error > 0.0).then(|| (fitted - generated) / error)
}

/// One generated dataset.
#[derive(Debug, Clone)]
pub struct ToyDataset {
    /// Seed the dataset was generated with.
    pub seed: u64,
    /// Merged events.
    pub events: EventStore,
    /// Per cell, in (process, submode, charge) order.
    pub cells: Vec<CellSummary>,
}

impl ToyDataset {
    /// Package the dataset with the generation parameters.
    pub fn into_workspace(self, parameters: &[Parameter]) -> Result<Workspace> {
        let mut ws = Workspace::new(parameters, &self.events, self.cells)?;
        ws.seed = Some(self.seed);
        Ok(ws)
    }
}

/// Generates toys from a compiled analysis.
#[derive(Debug)]
pub struct ToySampler<'a> {
    analysis: &'a CompiledAnalysis,
}

impl<'a> ToySampler<'a> {
    /// Check that every cell can generate its per-event inputs.
    pub fn new(analysis: &'a CompiledAnalysis) -> Result<Self> {
        if analysis.components().next().is_none() {
            return Err(Error::config("generation", "no components to generate"));
        }
        for c in analysis.components() {
            c.check_generation(&analysis.layout)?;
        }
        Ok(Self { analysis })
    }

    /// Event count per cell: `round(ν)`, or `Poisson(ν)` when configured.
    ///
    /// A (process, submode) whose two charges both round to zero events is degenerate.
    pub fn cell_counts(&self, params: &[f64], seed: u64) -> Result<Vec<usize>> {
        let mut counts = Vec::new();
        for p in &self.analysis.processes {
            for pair in p.components.chunks(2) {
                let rounded: Vec<f64> = pair.iter().map(|c| c.expected_events(params).max(0.0).round()).collect();
                if rounded.iter().all(|&n| n == 0.0) {
                    return Err(Error::DegenerateData(format!(
                        "process '{}', submode '{}': zero entries produced (yields {:?})",
                        p.name,
                        pair[0].submode(),
                        pair.iter().map(|c| c.expected_events(params)).collect::<Vec<_>>()
                    )));
                }
                for (c, &r) in pair.iter().zip(&rounded) {
                    let n = if self.analysis.poisson_yields {
                        let nu = c.expected_events(params);
                        if nu > 0.0 {
                            let mut rng = stream_rng(seed, &cell_label(COUNT_STREAM, c));
                            Poisson::new(nu)
                                .map_err(|e| Error::Validation(format!("{}: yield {nu}: {e}", c.name())))?
                                .sample(&mut rng)
                        } else {
                            0.0
                        }
                    } else {
                        r
                    };
                    counts.push(n as usize);
                }
            }
        }
        Ok(counts)
    }

    /// Generate one dataset at the full parameter vector `params`.
    pub fn generate(&self, params: &[f64], seed: u64) -> Result<ToyDataset> {
        let analysis = self.analysis;
        let layout = &analysis.layout;
        let components: Vec<_> = analysis.components().collect();
        let counts = self.cell_counts(params, seed)?;

        log::info!("toy seed {seed}: stage {} ({} cells)", ToyStage::ProtoGen, components.len());
        let mut protos = Vec::with_capacity(components.len());
        for (c, &n) in components.iter().zip(&counts) {
            let mut rng = stream_rng(seed, &cell_label(ToyStage::ProtoGen.label(), c));
            protos.push(c.sample_proto(layout, n, &mut rng)?);
        }

        log::info!("toy seed {seed}: stage {}", ToyStage::MainGen);
        let mut stores = Vec::with_capacity(components.len());
        for ((c, &n), proto) in components.iter().zip(&counts).zip(&protos) {
            let mut rng = stream_rng(seed, &cell_label(ToyStage::MainGen.label(), c));
            stores.push(c.sample_main(layout, params, proto, n, &mut rng)?);
            log::debug!("cell {}: {n} events", c.name());
        }

        log::info!("toy seed {seed}: stage {}", ToyStage::Merge);
        let mut ordered = Vec::with_capacity(stores.len());
        for submode in 0..analysis.submodes.len() {
            for (c, store) in components.iter().zip(&stores) {
                if c.submode_index() == submode {
                    ordered.push(store.clone());
                }
            }
        }
        let events = EventStore::concat(&ordered)?;

        let cells = components
            .iter()
            .zip(&counts)
            .map(|(c, &n)| CellSummary {
                component: c.name().to_string(),
                process: c.process().to_string(),
                submode: c.submode().to_string(),
                charge: c.charge(),
                expected: c.expected_events(params),
                generated: n,
            })
            .collect();
        log::info!("toy seed {seed}: {} events", events.n_events());
        Ok(ToyDataset { seed, events, cells })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_seed_depends_on_label_and_seed() {
        let a = stream_seed(42, "main/signal/kkpi/plus");
        assert_eq!(a, stream_seed(42, "main/signal/kkpi/plus"));
        assert_ne!(a, stream_seed(42, "main/signal/kkpi/minus"));
        assert_ne!(a, stream_seed(43, "main/signal/kkpi/plus"));
    }

    #[test]
    fn test_pull() {
        assert_eq!(pull(1.5, 1.0, 0.25), Some(2.0));
        assert_eq!(pull(1.5, 1.0, 0.0), None);
        assert_eq!(pull(1.5, 1.0, f64::NAN), None);
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(ToyStage::ProtoGen.to_string(), "proto");
        assert_eq!(ToyStage::MainGen.label(), "main");
        assert_eq!(ToyStage::Merge.label(), "merge");
    }
}
