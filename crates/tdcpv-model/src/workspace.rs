//! Persisted state of a generation or fit: parameters, dataset and per-cell summary.

use serde::{Deserialize, Serialize};
use std::path::Path;

use tdcpv_core::{Error, FitResult, Result};

use crate::component::Charge;
use crate::context::Parameter;
use crate::event_store::{EventStore, ObservableSpec};

/// Schema tag of [`Workspace`] documents.
pub const WORKSPACE_V0: &str = "tdcpv_workspace_v0";

/// One dataset column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRecord {
    pub name: String,
    pub bounds: (f64, f64),
    pub values: Vec<f64>,
}

/// Generation summary of one (process, submode, charge) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    pub component: String,
    pub process: String,
    pub submode: String,
    pub charge: Charge,
    /// Yield at generation.
    pub expected: f64,
    /// Events actually produced.
    pub generated: usize,
}

/// Serializable workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub schema_version: String,
    /// Seed of the generation, if the dataset is a toy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub parameters: Vec<Parameter>,
    pub columns: Vec<ColumnRecord>,
    #[serde(default)]
    pub cells: Vec<CellSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit: Option<FitResult>,
}

impl Workspace {
    /// Snapshot `parameters` and `data`.
    pub fn new(parameters: &[Parameter], data: &EventStore, cells: Vec<CellSummary>) -> Result<Self> {
        let columns = data
            .observable_specs()
            .into_iter()
            .map(|spec| {
                let values = data.require_column(&spec.name)?.to_vec();
                Ok(ColumnRecord { name: spec.name, bounds: spec.bounds, values })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema_version: WORKSPACE_V0.to_string(),
            seed: None,
            parameters: parameters.to_vec(),
            columns,
            cells,
            fit: None,
        })
    }

    /// Rebuild the dataset (bounds are re-validated).
    pub fn event_store(&self) -> Result<EventStore> {
        let specs = self.columns.iter().map(|c| ObservableSpec::branch(c.name.clone(), c.bounds)).collect();
        EventStore::from_columns(specs, self.columns.iter().map(|c| (c.name.clone(), c.values.clone())))
    }

    /// Parameter called `name`.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let ws: Self = serde_json::from_str(text)?;
        if ws.schema_version != WORKSPACE_V0 {
            return Err(Error::Validation(format!(
                "unsupported workspace schema_version '{}', expected '{WORKSPACE_V0}'",
                ws.schema_version
            )));
        }
        Ok(ws)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json_string()?)?;
        log::info!("workspace written to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}
