//! Columnar event storage for decay-time likelihoods and toy datasets.
//!
//! One row of an [`EventStore`] is one event tuple: decay time, optional time error, tag
//! decisions and mistags, final-state charge, masses/PID and (for toys) the true component
//! label. Categorical columns are stored as `f64` like every other column.

use tdcpv_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};

/// Observable definition: column name plus the support used for normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableSpec {
    /// Column name in the resulting [`EventStore`].
    pub name: String,
    /// Support bounds `(low, high)` of this observable.
    pub bounds: (f64, f64),
}

impl ObservableSpec {
    /// Convenience constructor.
    pub fn branch(name: impl Into<String>, bounds: (f64, f64)) -> Self {
        Self { name: name.into(), bounds }
    }
}

/// Columnar event storage (Structure-of-Arrays / SoA).
#[derive(Debug, Clone)]
pub struct EventStore {
    n_events: usize,
    column_names: Vec<String>,
    columns: Vec<Vec<f64>>,
    name_to_index: HashMap<String, usize>,
    bounds: HashMap<String, (f64, f64)>,
}

impl EventStore {
    /// Create an [`EventStore`] from already materialized columns.
    ///
    /// `observables` defines which columns are required and provides their bounds. Extra
    /// columns are ignored.
    pub fn from_columns(
        observables: Vec<ObservableSpec>,
        columns: impl IntoIterator<Item = (String, Vec<f64>)>,
    ) -> Result<Self> {
        if observables.is_empty() {
            return Err(Error::Validation("EventStore requires at least one observable".into()));
        }

        let mut by_name: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (name, col) in columns {
            by_name.insert(name, col);
        }

        let mut column_names = Vec::with_capacity(observables.len());
        let mut cols = Vec::with_capacity(observables.len());
        let mut bounds = HashMap::with_capacity(observables.len());

        let mut n_events: Option<usize> = None;
        for obs in &observables {
            let (lo, hi) = obs.bounds;
            if lo.is_nan() || hi.is_nan() || lo >= hi {
                return Err(Error::Validation(format!(
                    "invalid bounds for observable '{}': expected low < high, got ({lo}, {hi})",
                    obs.name
                )));
            }
            if bounds.contains_key(&obs.name) {
                return Err(Error::Validation(format!(
                    "observable '{}' declared twice",
                    obs.name
                )));
            }
            let col = by_name.remove(&obs.name).ok_or_else(|| {
                Error::Validation(format!("missing observable column '{}'", obs.name))
            })?;
            let n = col.len();
            if let Some(ne) = n_events {
                if n != ne {
                    return Err(Error::Validation(format!(
                        "column length mismatch for '{}': expected {}, got {}",
                        obs.name, ne, n
                    )));
                }
            } else {
                n_events = Some(n);
            }
            if col.iter().any(|x| !x.is_finite()) {
                return Err(Error::Validation(format!(
                    "observable '{}' contains non-finite values",
                    obs.name
                )));
            }
            if col.iter().any(|&x| x < lo || x > hi) {
                return Err(Error::Validation(format!(
                    "observable '{}' contains values outside bounds ({lo}, {hi})",
                    obs.name
                )));
            }
            column_names.push(obs.name.clone());
            cols.push(col);
            bounds.insert(obs.name.clone(), obs.bounds);
        }

        let name_to_index =
            column_names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect::<HashMap<_, _>>();

        Ok(Self { n_events: n_events.unwrap_or(0), column_names, columns: cols, name_to_index, bounds })
    }

    /// Concatenate stores row-wise. All stores must carry the same observables and bounds.
    pub fn concat(stores: &[EventStore]) -> Result<Self> {
        let first = stores
            .first()
            .ok_or_else(|| Error::Validation("EventStore::concat requires at least one store".into()))?;
        let specs = first.observable_specs();
        let mut merged: Vec<Vec<f64>> =
            specs.iter().map(|_| Vec::with_capacity(stores.iter().map(|s| s.n_events).sum())).collect();
        for (k, store) in stores.iter().enumerate() {
            if store.observable_specs() != specs {
                return Err(Error::Validation(format!(
                    "EventStore::concat: store {k} has observables {:?}, expected {:?}",
                    store.column_names, first.column_names
                )));
            }
            for (dst, src) in merged.iter_mut().zip(&store.columns) {
                dst.extend_from_slice(src);
            }
        }
        let names = specs.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
        Self::from_columns(specs, names.into_iter().zip(merged))
    }

    /// Rows selected by index, in the given order.
    pub fn select(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.n_events) {
            return Err(Error::Validation(format!(
                "EventStore::select: row {bad} out of range ({} events)",
                self.n_events
            )));
        }
        let cols = self
            .column_names
            .iter()
            .zip(&self.columns)
            .map(|(name, col)| (name.clone(), rows.iter().map(|&r| col[r]).collect::<Vec<_>>()));
        Self::from_columns(self.observable_specs(), cols)
    }

    /// Observable specs in column order.
    pub fn observable_specs(&self) -> Vec<ObservableSpec> {
        self.column_names
            .iter()
            .map(|n| ObservableSpec::branch(n.clone(), self.bounds[n]))
            .collect()
    }

    /// Number of events.
    pub fn n_events(&self) -> usize {
        self.n_events
    }

    /// Names of stored columns (stable order).
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        let idx = self.name_to_index.get(name).copied()?;
        self.columns.get(idx).map(|c| c.as_slice())
    }

    /// Get a column by name or fail with a message naming it.
    pub fn require_column(&self, name: &str) -> Result<&[f64]> {
        self.column(name).ok_or_else(|| Error::Validation(format!("missing column '{name}'")))
    }

    /// Bounds for an observable, if defined.
    pub fn bounds(&self, name: &str) -> Option<(f64, f64)> {
        self.bounds.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_column_store(t: Vec<f64>, q: Vec<f64>) -> EventStore {
        EventStore::from_columns(
            vec![ObservableSpec::branch("t", (0.0, 15.0)), ObservableSpec::branch("q", (-1.0, 1.0))],
            vec![("t".to_string(), t), ("q".to_string(), q)],
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_out_of_bounds_values() {
        let err = EventStore::from_columns(
            vec![ObservableSpec::branch("t", (0.0, 15.0))],
            vec![("t".to_string(), vec![1.0, 16.0])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("outside bounds"));
    }

    #[test]
    fn test_concat_and_select_preserve_rows() {
        let a = two_column_store(vec![1.0, 2.0], vec![1.0, -1.0]);
        let b = two_column_store(vec![3.0], vec![0.0]);
        let merged = EventStore::concat(&[a, b]).unwrap();
        assert_eq!(merged.n_events(), 3);
        assert_eq!(merged.column("t").unwrap(), &[1.0, 2.0, 3.0]);

        let picked = merged.select(&[2, 0]).unwrap();
        assert_eq!(picked.column("q").unwrap(), &[0.0, 1.0]);
        assert_eq!(picked.bounds("t"), Some((0.0, 15.0)));
    }

    #[test]
    fn test_concat_rejects_mismatched_observables() {
        let a = two_column_store(vec![1.0], vec![1.0]);
        let b = EventStore::from_columns(
            vec![ObservableSpec::branch("t", (0.0, 15.0))],
            vec![("t".to_string(), vec![2.0])],
        )
        .unwrap();
        assert!(EventStore::concat(&[a, b]).is_err());
    }
}
