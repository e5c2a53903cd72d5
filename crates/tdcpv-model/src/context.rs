//! Build context: the registry of named parameters and built objects.
//!
//! Every builder receives `&mut BuildContext` and registers what it creates under a name. A
//! second request for an existing name returns the object already stored; it is never
//! overwritten. The same physical parameter (for example a resolution scale shared by several
//! processes) is therefore referenced, not duplicated.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tdcpv_core::{Error, Result};

/// Index of a parameter inside a [`BuildContext`] (and of its value in a parameter vector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// A named real parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Unique name.
    pub name: String,
    /// Current (initial / generation) value.
    pub value: f64,
    /// Allowed interval `(low, high)`.
    pub bounds: (f64, f64),
    /// Held fixed in fits.
    pub constant: bool,
}

type Object = Arc<dyn Any + Send + Sync>;

/// Accumulating registry of parameters and built objects.
#[derive(Default)]
pub struct BuildContext {
    params: Vec<Parameter>,
    param_index: HashMap<String, ParamId>,
    objects: HashMap<String, Object>,
    object_order: Vec<String>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("params", &self.params.len())
            .field("objects", &self.object_order)
            .finish()
    }
}

impl BuildContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the parameter called `name`, creating it with `value` and `bounds` if absent.
    ///
    /// An existing parameter keeps its value and bounds.
    pub fn get_or_create_param(
        &mut self,
        name: &str,
        value: f64,
        bounds: (f64, f64),
    ) -> Result<ParamId> {
        if let Some(&id) = self.param_index.get(name) {
            log::debug!("reusing parameter '{name}'");
            return Ok(id);
        }
        let (lo, hi) = bounds;
        if !value.is_finite() {
            return Err(Error::config(name, format!("value must be finite, got {value}")));
        }
        if lo.is_nan() || hi.is_nan() || lo > hi {
            return Err(Error::config(name, format!("invalid interval [{lo}, {hi}]")));
        }
        if value < lo || value > hi {
            return Err(Error::config(
                name,
                format!("value {value} outside its interval [{lo}, {hi}]"),
            ));
        }
        let id = ParamId(self.params.len());
        self.params.push(Parameter { name: name.to_string(), value, bounds, constant: false });
        self.param_index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Like [`Self::get_or_create_param`], but a newly created parameter is constant.
    pub fn get_or_create_constant(&mut self, name: &str, value: f64) -> Result<ParamId> {
        let existed = self.param_index.contains_key(name);
        let id = self.get_or_create_param(name, value, (value, value))?;
        if !existed {
            self.params[id.0].constant = true;
        }
        Ok(id)
    }

    /// Look up a parameter id by name.
    pub fn param_id(&self, name: &str) -> Option<ParamId> {
        self.param_index.get(name).copied()
    }

    /// Look up a parameter id by name or fail with a configuration error.
    pub fn require_param(&self, name: &str) -> Result<ParamId> {
        self.param_id(name)
            .ok_or_else(|| Error::config(name, "parameter is not defined".to_string()))
    }

    /// Parameter by id.
    pub fn param(&self, id: ParamId) -> &Parameter {
        &self.params[id.0]
    }

    /// All parameters in creation order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    /// Current values, indexed by [`ParamId`].
    pub fn values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    /// Mark parameters constant.
    ///
    /// A trailing `*` matches every parameter whose name starts with the prefix. A name (or
    /// prefix) matching nothing is a configuration error.
    pub fn set_constant(&mut self, pattern: &str) -> Result<usize> {
        let matched = match pattern.strip_suffix('*') {
            Some(prefix) => {
                let mut n = 0;
                for p in self.params.iter_mut().filter(|p| p.name.starts_with(prefix)) {
                    p.constant = true;
                    n += 1;
                }
                n
            }
            None => match self.param_index.get(pattern) {
                Some(&id) => {
                    self.params[id.0].constant = true;
                    1
                }
                None => 0,
            },
        };
        if matched == 0 {
            return Err(Error::config(
                "constant_params",
                format!("'{pattern}' does not name any parameter"),
            ));
        }
        Ok(matched)
    }

    /// Release a parameter so that it floats in fits.
    pub fn set_floating(&mut self, name: &str) -> Result<()> {
        let id = self
            .param_id(name)
            .ok_or_else(|| Error::config("floating_params", format!("'{name}' does not name any parameter")))?;
        self.params[id.0].constant = false;
        Ok(())
    }

    /// Overwrite the value of an existing parameter (e.g. with a fit result).
    pub fn set_value(&mut self, id: ParamId, value: f64) -> Result<()> {
        let p = &mut self.params[id.0];
        if !value.is_finite() {
            return Err(Error::Validation(format!("{}: non-finite value {value}", p.name)));
        }
        p.value = value;
        Ok(())
    }

    /// Return the object registered under `name`, building it with `factory` if absent.
    ///
    /// The factory receives the context so that it can register its own parameters. An
    /// existing object of a different type under the same name is a configuration error.
    pub fn get_or_create<T, F>(&mut self, name: &str, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&mut Self) -> Result<T>,
    {
        if let Some(existing) = self.objects.get(name) {
            log::debug!("reusing object '{name}'");
            return existing.clone().downcast::<T>().map_err(|_| {
                Error::config(
                    name,
                    format!(
                        "already registered with a different type (requested {})",
                        std::any::type_name::<T>()
                    ),
                )
            });
        }
        let built = Arc::new(factory(self)?);
        // The factory may itself have registered `name`; the first registration wins.
        if let Some(existing) = self.objects.get(name) {
            return existing.clone().downcast::<T>().map_err(|_| {
                Error::config(name, "registered twice with different types".to_string())
            });
        }
        self.objects.insert(name.to_string(), built.clone() as Object);
        self.object_order.push(name.to_string());
        Ok(built)
    }

    /// Object registered under `name`, if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.objects.get(name).and_then(|o| o.clone().downcast::<T>().ok())
    }

    /// Names of registered objects in registration order.
    pub fn object_names(&self) -> &[String] {
        &self.object_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_param_is_reused_not_overwritten() {
        let mut ctx = BuildContext::new();
        let a = ctx.get_or_create_param("scale", 1.15, (0.5, 2.0)).unwrap();
        let b = ctx.get_or_create_param("scale", 1.3, (0.0, 3.0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.param(a).value, 1.15);
        assert_eq!(ctx.param(a).bounds, (0.5, 2.0));
    }

    #[test]
    fn test_param_outside_interval_is_rejected() {
        let mut ctx = BuildContext::new();
        let err = ctx.get_or_create_param("signal_S", 5.0, (-4.0, 4.0)).unwrap_err();
        assert!(err.to_string().contains("signal_S"));
    }

    #[test]
    fn test_get_or_create_builds_once() {
        let mut ctx = BuildContext::new();
        let mut calls = 0;
        let first: Arc<Vec<f64>> = ctx
            .get_or_create("shared", |_| {
                calls += 1;
                Ok(vec![1.0])
            })
            .unwrap();
        let second: Arc<Vec<f64>> = ctx.get_or_create("shared", |_| Ok(vec![2.0])).unwrap();
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.object_names(), &["shared".to_string()]);
    }

    #[test]
    fn test_type_mismatch_is_config_error() {
        let mut ctx = BuildContext::new();
        let _: Arc<f64> = ctx.get_or_create("x", |_| Ok(1.0)).unwrap();
        let err = ctx.get_or_create::<String, _>("x", |_| Ok("y".into())).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_set_constant_prefix_and_unknown_name() {
        let mut ctx = BuildContext::new();
        ctx.get_or_create_param("os_p0", 0.4, (0.0, 0.5)).unwrap();
        ctx.get_or_create_param("os_p1", 1.0, (0.0, 2.0)).unwrap();
        ctx.get_or_create_param("signal_S", 0.0, (-4.0, 4.0)).unwrap();
        assert_eq!(ctx.set_constant("os_*").unwrap(), 2);
        assert!(!ctx.parameters()[2].constant);
        assert!(ctx.set_constant("missing").is_err());
    }
}
