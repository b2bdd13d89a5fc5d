//! # Built-in workers: in-process collectors constructed by kind tag.
//!
//! [`BuiltinRegistry`] maps a kind tag (`"noop"`, `"mysql_perfschema"`, …) to a
//! constructor. The supervisor renders the DSN, builds a [`BuiltinContext`] and
//! asks the registry for a boxed [`Worker`].
//!
//! ```text
//! BuiltinParams{kind, dsn, ..} ──► render dsn ──► BuiltinContext ──► registry[kind](ctx) ──► Box<dyn Worker>
//!                                                                          │
//!                                                      unknown kind ──► SupervisorError::UnknownKind
//! ```

mod collector;
mod noop;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::SupervisorError;
use crate::logs::LogBuffer;
use crate::policies::BackoffPolicy;
use crate::workers::Worker;

pub use collector::CollectorFn;
pub use noop::Noop;

/// Desired parameters of a built-in worker, compared structurally before rendering.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BuiltinParams {
    /// Kind tag; selects the constructor.
    pub kind: String,
    /// Connection string template.
    pub dsn: String,
    /// Text file name → body template (TLS material and the like).
    pub text_files: BTreeMap<String, String>,
    /// Free-form kind-specific options.
    pub options: BTreeMap<String, String>,
}

/// Everything a built-in constructor gets.
#[derive(Clone, Debug)]
pub struct BuiltinContext {
    /// Worker ID.
    pub id: String,
    /// Parameters as requested.
    pub params: BuiltinParams,
    /// DSN after rendering.
    pub dsn: String,
    /// Per-worker log buffer, retrievable through the supervisor.
    pub logs: LogBuffer,
    /// Restart pacing for collectors that fail.
    pub backoff: BackoffPolicy,
}

type Constructor =
    Arc<dyn Fn(BuiltinContext) -> Result<Box<dyn Worker>, SupervisorError> + Send + Sync>;

/// Kind tag → constructor table.
#[derive(Clone)]
pub struct BuiltinRegistry {
    ctors: HashMap<String, Constructor>,
}

impl BuiltinRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Registers (or replaces) the constructor for `kind`.
    pub fn register<F>(mut self, kind: impl Into<String>, ctor: F) -> Self
    where
        F: Fn(BuiltinContext) -> Result<Box<dyn Worker>, SupervisorError> + Send + Sync + 'static,
    {
        self.ctors.insert(kind.into(), Arc::new(ctor));
        self
    }

    /// Constructs the worker for `ctx.params.kind`.
    pub fn build(&self, ctx: BuiltinContext) -> Result<Box<dyn Worker>, SupervisorError> {
        match self.ctors.get(&ctx.params.kind) {
            Some(ctor) => ctor(ctx),
            None => Err(SupervisorError::UnknownKind {
                kind: ctx.params.kind,
            }),
        }
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for BuiltinRegistry {
    /// A registry with `noop` registered.
    fn default() -> Self {
        Self::empty().register(Noop::KIND, |ctx| Ok(Box::new(Noop::from_context(&ctx)) as Box<dyn Worker>))
    }
}

impl std::fmt::Debug for BuiltinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(kind: &str) -> BuiltinContext {
        BuiltinContext {
            id: "b1".into(),
            params: BuiltinParams {
                kind: kind.into(),
                ..BuiltinParams::default()
            },
            dsn: String::new(),
            logs: LogBuffer::new(10, &[] as &[&str], false),
            backoff: BackoffPolicy::default(),
        }
    }

    #[test]
    fn test_default_registry_has_noop() {
        let r = BuiltinRegistry::default();
        assert_eq!(r.kinds(), vec!["noop"]);
        assert!(r.build(ctx("noop")).is_ok());
    }

    #[test]
    fn test_unknown_kind() {
        let r = BuiltinRegistry::default();
        match r.build(ctx("mysql_perfschema")) {
            Err(SupervisorError::UnknownKind { kind }) => assert_eq!(kind, "mysql_perfschema"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("unknown kind must not build"),
        }
    }
}
