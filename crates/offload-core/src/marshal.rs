//! Function marshalling
//!
//! Turns a registered function and one call's arguments into a
//! [`RemoteUnit`]: a rendered script that needs nothing from the caller's
//! process to run.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::OffloadError;
use crate::runtime::{Dependency, Runtime, dedent, is_identifier, mentions};

/// What is known about a registered function before any call
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    id: String,
    runtime: Runtime,
    source: String,
    entry: String,
    globals: Vec<String>,
    dependencies: Vec<Dependency>,
}

impl FunctionSpec {
    /// Analyse `source` once at registration
    ///
    /// The unit calls the function named `id`. `declared` names the
    /// globals the function may read; for Python, names in `global`
    /// statements are added. Only names that occur in the source are kept.
    /// Explicit `requires` entries take precedence over imports found in
    /// the source.
    ///
    /// # Errors
    /// `OffloadError::Marshal` if the source does not define `id`, or a
    /// declared name is not a valid identifier.
    pub fn new(
        id: impl Into<String>,
        runtime: Runtime,
        source: impl Into<String>,
        declared: &[String],
        requires: &[Dependency],
    ) -> Result<Self, OffloadError> {
        let id = id.into();
        let entry = id.clone();
        Self::with_entry(id, entry, runtime, source, declared, requires)
    }

    /// Like [`FunctionSpec::new`], calling `entry` instead of `id`
    ///
    /// # Errors
    /// As [`FunctionSpec::new`]
    pub fn with_entry(
        id: impl Into<String>,
        entry: impl Into<String>,
        runtime: Runtime,
        source: impl Into<String>,
        declared: &[String],
        requires: &[Dependency],
    ) -> Result<Self, OffloadError> {
        let id = id.into();
        let entry = entry.into();
        let source: String = source.into();
        let source = dedent(&source);

        let defined = runtime.definitions(&source);
        if defined.is_empty() {
            return Err(OffloadError::Marshal(format!(
                "{id}: source does not define a function"
            )));
        }
        if !defined.contains(&entry) {
            return Err(OffloadError::Marshal(format!(
                "{id}: source does not define {entry:?} (found {})",
                defined.join(", ")
            )));
        }

        let mut globals: Vec<String> = Vec::new();
        for name in declared.iter().chain(runtime.declared_globals(&source).iter()) {
            if !is_identifier(name) {
                return Err(OffloadError::Marshal(format!(
                    "{id}: global {name:?} is not a valid identifier"
                )));
            }
            if mentions(&source, name) && !globals.contains(name) {
                globals.push(name.clone());
            }
        }

        let mut dependencies = requires.to_vec();
        for inferred in runtime.infer_dependencies(&source) {
            if !dependencies.iter().any(|d| d.module == inferred.module) {
                dependencies.push(inferred);
            }
        }

        Ok(Self {
            id,
            runtime,
            source,
            entry,
            globals,
            dependencies,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Name of the function the unit calls
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Globals captured on every call
    #[must_use]
    pub fn globals(&self) -> &[String] {
        &self.globals
    }

    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }
}

/// Self-contained representation of one call
///
/// Immutable once built, dropped when the call ends.
#[derive(Debug, Clone)]
pub struct RemoteUnit {
    id: Uuid,
    function: String,
    runtime: Runtime,
    script: String,
    args: Vec<Value>,
    globals: BTreeMap<String, Value>,
    dependencies: Vec<Dependency>,
    marker: String,
}

impl RemoteUnit {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identifier of the function this unit calls
    #[must_use]
    pub fn function(&self) -> &str {
        &self.function
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Rendered script
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Argument snapshot
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Global snapshot, taken at call time
    #[must_use]
    pub fn globals(&self) -> &BTreeMap<String, Value> {
        &self.globals
    }

    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Prefix of the line carrying the return value
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// File name of the unit on the host
    #[must_use]
    pub fn file_name(&self) -> String {
        let stem: String = self
            .function
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        format!("{stem}-{}.{}", self.id, self.runtime.extension())
    }
}

/// Builds [`RemoteUnit`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct Marshaller;

impl Marshaller {
    /// Snapshot `args` and the globals `spec` references
    ///
    /// A JSON array is the positional argument list, `null` (the encoding
    /// of `()`) is no arguments, and any other value is a single argument.
    ///
    /// # Errors
    /// `OffloadError::Marshal` if a referenced global has no value or the
    /// script cannot be rendered.
    pub fn marshal(
        &self,
        spec: &FunctionSpec,
        args: Value,
        globals: &BTreeMap<String, Value>,
    ) -> Result<RemoteUnit, OffloadError> {
        self.marshal_with_helpers(spec, args, globals, &[])
    }

    /// [`Marshaller::marshal`], with shared `helpers` rendered ahead of
    /// the function
    ///
    /// Imports in the helpers add to the unit's dependencies.
    ///
    /// # Errors
    /// As [`Marshaller::marshal`]
    pub fn marshal_with_helpers(
        &self,
        spec: &FunctionSpec,
        args: Value,
        globals: &BTreeMap<String, Value>,
        helpers: &[String],
    ) -> Result<RemoteUnit, OffloadError> {
        let args = match args {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };

        let mut captured = BTreeMap::new();
        for name in spec.globals() {
            let value = globals.get(name).ok_or_else(|| {
                OffloadError::Marshal(format!(
                    "{}: global {name:?} is referenced but not defined",
                    spec.id()
                ))
            })?;
            captured.insert(name.clone(), value.clone());
        }

        let id = Uuid::new_v4();
        let marker = format!("@@offload-result-{}", id.simple());
        let script = spec.runtime().render_with_helpers(
            helpers,
            &spec.source,
            spec.entry(),
            &captured,
            &args,
            &marker,
        )?;

        let mut dependencies = spec.dependencies().to_vec();
        for helper in helpers {
            for inferred in spec.runtime().infer_dependencies(helper) {
                if !dependencies.iter().any(|d| d.module == inferred.module) {
                    dependencies.push(inferred);
                }
            }
        }

        debug!(
            function = %spec.id(),
            job = %id,
            args = args.len(),
            globals = captured.len(),
            helpers = helpers.len(),
            "marshalled call"
        );

        Ok(RemoteUnit {
            id,
            function: spec.id().to_string(),
            runtime: spec.runtime().clone(),
            script,
            args,
            globals: captured,
            dependencies,
            marker,
        })
    }
}
