//! Remote interpreter flavours
//!
//! A runtime knows how to read a function's source (entry point, `global`
//! statements, imports), how to render a self-contained script around it,
//! and how to check for and install a dependency on the host.

use std::collections::BTreeMap;

use offload_exec::traits::quote;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OffloadError;

/// A package the function needs on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Name probed on the host (Python module, or shell command)
    pub module: String,
    /// Name handed to the installer
    pub package: String,
}

impl Dependency {
    /// Dependency whose package name equals its module name
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            module: name.clone(),
            package: name,
        }
    }

    /// Dependency installed under a different package name
    pub fn new(module: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            package: package.into(),
        }
    }
}

/// Interpreter that runs units on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Runtime {
    /// Python 3; dependencies installed with pip
    Python {
        #[serde(default = "default_python")]
        interpreter: String,
    },
    /// POSIX shell; dependencies are commands installed with apt
    Shell {
        #[serde(default = "default_shell")]
        interpreter: String,
    },
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for Runtime {
    fn default() -> Self {
        Self::python()
    }
}

impl Runtime {
    #[must_use]
    pub fn python() -> Self {
        Runtime::Python {
            interpreter: default_python(),
        }
    }

    #[must_use]
    pub fn shell() -> Self {
        Runtime::Shell {
            interpreter: default_shell(),
        }
    }

    /// Interpreter command line, inserted verbatim into shell commands
    #[must_use]
    pub fn interpreter(&self) -> &str {
        match self {
            Runtime::Python { interpreter } | Runtime::Shell { interpreter } => interpreter,
        }
    }

    /// File extension of rendered units
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Runtime::Python { .. } => "py",
            Runtime::Shell { .. } => "sh",
        }
    }

    /// Names of the top-level functions `source` defines, in order
    #[must_use]
    pub fn definitions(&self, source: &str) -> Vec<String> {
        match self {
            Runtime::Python { .. } => source
                .lines()
                .filter_map(|line| {
                    let rest = line.strip_prefix("def ")?;
                    let name = rest.split('(').next()?.trim();
                    is_identifier(name).then(|| name.to_string())
                })
                .collect(),
            Runtime::Shell { .. } => source.lines().filter_map(shell_function_name).collect(),
        }
    }

    /// Names the source declares as globals
    ///
    /// Python `global a, b` statements; shells have no such declaration.
    #[must_use]
    pub fn declared_globals(&self, source: &str) -> Vec<String> {
        match self {
            Runtime::Python { .. } => {
                let mut names = Vec::new();
                for line in source.lines() {
                    let Some(rest) = line.trim_start().strip_prefix("global ") else {
                        continue;
                    };
                    for name in rest.split(',').map(str::trim) {
                        if is_identifier(name) && !names.iter().any(|n| n == name) {
                            names.push(name.to_string());
                        }
                    }
                }
                names
            }
            Runtime::Shell { .. } => Vec::new(),
        }
    }

    /// Dependencies inferred from the source's own imports
    #[must_use]
    pub fn infer_dependencies(&self, source: &str) -> Vec<Dependency> {
        let Runtime::Python { .. } = self else {
            return Vec::new();
        };

        let mut modules: Vec<String> = Vec::new();
        let mut add = |module: &str| {
            let top = module.split('.').next().unwrap_or_default().trim();
            if is_identifier(top) && top != "__future__" && !modules.iter().any(|m| m == top) {
                modules.push(top.to_string());
            }
        };

        for line in source.lines().map(str::trim_start) {
            if let Some(rest) = line.strip_prefix("import ") {
                for part in rest.split(',') {
                    if let Some(module) = part.split_whitespace().next() {
                        add(module);
                    }
                }
            } else if let Some(rest) = line.strip_prefix("from ") {
                if let Some(module) = rest.split_whitespace().next()
                    && !module.starts_with('.')
                {
                    add(module);
                }
            }
        }

        modules.into_iter().map(Dependency::named).collect()
    }

    /// Render a standalone script that runs `entry` with `args` and prints
    /// `marker` followed by the JSON-encoded return value as its last line
    ///
    /// # Errors
    /// `OffloadError::Marshal` if a global name is not a valid identifier or
    /// a value cannot be embedded.
    pub fn render(
        &self,
        source: &str,
        entry: &str,
        globals: &BTreeMap<String, Value>,
        args: &[Value],
        marker: &str,
    ) -> Result<String, OffloadError> {
        self.render_with_helpers(&[], source, entry, globals, args, marker)
    }

    /// [`Runtime::render`], with `helpers` defined ahead of the function
    ///
    /// # Errors
    /// As [`Runtime::render`]
    pub fn render_with_helpers(
        &self,
        helpers: &[String],
        source: &str,
        entry: &str,
        globals: &BTreeMap<String, Value>,
        args: &[Value],
        marker: &str,
    ) -> Result<String, OffloadError> {
        if let Some(name) = globals.keys().find(|name| !is_identifier(name)) {
            return Err(OffloadError::Marshal(format!(
                "global {name:?} is not a valid identifier"
            )));
        }

        let mut body = String::new();
        for helper in helpers {
            body.push_str(dedent(helper).trim_end());
            body.push_str("\n\n");
        }
        body.push_str(&dedent(source));

        match self {
            Runtime::Python { .. } => render_python(&body, entry, globals, args, marker),
            Runtime::Shell { .. } => render_shell(&body, entry, globals, args, marker),
        }
    }

    /// Command that exits 0 when `dependency` is already present
    ///
    /// # Errors
    /// `OffloadError::Config` if the name cannot be shell-quoted
    pub fn dependency_probe(&self, dependency: &Dependency) -> Result<String, OffloadError> {
        Ok(match self {
            Runtime::Python { interpreter } => format!(
                "{interpreter} -c {}",
                quote(&format!("import {}", dependency.module))?
            ),
            Runtime::Shell { .. } => {
                format!("command -v {} >/dev/null 2>&1", quote(&dependency.module)?)
            }
        })
    }

    /// Command that installs `dependency`
    ///
    /// # Errors
    /// `OffloadError::Config` if the name cannot be shell-quoted
    pub fn dependency_install(&self, dependency: &Dependency) -> Result<String, OffloadError> {
        let package = quote(&dependency.package)?;
        Ok(match self {
            Runtime::Python { interpreter } => {
                format!("{interpreter} -m pip install --user --quiet {package}")
            }
            Runtime::Shell { .. } => format!(
                "if [ \"$(id -u)\" -eq 0 ]; then apt-get install -y -qq {package}; \
                 else sudo -n apt-get install -y -qq {package}; fi"
            ),
        })
    }

    /// Command that replaces the calling shell with the interpreter
    #[must_use]
    pub fn launch(&self, script: &str) -> String {
        match self {
            // Unbuffered, otherwise output only shows up when the pipe fills
            Runtime::Python { interpreter } => {
                format!("export PYTHONUNBUFFERED=1; exec {interpreter} {script}")
            }
            Runtime::Shell { interpreter } => format!("exec {interpreter} {script}"),
        }
    }
}

fn render_python(
    body: &str,
    entry: &str,
    globals: &BTreeMap<String, Value>,
    args: &[Value],
    marker: &str,
) -> Result<String, OffloadError> {
    let mut script = String::from("import json as _offload_json\nimport sys as _offload_sys\n\n");

    for (name, value) in globals {
        script.push_str(&format!(
            "{name} = _offload_json.loads({})\n",
            python_literal(value)?
        ));
    }

    script.push('\n');
    script.push_str(body.trim_end());
    script.push_str("\n\n");
    script.push_str(&format!(
        "_offload_result = {entry}(*_offload_json.loads({}))\n",
        python_literal(&Value::Array(args.to_vec()))?
    ));
    script.push_str("_offload_sys.stdout.flush()\n_offload_sys.stderr.flush()\n");
    script.push_str(&format!(
        "print({} + \" \" + _offload_json.dumps(_offload_result), flush=True)\n",
        string_literal(marker)?
    ));

    Ok(script)
}

fn render_shell(
    body: &str,
    entry: &str,
    globals: &BTreeMap<String, Value>,
    args: &[Value],
    marker: &str,
) -> Result<String, OffloadError> {
    let mut script = format!("OFFLOAD_MARKER={}\n", quote(marker)?);
    script.push_str(
        "offload_return() {\n    printf '%s %s\\n' \"$OFFLOAD_MARKER\" \"${1:-null}\"\n    exit 0\n}\n",
    );

    for (name, value) in globals {
        script.push_str(&format!("{name}={}\n", quote(&shell_word(value))?));
    }

    script.push('\n');
    script.push_str(body.trim_end());
    script.push_str("\n\n");

    let mut call = entry.to_string();
    for arg in args {
        call.push(' ');
        call.push_str(&quote(&shell_word(arg))?);
    }
    script.push_str(&call);
    script.push_str(
        "\noffload_status=$?\n[ \"$offload_status\" -eq 0 ] || exit \"$offload_status\"\noffload_return null\n",
    );

    Ok(script)
}

/// Strings travel raw, everything else as JSON text
fn shell_word(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON text of `value`, as a Python string literal
fn python_literal(value: &Value) -> Result<String, OffloadError> {
    string_literal(&value.to_string())
}

/// JSON string escapes are a subset of Python's
fn string_literal(text: &str) -> Result<String, OffloadError> {
    serde_json::to_string(text).map_err(|e| OffloadError::Marshal(e.to_string()))
}

fn shell_function_name(line: &str) -> Option<String> {
    let (rest, keyword) = match line.strip_prefix("function ") {
        Some(rest) => (rest.trim_start(), true),
        None => (line, false),
    };
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let (name, tail) = rest.split_at(end);
    let tail = tail.trim_start();

    let defines = tail.starts_with("()") || (keyword && (tail.is_empty() || tail.starts_with('{')));
    (is_identifier(name) && defines).then(|| name.to_string())
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether `name` occurs as a whole identifier token in `source`
pub(crate) fn mentions(source: &str, name: &str) -> bool {
    source
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token == name)
}

/// Strip the indentation common to all non-blank lines
pub(crate) fn dedent(source: &str) -> String {
    let indent = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    source
        .lines()
        .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET_INFO: &str = r#"
        def get_info(url):
            import socket
            import requests, json
            from urllib.parse import urlparse
            from . import sibling
            global i
            return [socket.gethostname(), i]
    "#;

    #[test]
    fn test_python_definitions() {
        let source = dedent(GET_INFO);
        assert_eq!(Runtime::python().definitions(&source), vec!["get_info"]);

        let nested = "def double(x):\n    return 2 * x\n\ndef compute(x):\n    def inner():\n        pass\n    return double(x) + 1\n";
        assert_eq!(Runtime::python().definitions(nested), vec!["double", "compute"]);
    }

    #[test]
    fn test_shell_definitions() {
        let shell = Runtime::shell();
        assert_eq!(shell.definitions("greet() {\n  echo hi\n}"), vec!["greet"]);
        assert_eq!(
            shell.definitions("function greet {\n  echo hi\n}\nbye() { :; }"),
            vec!["greet", "bye"]
        );
        assert!(shell.definitions("echo not a function").is_empty());
    }

    #[test]
    fn test_python_inferred_dependencies() {
        let deps = Runtime::python().infer_dependencies(GET_INFO);
        let modules: Vec<_> = deps.iter().map(|d| d.module.as_str()).collect();

        assert_eq!(modules, vec!["socket", "requests", "json", "urllib"]);
    }

    #[test]
    fn test_python_global_statements() {
        let source = "def f():\n    global i, j\n    global k\n    return i + j + k";
        assert_eq!(Runtime::python().declared_globals(source), vec!["i", "j", "k"]);
        assert!(Runtime::shell().declared_globals(source).is_empty());
    }

    #[test]
    fn test_render_python() {
        let mut globals = BTreeMap::new();
        globals.insert("i".to_string(), serde_json::json!(1_234_567_890));

        let script = Runtime::python()
            .render(
                GET_INFO,
                "get_info",
                &globals,
                &[serde_json::json!("http://ip-api.com/json/")],
                "@@result-1",
            )
            .unwrap();

        assert!(script.contains("i = _offload_json.loads(\"1234567890\")\n"));
        assert!(script.contains("\ndef get_info(url):\n    import socket\n"));
        assert!(script.contains(
            "_offload_result = get_info(*_offload_json.loads(\"[\\\"http://ip-api.com/json/\\\"]\"))"
        ));
        assert!(script.trim_end().ends_with(
            "print(\"@@result-1\" + \" \" + _offload_json.dumps(_offload_result), flush=True)"
        ));
    }

    #[test]
    fn test_render_shell() {
        let mut globals = BTreeMap::new();
        globals.insert("greeting".to_string(), serde_json::json!("hello world"));

        let script = Runtime::shell()
            .render(
                "say() {\n  echo \"$greeting $1\"\n}",
                "say",
                &globals,
                &[serde_json::json!("pi"), serde_json::json!(3)],
                "@@result-2",
            )
            .unwrap();

        assert!(script.starts_with("OFFLOAD_MARKER="));
        let assignment = script
            .lines()
            .find(|line| line.starts_with("greeting="))
            .unwrap();
        assert!(assignment.contains("hello world"));
        assert!(script.contains("\nsay pi 3\n"));
        assert!(script.trim_end().ends_with("offload_return null"));
    }

    #[test]
    fn test_render_places_helpers_before_function() {
        let helpers = vec!["    shout() {\n      echo \"$1!\"\n    }".to_string()];
        let script = Runtime::shell()
            .render_with_helpers(&helpers, "greet() { shout hi; }", "greet", &BTreeMap::new(), &[], "m")
            .unwrap();

        let helper_at = script.find("shout() {\n  echo").unwrap();
        let function_at = script.find("greet() {").unwrap();
        assert!(helper_at < function_at);
    }

    #[test]
    fn test_render_rejects_bad_global_name() {
        let mut globals = BTreeMap::new();
        globals.insert("not-valid".to_string(), Value::Null);

        let result = Runtime::shell().render("f() { :; }", "f", &globals, &[], "m");
        assert!(matches!(result, Err(OffloadError::Marshal(_))));
    }

    #[test]
    fn test_dependency_commands() {
        let dep = Dependency::new("yaml", "PyYAML");
        let python = Runtime::python();

        let probe = python.dependency_probe(&dep).unwrap();
        assert!(probe.starts_with("python3 -c "));
        assert!(probe.contains("import yaml"));
        assert_eq!(
            python.dependency_install(&dep).unwrap(),
            "python3 -m pip install --user --quiet PyYAML"
        );
        assert_eq!(
            Runtime::shell()
                .dependency_probe(&Dependency::named("curl"))
                .unwrap(),
            "command -v curl >/dev/null 2>&1"
        );
    }

    #[test]
    fn test_mentions_whole_tokens() {
        assert!(mentions("print(i)", "i"));
        assert!(mentions("echo \"$count\"", "count"));
        assert!(!mentions("print(index)", "i"));
    }

    #[test]
    fn test_runtime_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            runtime: Runtime,
        }

        let parsed: Wrapper = toml::from_str("[runtime]\nkind = \"shell\"\n").unwrap();
        assert_eq!(parsed.runtime, Runtime::shell());

        let parsed: Wrapper =
            toml::from_str("[runtime]\nkind = \"python\"\ninterpreter = \"python3.11\"\n").unwrap();
        assert_eq!(parsed.runtime.interpreter(), "python3.11");
    }
}
