//! # Step Script Builder
//!
//! Turns one step's code and dependency strings into a self-contained bash
//! script. The script installs dependencies, loads predecessor outputs from
//! the shared volume, runs the code through a small Python harness, and
//! atomically writes the step's own output under `<root>/<step_id>/`.
//!
//! Every failure exits non-zero (`set -euo pipefail`), and the output file
//! only appears after the code finished, via write-then-rename.

use crate::constants::volume;
use crate::error::{ValidationError, ValidationErrorKind};
use crate::models::{DependencySnapshot, Step};

const HARNESS_DELIMITER: &str = "FLOWRUN_HARNESS";
const REQUIREMENTS_PATH: &str = "/tmp/flowrun-requirements.txt";

const PYTHON_HARNESS: &str = r#"import json
import os
import types

_ROOT = __FLOWRUN_ROOT__
_STEP_ID = __FLOWRUN_STEP_ID__
_PREDECESSORS = __FLOWRUN_PREDECESSORS__
_OUTPUT_FILE = __FLOWRUN_OUTPUT_FILE__
_CODE = __FLOWRUN_CODE__

inputs = {}
for _pid in _PREDECESSORS:
    _path = os.path.join(_ROOT, _pid, _OUTPUT_FILE)
    if os.path.isfile(_path):
        with open(_path) as _fh:
            inputs[_pid] = json.load(_fh)
    else:
        inputs[_pid] = None

_namespace = {"__name__": "__main__"}
for _pid in _PREDECESSORS:
    _payload = inputs.get(_pid)
    if isinstance(_payload, dict):
        _namespace.update(_payload.get("variables") or {})
_namespace["inputs"] = inputs

exec(compile(_CODE, "<step " + _STEP_ID + ">", "exec"), _namespace)

_variables = {}
for _name, _value in list(_namespace.items()):
    if _name.startswith("_") or _name == "inputs":
        continue
    if isinstance(_value, types.ModuleType) or callable(_value):
        continue
    try:
        json.dumps(_value)
    except (TypeError, ValueError):
        continue
    _variables[_name] = _value

_out_dir = os.path.join(_ROOT, _STEP_ID)
os.makedirs(_out_dir, exist_ok=True)
_tmp = os.path.join(_out_dir, _OUTPUT_FILE + ".tmp")
with open(_tmp, "w") as _fh:
    json.dump({"output": _variables.get("output"), "variables": _variables}, _fh)
os.replace(_tmp, os.path.join(_out_dir, _OUTPUT_FILE))
"#;

/// Borrowed view of everything a script needs from a step or a task snapshot
#[derive(Debug, Clone, Copy)]
pub struct ScriptInput<'a> {
    pub step_id: &'a str,
    pub code: &'a str,
    pub package_dependencies: Option<&'a str>,
    pub requirements: Option<&'a str>,
    pub system_dependencies: Option<&'a str>,
}

impl<'a> From<&'a Step> for ScriptInput<'a> {
    fn from(step: &'a Step) -> Self {
        Self {
            step_id: &step.step_id,
            code: &step.code,
            package_dependencies: step.package_dependencies.as_deref(),
            requirements: step.requirements.as_deref(),
            system_dependencies: step.system_dependencies.as_deref(),
        }
    }
}

impl<'a> ScriptInput<'a> {
    pub fn from_snapshot(step_id: &'a str, snapshot: &'a DependencySnapshot) -> Self {
        Self {
            step_id,
            code: &snapshot.code,
            package_dependencies: snapshot.package_dependencies.as_deref(),
            requirements: snapshot.requirements.as_deref(),
            system_dependencies: snapshot.system_dependencies.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepScriptBuilder {
    shared_root: String,
}

impl Default for StepScriptBuilder {
    fn default() -> Self {
        Self::new(volume::SHARED_ROOT)
    }
}

impl StepScriptBuilder {
    pub fn new(shared_root: impl Into<String>) -> Self {
        Self {
            shared_root: shared_root.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn shared_root(&self) -> &str {
        &self.shared_root
    }

    /// Path a step writes its output to
    pub fn output_path(&self, step_id: &str) -> String {
        format!("{}/{}/{}", self.shared_root, step_id, volume::OUTPUT_FILE)
    }

    pub fn build(
        &self,
        input: &ScriptInput<'_>,
        predecessors: &[String],
    ) -> Result<String, ValidationError> {
        if input.code.trim().is_empty() {
            return Err(ValidationError::empty_code(&format!("step '{}'", input.step_id)));
        }
        if !is_valid_step_id(input.step_id) {
            return Err(ValidationError::new(
                ValidationErrorKind::InvalidStepId,
                format!("step id '{}' must match [A-Za-z0-9_-]+", input.step_id),
            ));
        }

        let mut script = String::from("#!/usr/bin/env bash\nset -euo pipefail\n\n");

        let system_packages = split_dependencies(input.system_dependencies);
        if !system_packages.is_empty() {
            let packages = quote_all(&system_packages);
            script.push_str("# system dependencies\n");
            script.push_str("if command -v apt-get >/dev/null 2>&1; then\n");
            script.push_str("  apt-get update -qq\n");
            script.push_str(&format!(
                "  DEBIAN_FRONTEND=noninteractive apt-get install -y -qq --no-install-recommends {packages}\n"
            ));
            script.push_str("elif command -v apk >/dev/null 2>&1; then\n");
            script.push_str(&format!("  apk add --no-cache {packages}\n"));
            script.push_str("else\n");
            script.push_str("  echo \"flowrun: no supported system package manager\" >&2\n");
            script.push_str("  exit 1\n");
            script.push_str("fi\n\n");
        }

        let pip = "python3 -m pip install --no-cache-dir --disable-pip-version-check";
        match input.requirements.map(str::trim).filter(|r| !r.is_empty()) {
            Some(requirements) => {
                script.push_str("# python dependencies (requirements file)\n");
                script.push_str(&format!(
                    "printf '%s\\n' {} > {REQUIREMENTS_PATH}\n",
                    shell_quote(requirements)
                ));
                script.push_str(&format!("{pip} -r {REQUIREMENTS_PATH}\n\n"));
            }
            None => {
                let packages = split_dependencies(input.package_dependencies);
                if !packages.is_empty() {
                    script.push_str("# python dependencies\n");
                    script.push_str(&format!("{pip} {}\n\n", quote_all(&packages)));
                }
            }
        }

        script.push_str(&format!(
            "mkdir -p {}\n",
            shell_quote(&format!("{}/{}", self.shared_root, input.step_id))
        ));
        script.push_str("harness=\"$(mktemp)\"\n");
        script.push_str(&format!("cat > \"$harness\" <<'{HARNESS_DELIMITER}'\n"));
        script.push_str(&self.harness(input, predecessors));
        script.push_str(&format!("{HARNESS_DELIMITER}\n"));
        script.push_str("python3 -u \"$harness\"\n");

        Ok(script)
    }

    fn harness(&self, input: &ScriptInput<'_>, predecessors: &[String]) -> String {
        // JSON string and array literals are valid Python literals and keep
        // user code on a single line inside the heredoc
        PYTHON_HARNESS
            .replace("__FLOWRUN_ROOT__", &python_literal(&self.shared_root))
            .replace("__FLOWRUN_STEP_ID__", &python_literal(input.step_id))
            .replace("__FLOWRUN_OUTPUT_FILE__", &python_literal(volume::OUTPUT_FILE))
            .replace(
                "__FLOWRUN_PREDECESSORS__",
                &serde_json::Value::from(predecessors.to_vec()).to_string(),
            )
            .replace("__FLOWRUN_CODE__", &python_literal(input.code))
    }
}

/// Step ids become directory names and template names, so they stay narrow.
pub fn is_valid_step_id(step_id: &str) -> bool {
    !step_id.is_empty()
        && step_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn split_dependencies(raw: Option<&str>) -> Vec<&str> {
    raw.unwrap_or_default()
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|dep| !dep.is_empty())
        .collect()
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_all(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| shell_quote(v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn python_literal(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}
