//! Environment snapshots taken by asking a Python interpreter about itself.

use std::process::Command;

use error_log_core::{EnvironmentSnapshot, ErrorLogError, ModuleSet, SnapshotProvider};
use serde::Deserialize;

/// Prints one JSON object with the interpreter version, platform string and
/// installed distributions. Distribution enumeration failures leave the
/// module map empty.
pub const PROBE_SCRIPT: &str = r#"
import json, platform, sys
modules = {}
try:
    from importlib import metadata
    for dist in metadata.distributions():
        name = dist.metadata["Name"]
        if name:
            modules[name] = dist.version
except Exception:
    modules = {}
print(json.dumps({
    "python_version": sys.version.split()[0],
    "platform": platform.platform(),
    "modules": modules,
}))
"#;

#[derive(Debug, Deserialize)]
struct ProbeReport {
    python_version: String,
    platform: Option<String>,
    #[serde(default)]
    modules: ModuleSet,
}

#[derive(Debug, Clone)]
pub struct PythonProbe {
    interpreter: String,
}

impl PythonProbe {
    #[must_use]
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl SnapshotProvider for PythonProbe {
    fn snapshot(&self) -> Result<EnvironmentSnapshot, ErrorLogError> {
        let output = Command::new(&self.interpreter)
            .args(["-c", PROBE_SCRIPT])
            .output()
            .map_err(|err| {
                ErrorLogError::Probe(format!("failed to run {}: {err}", self.interpreter))
            })?;

        if !output.status.success() {
            return Err(ErrorLogError::Probe(format!(
                "{} exited with {}: {}",
                self.interpreter,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let snapshot = parse_probe_output(&output.stdout)?;
        tracing::debug!(
            interpreter = %self.interpreter,
            python_version = %snapshot.python_version,
            module_count = snapshot.modules.len(),
            "probed environment"
        );
        Ok(snapshot)
    }
}

/// Decodes the probe script's stdout into a snapshot.
///
/// # Errors
/// Returns [`ErrorLogError::Probe`] when the output is not the expected JSON
/// object or carries a blank version.
pub fn parse_probe_output(stdout: &[u8]) -> Result<EnvironmentSnapshot, ErrorLogError> {
    let report: ProbeReport = serde_json::from_slice(stdout)
        .map_err(|err| ErrorLogError::Probe(format!("unreadable probe output: {err}")))?;

    let snapshot = EnvironmentSnapshot {
        python_version: report.python_version.trim().to_string(),
        platform: report.platform.filter(|value| !value.trim().is_empty()),
        modules: report.modules,
    };
    snapshot
        .validate()
        .map_err(|err| ErrorLogError::Probe(err.to_string()))?;
    Ok(snapshot)
}
