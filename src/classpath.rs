//! Jar discovery for the evaluator runtime.
//!
//! The bundled jars live in a home directory with two subdirectories:
//! `resources/` (the evaluator support jars) and `dependencies/` (their
//! transitive closure). The home is found by probing, in order: the
//! `JPMML_BRIDGE_HOME` environment variable, a `java/` directory next to the
//! running executable, and a `java/` directory under the crate manifest for
//! development checkouts. Entry order is fixed: resources first, then
//! dependencies, then user-supplied entries, each group sorted by file name.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::BridgeError;

/// Environment variable naming the jar home directory.
pub const HOME_ENV: &str = "JPMML_BRIDGE_HOME";

const RESOURCES_DIR: &str = "resources";
const DEPENDENCIES_DIR: &str = "dependencies";

/// Locate the jar home directory.
///
/// # Errors
///
/// Returns [`BridgeError::Classpath`] when no candidate directory exists,
/// listing every path that was probed.
pub fn resolve_home() -> Result<PathBuf, BridgeError> {
    let mut probed = Vec::new();

    if let Some(home) = env::var_os(HOME_ENV) {
        let home = PathBuf::from(home);
        if home.is_dir() {
            return Ok(home);
        }
        probed.push(format!("{HOME_ENV}={}", home.display()));
    }

    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let home = dir.join("java");
            if home.is_dir() {
                return Ok(home);
            }
            probed.push(home.display().to_string());
        }
    }

    let dev = Path::new(env!("CARGO_MANIFEST_DIR")).join("java");
    if dev.is_dir() {
        return Ok(dev);
    }
    probed.push(dev.display().to_string());

    Err(BridgeError::Classpath(format!(
        "no jar home found; probed: {}",
        probed.join(", ")
    )))
}

/// Bundled jars in fixed order: `resources/` first, then `dependencies/`.
///
/// # Errors
///
/// Returns an error when the home directory cannot be located or read.
pub fn package_classpath() -> Result<Vec<PathBuf>, BridgeError> {
    let home = resolve_home()?;
    let mut entries = jars_in(&home.join(RESOURCES_DIR))?;
    entries.extend(jars_in(&home.join(DEPENDENCIES_DIR))?);
    if entries.is_empty() {
        tracing::warn!(home = %home.display(), "jar home contains no jars");
    }
    Ok(entries)
}

/// Full classpath: bundled jars followed by user entries, in call order.
///
/// # Errors
///
/// Returns an error when the bundled jars cannot be located.
pub fn assemble(user_entries: &[PathBuf]) -> Result<Vec<PathBuf>, BridgeError> {
    let mut entries = package_classpath()?;
    entries.extend(user_entries.iter().cloned());
    Ok(entries)
}

/// Join entries with the platform path separator.
#[must_use]
pub fn join(entries: &[PathBuf]) -> String {
    let sep = if cfg!(windows) { ";" } else { ":" };
    entries
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

fn jars_in(dir: &Path) -> Result<Vec<PathBuf>, BridgeError> {
    if !dir.is_dir() {
        tracing::debug!(dir = %dir.display(), "jar directory absent, skipping");
        return Ok(Vec::new());
    }
    let mut jars = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        BridgeError::Classpath(format!("cannot read {}: {e}", dir.display()))
    })?;
    for entry in entries {
        let entry =
            entry.map_err(|e| BridgeError::Classpath(format!("cannot read {}: {e}", dir.display())))?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "jar") {
            jars.push(path);
        }
    }
    jars.sort();
    Ok(jars)
}
