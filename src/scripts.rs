//! Script bundle: loads the 15 named Lua scripts from disk and registers
//! them with the store via `SCRIPT LOAD`, the same two-step dance the
//! teacher crate does at construction time — except the teacher embeds
//! its Lua with `include_str!` at compile time, while OmniQ resolves a
//! directory at runtime (spec §4.2) so operators can swap the bundle
//! without rebuilding.

use std::path::{Path, PathBuf};

use crate::config::SCRIPTS_DIR_ENV_VAR;
use crate::conn::StoreConnection;
use crate::error::{Error, Result};

/// Names of the 15 scripts the bundle loads, in load order. This is also
/// the set of operations the Ops layer exposes one-for-one.
pub const SCRIPT_NAMES: &[&str] = &[
    "enqueue",
    "reserve",
    "heartbeat",
    "ack_success",
    "ack_fail",
    "promote_delayed",
    "reap_expired",
    "pause",
    "resume",
    "retry_failed",
    "retry_failed_batch",
    "remove_job",
    "remove_jobs_batch",
    "childs_init",
    "child_ack",
];

/// A registered script: its Lua source plus the SHA1 digest the store
/// returned from `SCRIPT LOAD`.
#[derive(Clone, Debug)]
pub struct LoadedScript {
    pub name: &'static str,
    pub sha1: String,
    pub source: String,
}

/// All 15 scripts, indexed by name for the Ops layer to invoke.
#[derive(Clone, Debug)]
pub struct ScriptBundle {
    scripts: Vec<LoadedScript>,
}

impl ScriptBundle {
    /// Loads every script named in [`SCRIPT_NAMES`] from `dir`, registers
    /// each with `SCRIPT LOAD`, and returns the bundle. Fails with
    /// [`Error::Configuration`] if any file is missing or the directory
    /// does not resolve.
    pub async fn load(conn: &mut StoreConnection, dir: &Path) -> Result<Self> {
        let mut scripts = Vec::with_capacity(SCRIPT_NAMES.len());
        for name in SCRIPT_NAMES {
            let path = dir.join(format!("{name}.lua"));
            let source = std::fs::read_to_string(&path).map_err(|e| {
                Error::configuration(format!(
                    "missing script file {} ({e})",
                    path.display()
                ))
            })?;
            let sha1: String = conn
                .query_async(redis::cmd("SCRIPT").arg("LOAD").arg(&source))
                .await
                .map_err(Error::Transport)?;
            scripts.push(LoadedScript {
                name,
                sha1,
                source,
            });
        }
        Ok(ScriptBundle { scripts })
    }

    /// Look up a loaded script by name. Panics if `name` is not one of
    /// [`SCRIPT_NAMES`] — a programmer error in the Ops layer, not a
    /// runtime condition.
    pub fn get(&self, name: &str) -> &LoadedScript {
        self.scripts
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("unknown script {name}"))
    }

}

/// Resolves the scripts directory: `OMNIQ_SCRIPTS_DIR` if set, otherwise
/// walk upward from this crate's own source directory looking for
/// `dist/core/scripts`, per spec §4.2.
pub fn resolve_scripts_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(SCRIPTS_DIR_ENV_VAR) {
        let path = PathBuf::from(dir);
        if path.is_dir() {
            return Ok(path);
        }
        return Err(Error::configuration(format!(
            "{SCRIPTS_DIR_ENV_VAR} points at a non-existent directory: {}",
            path.display()
        )));
    }

    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let mut ancestor = Some(manifest_dir.as_path());
    while let Some(dir) = ancestor {
        let candidate = dir.join("dist").join("core").join("scripts");
        if candidate.is_dir() {
            return Ok(candidate);
        }
        ancestor = dir.parent();
    }

    Err(Error::configuration(
        "could not locate dist/core/scripts by walking up from the crate root; \
         set OMNIQ_SCRIPTS_DIR to override",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_scripts_dir_finds_shipped_bundle() {
        std::env::remove_var(SCRIPTS_DIR_ENV_VAR);
        let dir = resolve_scripts_dir().expect("bundled scripts dir should resolve");
        assert!(dir.ends_with("dist/core/scripts"));
        for name in SCRIPT_NAMES {
            assert!(
                dir.join(format!("{name}.lua")).is_file(),
                "missing {name}.lua in {}",
                dir.display()
            );
        }
    }

    #[test]
    fn env_override_wins() {
        let tmp = std::env::temp_dir().join("omniq-scripts-dir-test");
        std::fs::create_dir_all(&tmp).unwrap();
        std::env::set_var(SCRIPTS_DIR_ENV_VAR, &tmp);
        let resolved = resolve_scripts_dir().unwrap();
        assert_eq!(resolved, tmp);
        std::env::remove_var(SCRIPTS_DIR_ENV_VAR);
    }
}
