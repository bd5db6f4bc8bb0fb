use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_CONFIG_NAME: &str = "voicemap.toml";
const CONFIG_ENV: &str = "VOICEMAP_CONFIG";

/// Output root (`path`) and corpus root (`data_path`) of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectPaths {
    pub path: PathBuf,
    pub data_path: PathBuf,
}

impl Default for ProjectPaths {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            data_path: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProjectPathsFile {
    path: Option<String>,
    data_path: Option<String>,
}

impl ProjectPaths {
    /// Resolve from `explicit`, then `$VOICEMAP_CONFIG`, then `voicemap.toml`.
    ///
    /// An explicitly named file must exist and parse; the fallbacks quietly
    /// give way to the defaults when absent.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_path(Path::new(&path));
        }
        let default = Path::new(DEFAULT_CONFIG_NAME);
        if default.exists() {
            return Self::from_path(default);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading paths config {}", path.display()))?;
        let file: ProjectPathsFile = toml::from_str(&raw)
            .with_context(|| format!("parsing paths config {}", path.display()))?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: ProjectPathsFile) -> Self {
        let defaults = Self::default();
        Self {
            path: file.path.map(|v| expand_path(&v)).unwrap_or(defaults.path),
            data_path: file
                .data_path
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.data_path),
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.path.join("models")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.path.join("logs")
    }

    pub fn setup_dirs(&self) -> anyhow::Result<()> {
        for dir in [self.models_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    /// Weights file; always ends in `.bin` so the recorder keeps the full name.
    pub fn checkpoint_path(&self, param_str: &str) -> PathBuf {
        self.models_dir()
            .join(format!("classifier_{param_str}.bin"))
    }

    pub fn sidecar_path(&self, param_str: &str) -> PathBuf {
        sidecar_for(&self.checkpoint_path(param_str))
    }

    pub fn log_path(&self, param_str: &str) -> PathBuf {
        self.logs_dir().join(format!("classifier_{param_str}.csv"))
    }
}

/// `<checkpoint>.json`, replacing a trailing `.bin`.
///
/// Built by string so the dots inside parameter strings survive.
pub fn sidecar_for(checkpoint: &Path) -> PathBuf {
    let raw = checkpoint.to_string_lossy();
    let stem = raw.strip_suffix(".bin").unwrap_or(&raw);
    PathBuf::from(format!("{stem}.json"))
}

fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

/// Substitute `${VAR}`; unknown variables are left as written.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&format!("${{{key}}}")),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_keep_dots() {
        let paths = ProjectPaths {
            path: PathBuf::from("/runs"),
            data_path: PathBuf::from("/data"),
        };
        let p = "model=resnet__lr=0.01__window_hop=0.01";
        assert_eq!(
            paths.checkpoint_path(p),
            PathBuf::from("/runs/models/classifier_model=resnet__lr=0.01__window_hop=0.01.bin")
        );
        assert_eq!(
            paths.sidecar_path(p),
            PathBuf::from("/runs/models/classifier_model=resnet__lr=0.01__window_hop=0.01.json")
        );
        assert_eq!(
            paths.log_path(p),
            PathBuf::from("/runs/logs/classifier_model=resnet__lr=0.01__window_hop=0.01.csv")
        );
    }

    #[test]
    fn expands_known_variables_only() {
        std::env::set_var("VOICEMAP_TEST_ROOT", "/srv/audio");
        assert_eq!(expand_env("${VOICEMAP_TEST_ROOT}/sitw"), "/srv/audio/sitw");
        assert_eq!(
            expand_env("${VOICEMAP_SURELY_UNSET}/x"),
            "${VOICEMAP_SURELY_UNSET}/x"
        );
        assert_eq!(expand_env("plain/${unterminated"), "plain/${unterminated");
    }
}
