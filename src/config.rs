use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level run configuration, loaded (best-effort) from `.neuromemo.json`
/// in the current directory. A missing or malformed config file is never
/// fatal — callers always get `Config::default()` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default `-f` basename when none is given on the command line.
    pub db_basename: String,
    /// Default `-k` when none is given on the command line.
    pub default_top_k: usize,
    /// Bytes reserved for the arena's single backing region.
    pub arena_bytes: usize,
    /// Path to the packed transformer model file.
    pub model_path: PathBuf,
    /// Path to the packed BPE tokenizer file.
    pub tokenizer_path: PathBuf,
    /// GPU adapter preference: `"high-performance"` or `"low-power"`. An
    /// unrecognized value falls back to `"high-performance"`.
    pub gpu_power_preference: String,
}

/// Hard ceiling on `-k`, independent of configuration.
pub const MAX_TOP_K: usize = 100;

impl Default for Config {
    fn default() -> Self {
        Self {
            db_basename: "memo".to_string(),
            default_top_k: 2,
            arena_bytes: 1 << 30, // 1 GiB
            model_path: default_asset_dir().join("model.bin"),
            tokenizer_path: default_asset_dir().join("tokenizer.bin"),
            gpu_power_preference: "high-performance".to_string(),
        }
    }
}

fn default_asset_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".neuromemo")
}

pub fn load_config(repo_root: &Path) -> Config {
    let primary = repo_root.join(".neuromemo.json");

    let text = std::fs::read_to_string(&primary);
    let Ok(text) = text else { return Config::default() };

    serde_json::from_str::<Config>(&text).unwrap_or_else(|_| Config::default())
}
