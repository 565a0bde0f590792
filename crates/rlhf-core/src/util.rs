//! Environment file loading shared by the RLHF binaries

use std::path::{Path, PathBuf};

/// Candidate locations of `rlhf.env`, in search order
pub fn env_file_candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/usr/local/etc/rlhf/rlhf.env")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("rlhf/rlhf.env"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/rlhf/rlhf.env"));
    }
    paths
}

/// Load environment variables from the first `rlhf.env` found.
/// Variables that are already set win over the file.
pub fn load_env_file() -> Option<PathBuf> {
    for path in env_file_candidates() {
        if Path::new(&path).exists() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                parse_env_file(&contents);
                return Some(path);
            }
            break;
        }
    }
    None
}

/// Parse env file contents and set environment variables (only if not already set).
/// Supports formats:
/// - `KEY=value`
/// - `export KEY=value`
/// - `KEY="quoted value"`
/// - `KEY='single quoted'`
/// - Comments starting with #
pub fn parse_env_file(contents: &str) {
    for (key, value) in parse_env_pairs(contents) {
        if std::env::var(&key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

fn parse_env_pairs(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            line.split_once('=').map(|(key, value)| {
                (
                    key.trim().to_string(),
                    value.trim().trim_matches('"').trim_matches('\'').to_string(),
                )
            })
        })
        .collect()
}
