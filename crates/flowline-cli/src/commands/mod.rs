//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! flowline-core executor through an `ExecutionContext`.

pub mod workflow;

use flowline_core::{ClientConfig, ExecutionContext};

/// Open the state directory and HTTP backend described by `config`.
pub async fn init_context(config: ClientConfig) -> Result<ExecutionContext, String> {
    ExecutionContext::open(config)
        .await
        .map_err(|e| format!("Failed to initialize: {}", e))
}

/// Load `.env.local` then `.env` from the working directory.
///
/// Variables already present in the environment win. Returns the files that
/// were read so they can be logged once tracing is up.
pub fn load_dotenv() -> Vec<&'static str> {
    let mut loaded = Vec::new();
    for filename in [".env.local", ".env"] {
        let Ok(content) = std::fs::read_to_string(filename) else {
            continue;
        };
        for (key, value) in parse_dotenv(&content) {
            if std::env::var_os(&key).is_none() {
                std::env::set_var(&key, &value);
            }
        }
        loaded.push(filename);
    }
    loaded
}

/// `KEY=VALUE` pairs from dotenv text; comments and blank lines skipped,
/// surrounding quotes stripped.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim().trim_start_matches("export ").trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                &value[1..value.len() - 1]
            } else {
                value
            };
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}
