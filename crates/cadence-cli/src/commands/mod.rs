//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! cadence-core engine directly.

pub mod workflow;

use serde_json::Value;

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Parse a `KEY=VALUE` override. Values that parse as JSON keep their
/// type; anything else is bound as a string.
pub fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid variable '{}': expected KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid variable '{}': empty name", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Load `.env.local` then `.env` from `dir`. Variables already present in
/// the environment win.
pub fn load_dotenv(dir: &std::path::Path) {
    for filename in [".env.local", ".env"] {
        let path = dir.join(filename);
        if path.is_file() {
            match dotenvy::from_path(&path) {
                Ok(()) => tracing::info!("[Cli] Loaded environment from '{}'", path.display()),
                Err(e) => tracing::warn!("[Cli] Could not load '{}': {}", path.display(), e),
            }
        }
    }
}
