//! Print the effective configuration.

use anyhow::Result;
use fanout_workers::HarnessConfig;

/// Render `config` as pretty JSON.
pub fn run(config: &HarnessConfig) -> Result<String> {
    Ok(serde_json::to_string_pretty(config)?)
}
