//! Effective configuration for a CLI run.

use anyhow::{Context, Result};
use fanout_workers::HarnessConfig;
use std::path::Path;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "fanout.toml";

/// Load the harness config.
///
/// An explicit `path` must exist. Without one, `fanout.toml` is used when
/// present and the built-in defaults otherwise. Environment overrides are
/// applied last, then `seed` if given.
pub fn load(path: Option<&Path>, seed: Option<u64>) -> Result<HarnessConfig> {
    let mut config = match path {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            HarnessConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))
                .context("Failed to load fanout.toml")?
        }
        None => HarnessConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid environment override")?;
    if seed.is_some() {
        config.network.seed = seed;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn explicit_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[streams]\ntimeout_ms = 1234\n\n[forks]\nepochs = 9").unwrap();

        let config = load(Some(file.path()), None).unwrap();
        assert_eq!(config.forks.epochs, 9);
        assert_eq!(config.network.seed, None);
    }

    #[test]
    fn seed_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nseed = 1").unwrap();

        let config = load(Some(file.path()), Some(7)).unwrap();
        assert_eq!(config.network.seed, Some(7));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("nope.toml")), None).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[streams]\nalmost_all_threshold = 250.0").unwrap();
        assert!(load(Some(file.path()), None).is_err());
    }
}
