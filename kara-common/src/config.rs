//! Configuration file resolution and loading

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "KARA_CONFIG";

/// Configuration file resolution in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform configuration directory
///
/// Returns `Ok(None)` when no file is found; callers then run on built-in
/// defaults. An explicitly named file that does not exist is an error.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Result<Option<PathBuf>> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return require_exists(path.to_path_buf()).map(Some);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return require_exists(PathBuf::from(path)).map(Some);
        }
    }

    // Priority 3: Platform config directory
    Ok(default_config_file())
}

fn require_exists(path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(Error::Config(format!("Config file not found: {}", path.display())))
    }
}

/// Get the platform configuration file if one is present
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("kara").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/kara/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Load a TOML configuration, falling back to `T::default()` without a file
pub fn load_toml<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        debug!("No configuration file, using built-in defaults");
        return Ok(T::default());
    };

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize)]
    struct Sample {
        #[serde(default)]
        name: String,
        #[serde(default)]
        level: u32,
    }

    #[test]
    #[serial]
    fn test_cli_argument_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cli = dir.path().join("cli.toml");
        std::fs::write(&cli, "").unwrap();
        std::env::set_var("KARA_TEST_CONFIG_A", "/definitely/not/here.toml");

        let resolved = resolve_config_path(Some(&cli), "KARA_TEST_CONFIG_A").unwrap();
        assert_eq!(resolved, Some(cli));

        std::env::remove_var("KARA_TEST_CONFIG_A");
    }

    #[test]
    #[serial]
    fn test_env_var_used_without_cli() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("env.toml");
        std::fs::write(&env_path, "").unwrap();
        std::env::set_var("KARA_TEST_CONFIG_B", &env_path);

        let resolved = resolve_config_path(None, "KARA_TEST_CONFIG_B").unwrap();
        assert_eq!(resolved, Some(env_path));

        std::env::remove_var("KARA_TEST_CONFIG_B");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        let result = resolve_config_path(Some(Path::new("/no/such/kara.toml")), "KARA_TEST_CONFIG_C");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_toml_defaults_without_file() {
        let sample: Sample = load_toml(None).unwrap();
        assert_eq!(sample.name, "");
        assert_eq!(sample.level, 0);
    }

    #[test]
    fn test_load_toml_parses_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"studio\"\nlevel = 3").unwrap();

        let sample: Sample = load_toml(Some(file.path())).unwrap();
        assert_eq!(sample.name, "studio");
        assert_eq!(sample.level, 3);
    }

    #[test]
    fn test_load_toml_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "level = \"not a number\"").unwrap();

        let result: Result<Sample> = load_toml(Some(file.path()));
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }
}
