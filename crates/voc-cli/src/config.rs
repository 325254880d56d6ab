//! Configuration file handling for voc

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use voc_core::VocConfig;

const CONFIG_FILE: &str = "voc.conf";

/// Values given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub username: Option<String>,
    pub password: Option<String>,
    pub vin: Option<String>,
    pub region: Option<String>,
    pub service_url: Option<String>,
    pub mqtt_url: Option<String>,
    pub read_only: bool,
}

/// Load `voc.conf` from the first default location that exists
pub fn load() -> Result<VocConfig> {
    match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_from(&path),
        None => Ok(VocConfig::default()),
    }
}

/// Load configuration from a specific path
pub fn load_from(path: &Path) -> Result<VocConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse(content: &str) -> Result<VocConfig> {
    if content.trim().is_empty() {
        return Ok(VocConfig::default());
    }
    let config: VocConfig = serde_yaml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// `$XDG_CONFIG_HOME/voc.conf`, then `~/.voc.conf`
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join(CONFIG_FILE));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(format!(".{}", CONFIG_FILE)));
    }
    paths
}

/// Command line values take precedence over the config file
pub fn merge_with_args(mut config: VocConfig, args: Overrides) -> VocConfig {
    if let Some(username) = args.username {
        config.username = username;
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    config.vin = args.vin.or(config.vin);
    config.region = args.region.or(config.region);
    config.service_url = args.service_url.or(config.service_url);
    config.mqtt_url = args.mqtt_url.or(config.mqtt_url);
    if args.read_only {
        config.mutable = false;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_load_yaml_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "username: alice@example.com").unwrap();
        writeln!(file, "password: secret").unwrap();
        writeln!(file, "region: na").unwrap();
        writeln!(file, "interval: 60").unwrap();
        writeln!(file, "mutable: false").unwrap();

        let config = load_from(file.path()).unwrap();
        assert_eq!(config.username, "alice@example.com");
        assert_eq!(config.region.as_deref(), Some("na"));
        assert_eq!(config.interval, 60);
        assert!(!config.mutable);
        // untouched keys keep their defaults
        assert_eq!(config.poll_budget, 120);
    }

    #[test]
    fn test_empty_config_is_default() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(load_from(file.path()).unwrap(), VocConfig::default());
    }

    #[test]
    fn test_invalid_config_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interval: [not a number").unwrap();
        let err = load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval: 0").unwrap();
        let err = load_from(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("'poll_interval' must be at least 1"));
    }

    #[test]
    fn test_args_override_file() {
        let mut config = VocConfig::new("file-user", "file-pass");
        config.vin = Some("YV1FILE".into());
        config.region = Some("cn".into());

        let merged = merge_with_args(
            config,
            Overrides {
                username: Some("cli-user".into()),
                vin: Some("ABC123".into()),
                read_only: true,
                ..Default::default()
            },
        );
        assert_eq!(merged.username, "cli-user");
        assert_eq!(merged.password, "file-pass");
        assert_eq!(merged.vin.as_deref(), Some("ABC123"));
        assert_eq!(merged.region.as_deref(), Some("cn"));
        assert!(!merged.mutable);
    }
}
