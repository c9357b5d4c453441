use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use auspex_core::config::Config;
use auspex_core::hashes::HashKinds;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "/etc/auspex/auspex.ini";

/// Daemon configuration, backed by an INI file parsed at startup.
/// One section per subsystem.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    sections: HashMap<String, SectionConfig>,
}

impl DaemonConfig {
    /// Load the default configuration file; a missing file means defaults
    /// everywhere.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let mut sections: HashMap<String, SectionConfig> = HashMap::new();

        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        for (section, prop) in &conf {
            if let Some(section) = section {
                let section_config = sections.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    section_config.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(Self { sections })
    }

    pub fn section(&self, name: &str) -> SectionConfig {
        self.sections.get(name).cloned().unwrap_or_default()
    }
}

/// Per-section key/value configuration with typed getters.
#[derive(Debug, Clone, Default)]
pub struct SectionConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl SectionConfig {
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns a typed configuration value, or the default when absent.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Ok(default),
            Some(value) => parse(value, config_name),
        }
    }

    /// Return a comma separated list of values. Empty vector if the field
    /// is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .filter(|item| !item.is_empty())
            .map(|item| parse(item.trim(), config_name))
            .collect()
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

/// Build the engine configuration from the `[procmon]` section.
pub fn procmon_config(section: &SectionConfig) -> Result<Config, ConfigError> {
    let defaults = Config::default();
    let set = |values: Vec<String>| values.into_iter().collect::<HashSet<_>>();
    Ok(Config {
        kernel_level: section.with_default("kernel_level", defaults.kernel_level)?,
        // 0 disables history entirely; absence keeps it unbounded.
        ancestors: section.with_default("ancestors", defaults.ancestors)?,
        hashes: section.with_default("hashes", HashKinds::default())?,
        codesign: section.with_default("codesign", defaults.codesign)?,
        codesign_helpers: set(section.get_list("codesign_helpers")?),
        large_file_max: section.with_default("large_file_max", defaults.large_file_max)?,
        log_preloaded_exec: section
            .with_default("log_preloaded_exec", defaults.log_preloaded_exec)?,
        suppress_by_ident: set(section.get_list("suppress_image_exec_by_ident")?),
        suppress_by_path: set(section.get_list("suppress_image_exec_by_path")?),
        suppress_ancestor_ident: set(section.get_list("suppress_image_exec_by_ancestor_ident")?),
        suppress_ancestor_path: set(section.get_list("suppress_image_exec_by_ancestor_path")?),
        hash_cache_size: section.with_default("hash_cache_size", defaults.hash_cache_size)?,
        csig_cache_size: section.with_default("csig_cache_size", defaults.csig_cache_size)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use auspex_core::config::KernelLevel;
    use std::io::Write;

    #[test]
    fn missing_sections_yield_defaults() {
        let config = DaemonConfig::default();
        let engine = procmon_config(&config.section("procmon")).unwrap();
        assert_eq!(engine.kernel_level, KernelLevel::Hash);
        assert_eq!(engine.ancestors, usize::MAX);
        assert!(!engine.codesign);
        assert!(engine.suppress_ancestor_path.is_empty());
    }

    #[test]
    fn ini_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[procmon]\n\
             kernel_level = csig\n\
             ancestors = 4\n\
             hashes = md5,sha256\n\
             codesign = true\n\
             suppress_image_exec_by_ancestor_path = /usr/bin/build-driver, /opt/ci/runner\n\
             \n\
             [logger]\n\
             console = false\n"
        )
        .unwrap();
        let config = DaemonConfig::with_custom_file(file.path().to_str().unwrap()).unwrap();

        let engine = procmon_config(&config.section("procmon")).unwrap();
        assert_eq!(engine.kernel_level, KernelLevel::Csig);
        assert_eq!(engine.ancestors, 4);
        assert!(engine.hashes.md5);
        assert!(!engine.hashes.sha1);
        assert!(engine.hashes.sha256);
        assert!(engine.codesign);
        assert!(engine
            .suppress_ancestor_path
            .contains("/usr/bin/build-driver"));
        assert!(engine.suppress_ancestor_path.contains("/opt/ci/runner"));

        let logger = config.section("logger");
        assert_eq!(logger.with_default("console", true).unwrap(), false);
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut section = SectionConfig::default();
        section.insert("kernel_level".to_string(), "everything".to_string());
        let err = procmon_config(&section).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
