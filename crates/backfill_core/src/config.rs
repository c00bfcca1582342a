use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::driver::{BackfillOptions, DEFAULT_UPDATE_KEY};
use crate::partition::ChunkSize;

pub const DEFAULT_CONFIG_PATH: &str = ".backfill/config.toml";
pub const DEFAULT_DB_PATH: &str = ".backfill/wiki.sqlite";

pub const ENV_DB_PATH: &str = "BACKFILL_DB_PATH";
pub const ENV_CHUNK_SIZE: &str = "BACKFILL_CHUNK_SIZE";
pub const ENV_BARRIER_TIMEOUT_SECS: &str = "BACKFILL_BARRIER_TIMEOUT_SECS";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BackfillConfig {
    #[serde(default)]
    pub backfill: BackfillSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BackfillSection {
    pub db_path: Option<PathBuf>,
    pub chunk_size: Option<u32>,
    pub update_key: Option<String>,
    pub barrier_timeout_secs: Option<u64>,
}

/// Values given on the command line; they win over env and file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db_path: Option<PathBuf>,
    pub chunk_size: Option<u32>,
    pub barrier_timeout_secs: Option<u64>,
    pub force: bool,
    pub resume_from: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub db_path: PathBuf,
    pub options: BackfillOptions,
}

impl BackfillConfig {
    /// Flag > env > config file > default.
    pub fn resolve(&self, base_dir: &Path, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
        self.resolve_with_lookup(base_dir, overrides, |key| env::var(key).ok())
    }

    fn resolve_with_lookup<F>(
        &self,
        base_dir: &Path,
        overrides: &ConfigOverrides,
        lookup: F,
    ) -> Result<ResolvedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let db_path = overrides
            .db_path
            .clone()
            .or_else(|| env_value(ENV_DB_PATH).map(PathBuf::from))
            .or_else(|| {
                self.backfill
                    .db_path
                    .as_ref()
                    .map(|path| absolutize(path, base_dir))
            })
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let chunk_size = match overrides.chunk_size {
            Some(value) => Some(value),
            None => env_value(ENV_CHUNK_SIZE)
                .map(|raw| {
                    raw.parse::<u32>()
                        .with_context(|| format!("{ENV_CHUNK_SIZE} must be an integer, got {raw}"))
                })
                .transpose()?
                .or(self.backfill.chunk_size),
        };
        let chunk_size = match chunk_size {
            Some(value) => ChunkSize::new(value)?,
            None => ChunkSize::default(),
        };

        let barrier_timeout_secs = match overrides.barrier_timeout_secs {
            Some(value) => Some(value),
            None => env_value(ENV_BARRIER_TIMEOUT_SECS)
                .map(|raw| {
                    raw.parse::<u64>().with_context(|| {
                        format!("{ENV_BARRIER_TIMEOUT_SECS} must be an integer, got {raw}")
                    })
                })
                .transpose()?
                .or(self.backfill.barrier_timeout_secs),
        };

        let update_key = match self.backfill.update_key.as_deref().map(str::trim) {
            Some("") => bail!("update_key cannot be empty"),
            Some(key) => key.to_string(),
            None => DEFAULT_UPDATE_KEY.to_string(),
        };

        Ok(ResolvedConfig {
            db_path,
            options: BackfillOptions {
                chunk_size,
                update_key,
                force: overrides.force,
                resume_from: overrides.resume_from,
                // 0 keeps the unbounded wait.
                barrier_timeout: barrier_timeout_secs
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            },
        })
    }
}

/// Load the TOML config; a missing file yields defaults.
pub fn load_config(config_path: &Path) -> Result<BackfillConfig> {
    if !config_path.exists() {
        return Ok(BackfillConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", config_path.display()))
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;

    fn resolve(
        config: &BackfillConfig,
        overrides: &ConfigOverrides,
        env: &[(&str, &str)],
    ) -> Result<ResolvedConfig> {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        config.resolve_with_lookup(Path::new("/srv/wiki"), overrides, |key| {
            env.get(key).cloned()
        })
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, BackfillConfig::default());
    }

    #[test]
    fn load_config_parses_backfill_section() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[backfill]
db_path = "data/wiki.sqlite"
chunk_size = 500
update_key = "populate rev_parent_id"
barrier_timeout_secs = 30
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.backfill.chunk_size, Some(500));
        assert_eq!(config.backfill.barrier_timeout_secs, Some(30));
        assert_eq!(
            config.backfill.db_path.as_deref(),
            Some(Path::new("data/wiki.sqlite"))
        );
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[backfill\nchunk_size = 1").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn defaults_apply_without_any_source() {
        let resolved =
            resolve(&BackfillConfig::default(), &ConfigOverrides::default(), &[]).expect("resolve");
        assert_eq!(resolved.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(resolved.options.chunk_size, ChunkSize::default());
        assert_eq!(resolved.options.update_key, DEFAULT_UPDATE_KEY);
        assert_eq!(resolved.options.barrier_timeout, None);
        assert!(!resolved.options.force);
    }

    #[test]
    fn flag_beats_env_beats_file() {
        let config = BackfillConfig {
            backfill: BackfillSection {
                db_path: Some(PathBuf::from("file.sqlite")),
                chunk_size: Some(100),
                update_key: None,
                barrier_timeout_secs: Some(10),
            },
        };

        let from_file = resolve(&config, &ConfigOverrides::default(), &[]).expect("file");
        assert_eq!(from_file.db_path, PathBuf::from("/srv/wiki/file.sqlite"));
        assert_eq!(from_file.options.chunk_size.get(), 100);
        assert_eq!(
            from_file.options.barrier_timeout,
            Some(Duration::from_secs(10))
        );

        let env = [
            (ENV_DB_PATH, "/env/wiki.sqlite"),
            (ENV_CHUNK_SIZE, "300"),
            (ENV_BARRIER_TIMEOUT_SECS, "0"),
        ];
        let from_env = resolve(&config, &ConfigOverrides::default(), &env).expect("env");
        assert_eq!(from_env.db_path, PathBuf::from("/env/wiki.sqlite"));
        assert_eq!(from_env.options.chunk_size.get(), 300);
        assert_eq!(from_env.options.barrier_timeout, None);

        let overrides = ConfigOverrides {
            db_path: Some(PathBuf::from("/flag/wiki.sqlite")),
            chunk_size: Some(50),
            barrier_timeout_secs: Some(2),
            force: true,
            resume_from: Some(1000),
        };
        let from_flags = resolve(&config, &overrides, &env).expect("flags");
        assert_eq!(from_flags.db_path, PathBuf::from("/flag/wiki.sqlite"));
        assert_eq!(from_flags.options.chunk_size.get(), 50);
        assert_eq!(
            from_flags.options.barrier_timeout,
            Some(Duration::from_secs(2))
        );
        assert!(from_flags.options.force);
        assert_eq!(from_flags.options.resume_from, Some(1000));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let overrides = ConfigOverrides {
            chunk_size: Some(0),
            ..ConfigOverrides::default()
        };
        assert!(resolve(&BackfillConfig::default(), &overrides, &[]).is_err());
    }

    #[test]
    fn malformed_env_chunk_size_is_an_error() {
        let error = resolve(
            &BackfillConfig::default(),
            &ConfigOverrides::default(),
            &[(ENV_CHUNK_SIZE, "lots")],
        )
        .expect_err("must fail");
        assert!(error.to_string().contains(ENV_CHUNK_SIZE));
    }

    #[test]
    fn blank_update_key_is_rejected() {
        let config = BackfillConfig {
            backfill: BackfillSection {
                update_key: Some("  ".to_string()),
                ..BackfillSection::default()
            },
        };
        assert!(resolve(&config, &ConfigOverrides::default(), &[]).is_err());
    }
}
