use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_base_url() -> String {
    "https://www.ecfr.gov/api".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_ingest_workers")]
    pub workers: usize,
    /// Pause between items during the retry-failed pass.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            per_page: default_per_page(),
            workers: default_ingest_workers(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_per_page() -> u32 {
    20
}
fn default_ingest_workers() -> usize {
    1
}
fn default_retry_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_workers")]
    pub workers: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            workers: default_metrics_workers(),
        }
    }
}

fn default_metrics_workers() -> usize {
    2
}

impl Config {
    /// Config with every default, pointing at the given database file.
    pub fn with_db(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            corpus: CorpusConfig::default(),
            ingest: IngestConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.corpus.base_url.trim().is_empty() {
            anyhow::bail!("corpus.base_url must not be empty");
        }
        if self.corpus.max_retries > 10 {
            anyhow::bail!("corpus.max_retries must be <= 10");
        }
        if self.ingest.per_page == 0 {
            anyhow::bail!("ingest.per_page must be >= 1");
        }
        if self.ingest.workers == 0 {
            anyhow::bail!("ingest.workers must be >= 1");
        }
        if self.metrics.workers == 0 {
            anyhow::bail!("metrics.workers must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"data/ecfr.sqlite\"\n").unwrap();
        assert_eq!(config.corpus.base_url, "https://www.ecfr.gov/api");
        assert_eq!(config.corpus.max_retries, 3);
        assert_eq!(config.corpus.backoff_base_ms, 10_000);
        assert_eq!(config.ingest.per_page, 20);
        assert_eq!(config.metrics.workers, 2);
        config.validate().unwrap();
    }

    #[test]
    fn zero_per_page_rejected() {
        let config: Config =
            toml::from_str("[db]\npath = \"x\"\n[ingest]\nper_page = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/ecfr.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
