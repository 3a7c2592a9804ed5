use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = "mwarchiver 1.0";
pub const DEFAULT_DB_PATH: &str = "mwarchiver.db";
pub const DEFAULT_LIMIT: i64 = 100;
pub const CONFIG_FILENAME: &str = ".mwarchiver.yaml";
pub const ENV_PREFIX: &str = "MWARCHIVER_";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArchiverConfig {
    pub api_url: String,
    /// Sent as `User-Agent`; empty disables the header.
    pub user_agent: String,
    pub backend: Option<Backend>,
    pub db_path: String,
    pub output_path: String,
    pub namespaces: Vec<i32>,
    /// Pages per namespace; zero or negative archives everything.
    pub limit: i64,
    pub http: HttpConfig,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backend: None,
            db_path: DEFAULT_DB_PATH.to_string(),
            output_path: String::new(),
            namespaces: vec![0],
            limit: DEFAULT_LIMIT,
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub rate_limit_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            retry_delay_ms: 500,
            rate_limit_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Files,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "db" | "database" => Ok(Self::Sqlite),
            "files" | "file" | "fs" => Ok(Self::Files),
            other => bail!("unknown storage backend {other:?} (expected sqlite or files)"),
        }
    }
}

/// Where archived pages end up, after backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Sqlite(PathBuf),
    Files(PathBuf),
}

impl ArchiverConfig {
    /// Explicit `backend` wins; otherwise a non-empty `output_path` selects the
    /// file tree and everything else goes to the database.
    pub fn storage_target(&self) -> Result<StorageTarget> {
        let backend = self.backend.unwrap_or(if self.output_path.trim().is_empty() {
            Backend::Sqlite
        } else {
            Backend::Files
        });
        match backend {
            Backend::Sqlite => {
                if self.db_path.trim().is_empty() {
                    bail!("db_path must be set for the sqlite backend");
                }
                Ok(StorageTarget::Sqlite(PathBuf::from(self.db_path.trim())))
            }
            Backend::Files => {
                if self.output_path.trim().is_empty() {
                    bail!("output_path must be set for the files backend");
                }
                Ok(StorageTarget::Files(PathBuf::from(self.output_path.trim())))
            }
        }
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| env::var(key).ok())
    }

    /// Overlay `MWARCHIVER_*` values returned by `lookup`; blank values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = read("API_URL") {
            self.api_url = value;
        }
        if let Some(value) = read("USER_AGENT") {
            self.user_agent = value;
        }
        if let Some(value) = read("DB_PATH") {
            self.db_path = value;
        }
        if let Some(value) = read("OUTPUT_PATH") {
            self.output_path = value;
        }
        if let Some(value) = read("BACKEND") {
            self.backend = Some(value.parse()?);
        }
        if let Some(value) = read("NAMESPACES") {
            let namespaces = parse_namespace_list(&value)?;
            if !namespaces.is_empty() {
                self.namespaces = namespaces;
            }
        }
        if let Some(value) = read("LIMIT") {
            self.limit = parse_env_number("LIMIT", &value)?;
        }
        if let Some(value) = read("HTTP_TIMEOUT_MS") {
            self.http.timeout_ms = parse_env_number("HTTP_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read("HTTP_RETRIES") {
            self.http.max_retries = parse_env_number("HTTP_RETRIES", &value)?;
        }
        if let Some(value) = read("HTTP_RETRY_DELAY_MS") {
            self.http.retry_delay_ms = parse_env_number("HTTP_RETRY_DELAY_MS", &value)?;
        }
        if let Some(value) = read("RATE_LIMIT_MS") {
            self.http.rate_limit_ms = parse_env_number("RATE_LIMIT_MS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.api_url)
            .with_context(|| format!("invalid api_url: {}", self.api_url))?;
        if self.namespaces.is_empty() {
            bail!("at least one namespace must be configured");
        }
        self.storage_target()?;
        Ok(())
    }
}

/// Parse a comma separated namespace list such as `0, 4,14`. Blank entries are skipped.
pub fn parse_namespace_list(raw: &str) -> Result<Vec<i32>> {
    let mut namespaces = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let value = part
            .parse::<i32>()
            .with_context(|| format!("invalid {ENV_PREFIX}NAMESPACES value {raw:?}"))?;
        namespaces.push(value);
    }
    Ok(namespaces)
}

fn parse_env_number<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("invalid {ENV_PREFIX}{name} value {value:?}"))
}

/// Load an `ArchiverConfig` from YAML, or TOML when the file ends in `.toml`.
pub fn load_config(config_path: &Path) -> Result<ArchiverConfig> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let is_toml = config_path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("toml"));
    let parsed: ArchiverConfig = if is_toml {
        toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else if content.trim().is_empty() {
        ArchiverConfig::default()
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    };
    Ok(parsed)
}

/// `$HOME/.mwarchiver.yaml`.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = BaseDirs::new().context("failed to resolve the home directory")?;
    Ok(dirs.home_dir().join(CONFIG_FILENAME))
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ArchiverConfig,
    /// File the values were read from, if any.
    pub source: Option<PathBuf>,
}

/// Resolve configuration: file (explicit path must exist, the home default is
/// optional), then environment overrides. CLI flags are layered on by the caller.
pub fn resolve_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let (mut config, source) = match explicit {
        Some(path) => (load_config(path)?, Some(path.to_path_buf())),
        None => {
            let path = default_config_path()?;
            if path.exists() {
                (load_config(&path)?, Some(path))
            } else {
                (ArchiverConfig::default(), None)
            }
        }
    };
    config.apply_env()?;
    Ok(LoadedConfig { config, source })
}
