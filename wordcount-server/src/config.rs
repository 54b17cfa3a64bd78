use anyhow::{anyhow, Context};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_WORD: &str = "the";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_TABLE: &str = "bigquery-public-data.samples.shakespeare";
pub const DEFAULT_API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    // Word counted per corpus. Fixed for the lifetime of the process.
    pub word: String,
    pub host: String,
    pub port: u16,
    // Development mode: verbose (debug) logging unless RUST_LOG says otherwise.
    pub dev_mode: bool,
    // Upper bound for a whole query execution, follow-up polling included.
    pub query_timeout_secs: u64,
    pub bigquery: BigQueryConfig,
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct BigQueryConfig {
    pub table: String,
    pub api_url: String,
    // Billing project. Discovered from credentials or the metadata server if unset.
    pub project: Option<String>,
    pub location: Option<String>,
    // Pre-minted OAuth2 bearer token. Skips every other credential source.
    pub access_token: Option<String>,
    pub credentials_file: Option<PathBuf>,
    // gcloud's well-known application default credentials file.
    pub adc_file: Option<PathBuf>,
    pub metadata_host: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            word: DEFAULT_WORD.to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            dev_mode: false,
            query_timeout_secs: 30,
            bigquery: BigQueryConfig::default(),
        }
    }
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        BigQueryConfig {
            table: DEFAULT_TABLE.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            project: None,
            location: None,
            access_token: None,
            credentials_file: None,
            adc_file: None,
            metadata_host: DEFAULT_METADATA_HOST.to_string(),
        }
    }
}

// Keeps the access token out of startup logs.
impl std::fmt::Debug for BigQueryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryConfig")
            .field("table", &self.table)
            .field("api_url", &self.api_url)
            .field("project", &self.project)
            .field("location", &self.location)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("credentials_file", &self.credentials_file)
            .field("adc_file", &self.adc_file)
            .field("metadata_host", &self.metadata_host)
            .finish()
    }
}

impl Config {
    /// Loads the optional TOML file named by `WORDCOUNT_CONFIG`, then applies
    /// the process environment on top and validates the result.
    pub fn load() -> anyhow::Result<Self> {
        let base = match std::env::var("WORDCOUNT_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        let cfg = base.with_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let cfg_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path))?;
        Ok(toml::from_str(&cfg_str)?)
    }

    /// Overrides fields from environment variables resolved through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(word) = lookup("WORD") {
            self.word = word;
        }
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow!("invalid PORT '{}': {}", port, e))?;
        }
        if let Some(env) = lookup("APP_ENV") {
            self.dev_mode = env.eq_ignore_ascii_case("development");
        }
        if let Some(secs) = lookup("QUERY_TIMEOUT_SECS") {
            self.query_timeout_secs = secs
                .trim()
                .parse()
                .map_err(|e| anyhow!("invalid QUERY_TIMEOUT_SECS '{}': {}", secs, e))?;
        }

        let bq = &mut self.bigquery;
        if let Some(table) = lookup("BIGQUERY_TABLE") {
            bq.table = table;
        }
        if let Some(url) = lookup("BIGQUERY_API_URL") {
            bq.api_url = url;
        }
        if let Some(location) = lookup("BIGQUERY_LOCATION") {
            bq.location = Some(location);
        }
        if let Some(token) = lookup("BIGQUERY_ACCESS_TOKEN") {
            bq.access_token = Some(token);
        }
        if let Some(project) = lookup("GOOGLE_CLOUD_PROJECT") {
            bq.project = Some(project);
        }
        if let Some(path) = lookup("GOOGLE_APPLICATION_CREDENTIALS") {
            bq.credentials_file = Some(PathBuf::from(path));
        }
        if bq.adc_file.is_none() {
            bq.adc_file = lookup("HOME").map(|home| {
                PathBuf::from(home).join(".config/gcloud/application_default_credentials.json")
            });
        }
        if let Some(host) = lookup("GCE_METADATA_HOST") {
            bq.metadata_host = host;
        }
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.query_timeout_secs == 0 {
            return Err(anyhow!("query_timeout_secs must be greater than zero"));
        }
        let table_re =
            Regex::new(r"^([A-Za-z0-9][A-Za-z0-9_:.-]*\.)?[A-Za-z0-9_]+\.[A-Za-z0-9_$-]+$")?;
        if !table_re.is_match(&self.bigquery.table) {
            return Err(anyhow!(
                "invalid BigQuery table '{}': expected project.dataset.table",
                self.bigquery.table
            ));
        }
        reqwest::Url::parse(&self.bigquery.api_url)
            .map_err(|e| anyhow!("invalid BigQuery API URL '{}': {}", self.bigquery.api_url, e))?;
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
