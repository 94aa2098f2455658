use std::{env, num::NonZeroUsize, path::PathBuf};
use thiserror::Error;

use crate::validate::{parse_fractional, parse_without_fraction};

pub const DEFAULT_TABLE: &str = "student_attempts";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_SHEET_NAME: &str = "sf_statistics";
pub const DEFAULT_JOB_NAME: &str = "SF ETL Processor";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// A table name that is safe to splice into SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn parse(name: &str) -> Option<Self> {
        let mut chars = name.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let tail_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        // leave room for the idx_<table>_attempt_type index name
        (head_ok && tail_ok && name.len() <= 40).then(|| Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub url: String,
    pub client: String,
    pub client_key: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    Url(String),
    Params {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
    },
}

impl DatabaseConfig {
    /// Host for log lines; never includes credentials.
    pub fn host(&self) -> String {
        match self {
            DatabaseConfig::Params { host, .. } => host.clone(),
            DatabaseConfig::Url(url) => reqwest::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_owned))
                .unwrap_or_else(|| "<unparsed url>".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    pub token: String,
    pub sheet_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub table: TableName,
    pub batch_size: NonZeroUsize,
    pub log_dir: PathBuf,
    pub log_retention_days: u32,
    pub sheets: Option<SheetsConfig>,
    pub notify_webhook_url: Option<String>,
    pub job_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let api = ApiConfig {
            url: required("API_URL")?,
            client: required("API_CLIENT")?,
            client_key: required("API_CLIENT_KEY")?,
            start: window_bound("START_DATE", required("START_DATE")?)?,
            end: window_bound("END_DATE", required("END_DATE")?)?,
        };

        let database = match get("DATABASE_URL") {
            Some(url) => DatabaseConfig::Url(url),
            None => DatabaseConfig::Params {
                host: required("DB_HOST")?,
                port: parse_or("DB_PORT", get("DB_PORT"), 5432u16, "not a port number")?,
                database: required("DB_NAME")?,
                user: required("DB_USER")?,
                password: get("DB_PASSWORD").unwrap_or_default(),
            },
        };

        let table_raw = get("ATTEMPTS_TABLE").unwrap_or_else(|| DEFAULT_TABLE.into());
        let table = TableName::parse(&table_raw).ok_or(ConfigError::Invalid {
            key: "ATTEMPTS_TABLE",
            value: table_raw.clone(),
            reason: "must be a lowercase SQL identifier of at most 40 characters",
        })?;

        let batch_size: usize = parse_or(
            "BATCH_SIZE",
            get("BATCH_SIZE"),
            DEFAULT_BATCH_SIZE,
            "not a positive integer",
        )?;
        let batch_size = NonZeroUsize::new(batch_size).ok_or(ConfigError::Invalid {
            key: "BATCH_SIZE",
            value: "0".into(),
            reason: "not a positive integer",
        })?;

        let sheets = match (get("GOOGLE_SPREADSHEET_ID"), get("GOOGLE_SHEETS_TOKEN")) {
            (Some(spreadsheet_id), Some(token)) => Some(SheetsConfig {
                spreadsheet_id,
                token,
                sheet_name: get("GOOGLE_SHEET_NAME").unwrap_or_else(|| DEFAULT_SHEET_NAME.into()),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("GOOGLE_SHEETS_TOKEN")),
            (None, Some(_)) => return Err(ConfigError::Missing("GOOGLE_SPREADSHEET_ID")),
        };

        Ok(Config {
            api,
            database,
            table,
            batch_size,
            log_dir: get("LOG_DIR").unwrap_or_else(|| "logs".into()).into(),
            log_retention_days: parse_or(
                "LOG_RETENTION_DAYS",
                get("LOG_RETENTION_DAYS"),
                3u32,
                "not a number of days",
            )?,
            sheets,
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL"),
            job_name: get("JOB_NAME").unwrap_or_else(|| DEFAULT_JOB_NAME.into()),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value: v,
            reason,
        }),
    }
}

// The API takes the bounds verbatim; reject ones it would not understand.
fn window_bound(key: &'static str, value: String) -> Result<String, ConfigError> {
    if parse_fractional(&value).is_some() || parse_without_fraction(&value).is_some() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected YYYY-MM-DD HH:MM:SS[.ffffff]",
        })
    }
}
