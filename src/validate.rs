// Field validation: turns loosely typed API rows into ValidatedAttempt values.

use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{AttemptType, RawAttempt, ValidatedAttempt};

pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
pub const CREATED_AT_FORMAT_NO_FRACTION: &str = "%Y-%m-%d %H:%M:%S";

const CONSUMER_KEY: &str = "oauth_consumer_key";
const RESULT_SOURCEDID: &str = "lis_result_sourcedid";
const OUTCOME_SERVICE_URL: &str = "lis_outcome_service_url";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PassbackFault {
    #[error("missing")]
    Missing,
    #[error("not a string")]
    NotText,
    #[error("not a JSON object after quote normalization")]
    Malformed,
    #[error("key {0} is missing")]
    MissingKey(&'static str),
    #[error("oauth_consumer_key is not a scalar")]
    ConsumerKey,
}

/// Why a row was dropped. Validation stops at the first failing field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("user_id is missing, empty or not a string")]
    UserId,
    #[error("passback_params: {0}")]
    PassbackParams(PassbackFault),
    #[error("lis_result_sourcedid is not a string containing \"course\"")]
    ResultSourcedid,
    #[error("lis_outcome_service_url is not a string containing \"https\"")]
    OutcomeServiceUrl,
    #[error("is_correct is not null, 0, 1 or a boolean")]
    IsCorrect,
    #[error("attempt_type is not \"submit\" or \"run\"")]
    AttemptType,
    #[error("created_at does not match YYYY-MM-DD HH:MM:SS.ffffff")]
    CreatedAt,
}

impl Rejection {
    pub fn field(&self) -> &'static str {
        match self {
            Rejection::UserId => "user_id",
            Rejection::PassbackParams(_) => "passback_params",
            Rejection::ResultSourcedid => RESULT_SOURCEDID,
            Rejection::OutcomeServiceUrl => OUTCOME_SERVICE_URL,
            Rejection::IsCorrect => "is_correct",
            Rejection::AttemptType => "attempt_type",
            Rejection::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedAttempt {
    /// Position of the row in the fetched sequence.
    pub index: usize,
    pub reason: Rejection,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub accepted: Vec<ValidatedAttempt>,
    pub rejected: Vec<RejectedAttempt>,
}

impl ValidationReport {
    pub fn received(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }

    pub fn retention_percent(&self) -> f64 {
        match self.received() {
            0 => 0.0,
            n => (self.accepted.len() as f64 * 100.0 / n as f64 * 100.0).round() / 100.0,
        }
    }
}

struct Passback {
    consumer_key: Option<String>,
    result_sourcedid: Value,
    outcome_service_url: Value,
}

pub fn validate(raw: &RawAttempt) -> Result<ValidatedAttempt, Rejection> {
    let user_id = match raw.get(RawAttempt::USER_ID) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(Rejection::UserId),
    };

    let passback = unpack_passback(raw.get(RawAttempt::PASSBACK_PARAMS))
        .map_err(Rejection::PassbackParams)?;

    let lis_result_sourcedid = match passback.result_sourcedid {
        Value::String(s) if s.contains("course") => s,
        _ => return Err(Rejection::ResultSourcedid),
    };

    let lis_outcome_service_url = match passback.outcome_service_url {
        Value::String(s) if s.contains("https") => s,
        _ => return Err(Rejection::OutcomeServiceUrl),
    };

    let is_correct = match raw.get(RawAttempt::IS_CORRECT) {
        Some(v) => strict_correctness(v).ok_or(Rejection::IsCorrect)?,
        None => return Err(Rejection::IsCorrect),
    };

    let attempt_type = match raw.get(RawAttempt::ATTEMPT_TYPE) {
        Some(Value::String(s)) => s.parse::<AttemptType>().map_err(|_| Rejection::AttemptType)?,
        _ => return Err(Rejection::AttemptType),
    };

    let created_at = match raw.get(RawAttempt::CREATED_AT) {
        Some(Value::String(s)) => parse_fractional(s).ok_or(Rejection::CreatedAt)?,
        _ => return Err(Rejection::CreatedAt),
    };

    Ok(ValidatedAttempt::from_checked_parts(
        user_id,
        passback.consumer_key,
        lis_result_sourcedid,
        lis_outcome_service_url,
        is_correct,
        attempt_type,
        created_at,
    ))
}

/// Validates every row, logging each rejection at debug and a retention summary at info.
pub fn validate_all(rows: &[RawAttempt]) -> ValidationReport {
    tracing::info!(received = rows.len(), "start of data processing");

    let mut report = ValidationReport::default();
    for (index, raw) in rows.iter().enumerate() {
        match validate(raw) {
            Ok(attempt) => report.accepted.push(attempt),
            Err(reason) => {
                tracing::debug!(index, field = reason.field(), %reason, "rejected attempt");
                report.rejected.push(RejectedAttempt { index, reason });
            }
        }
    }

    tracing::info!(
        received = report.received(),
        accepted = report.accepted.len(),
        retention_percent = report.retention_percent(),
        "data processed"
    );
    report
}

// The block arrives as pseudo-JSON with single quotes, e.g. {'a': 'b'}.
fn unpack_passback(value: Option<&Value>) -> Result<Passback, PassbackFault> {
    let text = match value {
        Some(Value::String(s)) => s,
        Some(_) => return Err(PassbackFault::NotText),
        None => return Err(PassbackFault::Missing),
    };
    let normalized = text.replace('\'', "\"");
    let mut params: Map<String, Value> =
        serde_json::from_str(&normalized).map_err(|_| PassbackFault::Malformed)?;

    let mut take = |key: &'static str| params.remove(key).ok_or(PassbackFault::MissingKey(key));
    let consumer_key = take(CONSUMER_KEY)?;
    let result_sourcedid = take(RESULT_SOURCEDID)?;
    let outcome_service_url = take(OUTCOME_SERVICE_URL)?;

    let consumer_key = match consumer_key {
        Value::Null => None,
        Value::String(s) => Some(s),
        v @ (Value::Number(_) | Value::Bool(_)) => Some(v.to_string()),
        Value::Array(_) | Value::Object(_) => return Err(PassbackFault::ConsumerKey),
    };

    Ok(Passback {
        consumer_key,
        result_sourcedid,
        outcome_service_url,
    })
}

// Null, 0 and 1 by value equality: booleans and 0.0/1.0 pass, strings never do.
// The aggregator is deliberately looser.
fn strict_correctness(value: &Value) -> Option<bool> {
    match value {
        Value::Null => Some(false),
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 0.0 => Some(false),
            Some(v) if v == 1.0 => Some(true),
            _ => None,
        },
        _ => None,
    }
}

/// Parses `YYYY-MM-DD HH:MM:SS.f` with one to six fractional digits.
pub(crate) fn parse_fractional(s: &str) -> Option<NaiveDateTime> {
    let (_, fraction) = s.rsplit_once('.')?;
    if fraction.is_empty() || fraction.len() > 6 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(s, CREATED_AT_FORMAT).ok()
}

pub(crate) fn parse_without_fraction(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, CREATED_AT_FORMAT_NO_FRACTION).ok()
}
