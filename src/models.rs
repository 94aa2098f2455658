use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

/// One row exactly as the attempts API returned it. Nothing about it is trusted.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct RawAttempt(pub Map<String, Value>);

impl RawAttempt {
    pub const USER_ID: &'static str = "lti_user_id";
    pub const PASSBACK_PARAMS: &'static str = "passback_params";
    pub const IS_CORRECT: &'static str = "is_correct";
    pub const ATTEMPT_TYPE: &'static str = "attempt_type";
    pub const CREATED_AT: &'static str = "created_at";

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AttemptType {
    Run,
    Submit,
}

impl AttemptType {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptType::Run => "run",
            AttemptType::Submit => "submit",
        }
    }
}

impl fmt::Display for AttemptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(AttemptType::Run),
            "submit" => Ok(AttemptType::Submit),
            other => Err(format!("unknown attempt type {other:?}")),
        }
    }
}

/// A fully validated attempt. Only `validate::validate` builds one, so every
/// value of this type satisfies the field invariants.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ValidatedAttempt {
    user_id: String,
    oauth_consumer_key: Option<String>,
    lis_result_sourcedid: String,
    lis_outcome_service_url: String,
    is_correct: bool,
    attempt_type: AttemptType,
    created_at: NaiveDateTime,
}

impl ValidatedAttempt {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_checked_parts(
        user_id: String,
        oauth_consumer_key: Option<String>,
        lis_result_sourcedid: String,
        lis_outcome_service_url: String,
        is_correct: bool,
        attempt_type: AttemptType,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            user_id,
            oauth_consumer_key,
            lis_result_sourcedid,
            lis_outcome_service_url,
            is_correct,
            attempt_type,
            created_at,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn oauth_consumer_key(&self) -> Option<&str> {
        self.oauth_consumer_key.as_deref()
    }

    pub fn lis_result_sourcedid(&self) -> &str {
        &self.lis_result_sourcedid
    }

    pub fn lis_outcome_service_url(&self) -> &str {
        &self.lis_outcome_service_url
    }

    pub fn is_correct(&self) -> bool {
        self.is_correct
    }

    pub fn attempt_type(&self) -> AttemptType {
        self.attempt_type
    }

    pub fn created_at(&self) -> NaiveDateTime {
        self.created_at
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            user_id: self.user_id.clone(),
            lis_result_sourcedid: self.lis_result_sourcedid.clone(),
            attempt_type: self.attempt_type,
            created_at: self.created_at,
        }
    }
}

/// Natural key of an attempt. At most one persisted row exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub user_id: String,
    pub lis_result_sourcedid: String,
    pub attempt_type: AttemptType,
    pub created_at: NaiveDateTime,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StatisticsSummary {
    pub total_records: usize,
    pub unique_users: usize,
    pub submit_attempts: usize,
    pub run_attempts: usize,
    pub correct_attempts: usize,
    pub incorrect_attempts: usize,
    pub earliest_attempt: Option<NaiveDateTime>,
    pub latest_attempt: Option<NaiveDateTime>,
    pub success_rate: f64,
    // +inf when there were no submits
    pub run_to_submit_ratio: f64,
    pub avg_attempts_per_user: f64,
    pub date_range_days: i64,
}

/// Raw totals over the whole attempts table, for reconciliation.
#[derive(sqlx::FromRow, Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistedStats {
    pub total_records: i64,
    pub unique_users: i64,
    pub submit_attempts: i64,
    pub run_attempts: i64,
    pub correct_attempts: i64,
    pub incorrect_attempts: i64,
    pub earliest_attempt: Option<NaiveDateTime>,
    pub latest_attempt: Option<NaiveDateTime>,
}
