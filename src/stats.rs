use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use crate::models::{RawAttempt, StatisticsSummary, ValidatedAttempt};
use crate::validate::{parse_fractional, parse_without_fraction};

/// Correctness as it reached the aggregator, before any coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correctness<'a> {
    Bool(bool),
    Number(f64),
    Text(&'a str),
    /// Null, absent or a non-scalar value; counted neither way.
    Unknown,
}

impl Correctness<'_> {
    /// Lenient reading: booleans, any truthy number and "true"/"1"/"t"/"yes".
    pub fn as_flag(&self) -> Option<bool> {
        match *self {
            Correctness::Bool(b) => Some(b),
            Correctness::Number(n) => Some(n != 0.0),
            Correctness::Text(s) => Some(matches!(
                s.to_ascii_lowercase().as_str(),
                "true" | "1" | "t" | "yes"
            )),
            Correctness::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestamp<'a> {
    Parsed(NaiveDateTime),
    Text(&'a str),
    Missing,
}

impl Timestamp<'_> {
    fn resolve(&self) -> Option<NaiveDateTime> {
        match *self {
            Timestamp::Parsed(ts) => Some(ts),
            Timestamp::Text(s) => parse_fractional(s).or_else(|| parse_without_fraction(s)),
            Timestamp::Missing => None,
        }
    }
}

/// Anything the aggregator can count. Implemented for validated attempts and
/// for raw rows that never went through validation.
pub trait StatSource {
    fn user_id(&self) -> Option<&str>;
    fn attempt_type(&self) -> Option<&str>;
    fn correctness(&self) -> Correctness<'_>;
    fn created_at(&self) -> Timestamp<'_>;
}

impl StatSource for ValidatedAttempt {
    fn user_id(&self) -> Option<&str> {
        Some(ValidatedAttempt::user_id(self))
    }

    fn attempt_type(&self) -> Option<&str> {
        Some(ValidatedAttempt::attempt_type(self).as_str())
    }

    fn correctness(&self) -> Correctness<'_> {
        Correctness::Bool(self.is_correct())
    }

    fn created_at(&self) -> Timestamp<'_> {
        Timestamp::Parsed(ValidatedAttempt::created_at(self))
    }
}

impl StatSource for RawAttempt {
    fn user_id(&self) -> Option<&str> {
        self.get(RawAttempt::USER_ID).and_then(Value::as_str)
    }

    fn attempt_type(&self) -> Option<&str> {
        self.get(RawAttempt::ATTEMPT_TYPE).and_then(Value::as_str)
    }

    fn correctness(&self) -> Correctness<'_> {
        match self.get(RawAttempt::IS_CORRECT) {
            Some(Value::Bool(b)) => Correctness::Bool(*b),
            Some(Value::Number(n)) => n.as_f64().map_or(Correctness::Unknown, Correctness::Number),
            Some(Value::String(s)) => Correctness::Text(s),
            _ => Correctness::Unknown,
        }
    }

    fn created_at(&self) -> Timestamp<'_> {
        match self.get(RawAttempt::CREATED_AT) {
            Some(Value::String(s)) => Timestamp::Text(s),
            _ => Timestamp::Missing,
        }
    }
}

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("{0} counter overflowed")]
    Overflow(&'static str),
}

/// Single pass over `records`. Returns `None` for empty input and when the
/// pass fails; both are logged and neither is fatal for the run.
pub fn summarize<T: StatSource>(records: &[T]) -> Option<StatisticsSummary> {
    if records.is_empty() {
        tracing::warn!("no data given for analysis");
        return None;
    }
    tracing::info!(records = records.len(), "computing statistics");

    match try_summarize(records) {
        Ok(summary) => {
            tracing::info!(
                total_records = summary.total_records,
                unique_users = summary.unique_users,
                submit_attempts = summary.submit_attempts,
                run_attempts = summary.run_attempts,
                correct_attempts = summary.correct_attempts,
                incorrect_attempts = summary.incorrect_attempts,
                "data statistics"
            );
            Some(summary)
        }
        Err(e) => {
            tracing::error!(error = %e, "error during analysis of data");
            None
        }
    }
}

#[derive(Default)]
struct Tally<'a> {
    users: HashSet<&'a str>,
    submit: usize,
    run: usize,
    correct: usize,
    incorrect: usize,
    earliest: Option<NaiveDateTime>,
    latest: Option<NaiveDateTime>,
}

fn bump(counter: &mut usize, name: &'static str) -> Result<(), StatsError> {
    *counter = counter.checked_add(1).ok_or(StatsError::Overflow(name))?;
    Ok(())
}

fn try_summarize<T: StatSource>(records: &[T]) -> Result<StatisticsSummary, StatsError> {
    let mut tally = Tally::default();

    for record in records {
        if let Some(user) = record.user_id() {
            tally.users.insert(user);
        }

        match record.attempt_type() {
            Some("submit") => bump(&mut tally.submit, "submit")?,
            Some("run") => bump(&mut tally.run, "run")?,
            _ => {}
        }

        match record.correctness().as_flag() {
            Some(true) => bump(&mut tally.correct, "correct")?,
            Some(false) => bump(&mut tally.incorrect, "incorrect")?,
            None => {}
        }

        // an unparseable date only drops this record's date contribution
        if let Some(ts) = record.created_at().resolve() {
            tally.earliest = Some(tally.earliest.map_or(ts, |e| e.min(ts)));
            tally.latest = Some(tally.latest.map_or(ts, |l| l.max(ts)));
        }
    }

    let total = records.len();
    let unique_users = tally.users.len();

    let success_rate = if tally.submit > 0 {
        round2(tally.correct as f64 * 100.0 / tally.submit as f64)
    } else {
        0.0
    };
    let run_to_submit_ratio = if tally.submit > 0 {
        round2(tally.run as f64 / tally.submit as f64)
    } else {
        f64::INFINITY
    };
    let avg_attempts_per_user = if unique_users > 0 {
        round2(total as f64 / unique_users as f64)
    } else {
        0.0
    };
    let date_range_days = match (tally.earliest, tally.latest) {
        (Some(earliest), Some(latest)) => (latest - earliest).num_days(),
        _ => 0,
    };

    Ok(StatisticsSummary {
        total_records: total,
        unique_users,
        submit_attempts: tally.submit,
        run_attempts: tally.run,
        correct_attempts: tally.correct,
        incorrect_attempts: tally.incorrect,
        earliest_attempt: tally.earliest,
        latest_attempt: tally.latest,
        success_rate,
        run_to_submit_ratio,
        avg_attempts_per_user,
        date_range_days,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
