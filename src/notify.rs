use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;

use crate::models::StatisticsSummary;
use crate::sheets::{display_ts, fixed2};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("webhook delivery failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Statistics {
        summary: StatisticsSummary,
        inserted: u64,
    },
    /// The run finished but no summary could be produced.
    Completed,
    Failure {
        message: String,
    },
}

impl Notification {
    pub fn subject(&self, job: &str) -> String {
        match self {
            Notification::Statistics { .. } => format!("INFO {job} - Statistics report"),
            Notification::Completed => format!("INFO {job} - Completed"),
            Notification::Failure { .. } => format!("ERROR {job} - Run failed"),
        }
    }

    pub fn body(&self, job: &str) -> String {
        match self {
            Notification::Statistics { summary, inserted } => {
                let lines = [
                    ("Total records", summary.total_records.to_string()),
                    ("Unique users", summary.unique_users.to_string()),
                    ("Submit attempts", summary.submit_attempts.to_string()),
                    ("Run attempts", summary.run_attempts.to_string()),
                    ("Correct attempts", summary.correct_attempts.to_string()),
                    ("Incorrect attempts", summary.incorrect_attempts.to_string()),
                    ("Success rate, %", fixed2(summary.success_rate)),
                    ("Run/Submit ratio", fixed2(summary.run_to_submit_ratio)),
                    ("Avg attempts per user", fixed2(summary.avg_attempts_per_user)),
                    ("Days in range", summary.date_range_days.to_string()),
                    ("Earliest attempt", display_ts(summary.earliest_attempt)),
                    ("Latest attempt", display_ts(summary.latest_attempt)),
                    ("Rows inserted", inserted.to_string()),
                ];
                let details: String = lines
                    .iter()
                    .map(|(label, value)| format!("{label}: {value}\n"))
                    .collect();
                format!("{job} finished successfully.\n\n{details}")
            }
            Notification::Completed => format!("{job} finished successfully.\n"),
            Notification::Failure { message } => {
                format!("{job} failed.\n\nError: {message}\n")
            }
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts `{"subject", "text"}` to a chat or mail-relay webhook.
pub struct WebhookNotifier {
    http: Client,
    url: String,
    job: String,
}

impl WebhookNotifier {
    pub fn new(url: String, job: String) -> Self {
        Self {
            http: Client::new(),
            url,
            job,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let subject = notification.subject(&self.job);
        self.http
            .post(&self.url)
            .json(&json!({
                "subject": subject,
                "text": notification.body(&self.job),
            }))
            .send()
            .await?
            .error_for_status()?;
        tracing::info!(%subject, "notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> StatisticsSummary {
        StatisticsSummary {
            total_records: 4,
            unique_users: 1,
            submit_attempts: 0,
            run_attempts: 4,
            correct_attempts: 0,
            incorrect_attempts: 4,
            earliest_attempt: None,
            latest_attempt: None,
            success_rate: 0.0,
            run_to_submit_ratio: f64::INFINITY,
            avg_attempts_per_user: 4.0,
            date_range_days: 0,
        }
    }

    #[test]
    fn subjects_carry_level_and_job() {
        let job = "SF ETL Processor";
        assert_eq!(
            Notification::Completed.subject(job),
            "INFO SF ETL Processor - Completed"
        );
        assert_eq!(
            Notification::Failure { message: "x".into() }.subject(job),
            "ERROR SF ETL Processor - Run failed"
        );
    }

    #[test]
    fn statistics_body_lists_metrics() {
        let n = Notification::Statistics {
            summary: summary(),
            inserted: 3,
        };
        let body = n.body("loader");
        assert!(body.starts_with("loader finished successfully."));
        assert!(body.contains("Run/Submit ratio: inf\n"));
        assert!(body.contains("Avg attempts per user: 4.00\n"));
        assert!(body.contains("Earliest attempt: \n"));
        assert!(body.ends_with("Rows inserted: 3\n"));
        assert_eq!(body.lines().filter(|l| l.contains(": ")).count(), 13);
    }

    #[test]
    fn failure_body_includes_message() {
        let n = Notification::Failure {
            message: "schema bootstrap for table t failed".into(),
        };
        assert!(n.body("loader").contains("Error: schema bootstrap for table t failed"));
    }
}
