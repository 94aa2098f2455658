use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::SheetsConfig;
use crate::models::StatisticsSummary;

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const HEADER: [&str; 13] = [
    "Loaded at",
    "Total records",
    "Unique users",
    "Submit attempts",
    "Run attempts",
    "Correct attempts",
    "Incorrect attempts",
    "Success rate, %",
    "Run/Submit ratio",
    "Avg attempts per user",
    "Days in range",
    "Earliest attempt",
    "Latest attempt",
];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("sheets request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sheets API answered {status}: {detail}")]
    Rejected { status: StatusCode, detail: String },
}

#[async_trait]
pub trait SummaryExporter: Send + Sync {
    async fn export(&self, summary: &StatisticsSummary) -> Result<(), ExportError>;
}

/// Appends one row per run to a Google Sheets tab.
pub struct SheetsExporter {
    http: Client,
    cfg: SheetsConfig,
}

impl SheetsExporter {
    pub fn new(cfg: SheetsConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    fn values_url(&self, range: &str, suffix: &str) -> String {
        let range = format!("{}!{}", self.cfg.sheet_name, range);
        format!(
            "{}/{}/values/{}{}",
            SHEETS_API,
            self.cfg.spreadsheet_id,
            utf8_percent_encode(&range, NON_ALPHANUMERIC),
            suffix
        )
    }

    fn batch_update_url(&self) -> String {
        format!("{}/{}:batchUpdate", SHEETS_API, self.cfg.spreadsheet_id)
    }

    fn add_sheet_request(&self) -> Value {
        json!({
            "requests": [
                { "addSheet": { "properties": { "title": self.cfg.sheet_name } } }
            ]
        })
    }

    /// True when the tab has no rows yet. A missing tab is created first.
    async fn is_empty(&self) -> Result<bool, ExportError> {
        let resp = self
            .http
            .get(self.values_url("A:A", ""))
            .bearer_auth(&self.cfg.token)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            let detail = resp.text().await?;
            if is_missing_tab(status, &detail) {
                self.create_tab().await?;
                return Ok(true);
            }
            return Err(ExportError::Rejected { status, detail });
        }
        let body: Value = resp.error_for_status()?.json().await?;
        Ok(body
            .get("values")
            .and_then(Value::as_array)
            .map_or(true, |rows| rows.is_empty()))
    }

    async fn create_tab(&self) -> Result<(), ExportError> {
        self.http
            .post(self.batch_update_url())
            .bearer_auth(&self.cfg.token)
            .json(&self.add_sheet_request())
            .send()
            .await?
            .error_for_status()?;
        tracing::info!(sheet = %self.cfg.sheet_name, "sheet tab created");
        Ok(())
    }

    async fn append(&self, row: Vec<String>) -> Result<(), ExportError> {
        self.http
            .post(self.values_url("A:M", ":append?valueInputOption=USER_ENTERED"))
            .bearer_auth(&self.cfg.token)
            .json(&json!({ "values": [row] }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SummaryExporter for SheetsExporter {
    async fn export(&self, summary: &StatisticsSummary) -> Result<(), ExportError> {
        if self.is_empty().await? {
            tracing::info!(sheet = %self.cfg.sheet_name, "sheet is empty, writing header");
            self.append(HEADER.iter().map(|h| h.to_string()).collect()).await?;
        }
        let row = stats_row(summary, Local::now().naive_local());
        self.append(row).await?;
        tracing::info!(sheet = %self.cfg.sheet_name, "statistics exported");
        Ok(())
    }
}

// The values API reports an unknown tab as an unparsable range.
fn is_missing_tab(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST && body.contains("Unable to parse range")
}

/// Formats a summary in `HEADER` order.
pub fn stats_row(summary: &StatisticsSummary, loaded_at: NaiveDateTime) -> Vec<String> {
    vec![
        loaded_at.format(DISPLAY_FORMAT).to_string(),
        summary.total_records.to_string(),
        summary.unique_users.to_string(),
        summary.submit_attempts.to_string(),
        summary.run_attempts.to_string(),
        summary.correct_attempts.to_string(),
        summary.incorrect_attempts.to_string(),
        fixed2(summary.success_rate),
        fixed2(summary.run_to_submit_ratio),
        fixed2(summary.avg_attempts_per_user),
        summary.date_range_days.to_string(),
        display_ts(summary.earliest_attempt),
        display_ts(summary.latest_attempt),
    ]
}

pub(crate) fn fixed2(v: f64) -> String {
    if v.is_infinite() {
        "inf".into()
    } else {
        format!("{v:.2}")
    }
}

pub(crate) fn display_ts(ts: Option<NaiveDateTime>) -> String {
    ts.map(|t| t.format(DISPLAY_FORMAT).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 4, d)
            .unwrap()
            .and_hms_micro_opt(h, 0, 0, 123_456)
            .unwrap()
    }

    fn summary() -> StatisticsSummary {
        StatisticsSummary {
            total_records: 3,
            unique_users: 2,
            submit_attempts: 2,
            run_attempts: 1,
            correct_attempts: 1,
            incorrect_attempts: 2,
            earliest_attempt: Some(ts(1, 0)),
            latest_attempt: Some(ts(3, 12)),
            success_rate: 50.0,
            run_to_submit_ratio: 0.5,
            avg_attempts_per_user: 1.5,
            date_range_days: 2,
        }
    }

    #[test]
    fn row_follows_header_order() {
        let row = stats_row(&summary(), ts(10, 9));
        assert_eq!(row.len(), HEADER.len());
        assert_eq!(
            row,
            vec![
                "2023-04-10 09:00:00",
                "3",
                "2",
                "2",
                "1",
                "1",
                "2",
                "50.00",
                "0.50",
                "1.50",
                "2",
                "2023-04-01 00:00:00",
                "2023-04-03 12:00:00",
            ]
        );
    }

    #[test]
    fn infinite_ratio_and_missing_dates() {
        let mut s = summary();
        s.run_to_submit_ratio = f64::INFINITY;
        s.earliest_attempt = None;
        let row = stats_row(&s, ts(10, 9));
        assert_eq!(row[8], "inf");
        assert_eq!(row[11], "");
    }

    fn exporter() -> SheetsExporter {
        SheetsExporter::new(SheetsConfig {
            spreadsheet_id: "1AbC".into(),
            token: "t".into(),
            sheet_name: "sf statistics".into(),
        })
    }

    #[test]
    fn missing_tab_is_added_through_batch_update() {
        let exporter = exporter();
        assert_eq!(
            exporter.batch_update_url(),
            "https://sheets.googleapis.com/v4/spreadsheets/1AbC:batchUpdate"
        );
        assert_eq!(
            exporter.add_sheet_request(),
            json!({"requests": [{"addSheet": {"properties": {"title": "sf statistics"}}}]})
        );
    }

    #[test]
    fn only_unparsable_range_means_missing_tab() {
        let body = r#"{"error":{"code":400,"message":"Unable to parse range: sf statistics!A:A","status":"INVALID_ARGUMENT"}}"#;
        assert!(is_missing_tab(StatusCode::BAD_REQUEST, body));
        assert!(!is_missing_tab(StatusCode::BAD_REQUEST, r#"{"error":{"message":"Invalid value"}}"#));
        assert!(!is_missing_tab(StatusCode::FORBIDDEN, body));
    }

    #[test]
    fn range_is_percent_encoded() {
        let exporter = exporter();
        assert_eq!(
            exporter.values_url("A:M", ":append"),
            "https://sheets.googleapis.com/v4/spreadsheets/1AbC/values/sf%20statistics%21A%3AM:append"
        );
    }
}
