// One ingestion pass: fetch -> validate -> (summarize, load) -> export -> notify.

use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::api::{AttemptSource, FetchError};
use crate::loader::{LoadError, LoadReport, Loader};
use crate::models::{PersistedStats, StatisticsSummary};
use crate::notify::{Notification, Notifier};
use crate::sheets::SummaryExporter;
use crate::stats;
use crate::store::AttemptStore;
use crate::validate::{self, ValidationReport};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("fetching attempts failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

#[derive(Debug)]
pub struct RunReport {
    pub fetched: usize,
    pub validation: ValidationReport,
    pub summary: Option<StatisticsSummary>,
    pub load: LoadReport,
    pub persisted: Option<PersistedStats>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The source returned no rows; nothing else ran.
    NoRawData,
    /// Every row was rejected; nothing else ran.
    NothingValid { rejected: usize },
    Completed(RunReport),
}

pub struct Pipeline<'a, S> {
    pub source: &'a dyn AttemptSource,
    pub loader: Loader<S>,
    pub batch_size: NonZeroUsize,
    pub exporter: Option<&'a dyn SummaryExporter>,
    pub notifier: Option<&'a dyn Notifier>,
}

impl<S: AttemptStore> Pipeline<'_, S> {
    /// Runs one pass and always releases the storage connection afterwards.
    pub async fn run(mut self) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("ingest", %run_id);

        let outcome = self.execute().instrument(span.clone()).await;
        self.loader.close().await;

        async {
            match &outcome {
                Ok(RunOutcome::Completed(report)) => {
                    let notification = match &report.summary {
                        Some(summary) => Notification::Statistics {
                            summary: summary.clone(),
                            inserted: report.load.inserted,
                        },
                        None => Notification::Completed,
                    };
                    self.notify(&notification).await;
                    tracing::info!("ingestion finished");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "critical error");
                    self.notify(&Notification::Failure {
                        message: e.to_string(),
                    })
                    .await;
                }
            }
        }
        .instrument(span)
        .await;

        outcome
    }

    async fn execute(&mut self) -> Result<RunOutcome, PipelineError> {
        tracing::info!("step 1: extract attempts");
        let raw = self.source.fetch().await?;
        if raw.is_empty() {
            tracing::error!("no data for transformation");
            return Ok(RunOutcome::NoRawData);
        }

        tracing::info!("step 2: validate");
        let validation = validate::validate_all(&raw);
        if validation.accepted.is_empty() {
            tracing::error!(rejected = validation.rejected.len(), "no valid records");
            return Ok(RunOutcome::NothingValid {
                rejected: validation.rejected.len(),
            });
        }

        tracing::info!("step 3: statistics");
        let summary = stats::summarize(&validation.accepted);

        tracing::info!("step 4: load");
        self.loader.check_connection().await?;
        let load = self.loader.load(&validation.accepted, self.batch_size).await?;
        tracing::info!(inserted = load.inserted, "records inserted");

        let persisted = self.loader.read_persisted_stats().await;
        if let Some(p) = &persisted {
            tracing::info!(
                total_records = p.total_records,
                unique_users = p.unique_users,
                earliest = ?p.earliest_attempt,
                latest = ?p.latest_attempt,
                "persisted totals"
            );
        }

        tracing::info!("step 5: export statistics");
        match (&summary, self.exporter) {
            (Some(summary), Some(exporter)) => {
                if let Err(e) = exporter.export(summary).await {
                    tracing::error!(error = %e, "statistics export failed");
                }
            }
            (None, _) => tracing::info!("no statistics to export"),
            (_, None) => tracing::info!("spreadsheet export not configured"),
        }

        Ok(RunOutcome::Completed(RunReport {
            fetched: raw.len(),
            validation,
            summary,
            load,
            persisted,
        }))
    }

    async fn notify(&self, notification: &Notification) {
        let Some(notifier) = self.notifier else {
            tracing::debug!("notifier not configured");
            return;
        };
        if let Err(e) = notifier.send(notification).await {
            tracing::warn!(error = %e, "notification failed");
        }
    }
}
