use anyhow::Context;

mod api;
mod config;
mod db;
mod loader;
mod models;
mod notify;
mod pipeline;
mod sheets;
mod stats;
mod store;
mod telemetry;
mod validate;

use crate::{
    api::ApiClient,
    config::Config,
    loader::Loader,
    notify::{Notifier, WebhookNotifier},
    pipeline::{Pipeline, RunOutcome},
    sheets::{SheetsExporter, SummaryExporter},
    store::PgAttemptStore,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::from_env().context("invalid configuration")?;
    telemetry::init(&cfg.log_dir, cfg.log_retention_days)?;

    let db = db::connect_lazy(&cfg.database).context("invalid database settings")?;
    let source = ApiClient::new(cfg.api.clone());
    let exporter = cfg.sheets.clone().map(SheetsExporter::new);
    let notifier = cfg
        .notify_webhook_url
        .clone()
        .map(|url| WebhookNotifier::new(url, cfg.job_name.clone()));

    tracing::info!(job = %cfg.job_name, table = cfg.table.as_str(), "start of ETL process");
    let pipeline = Pipeline {
        source: &source,
        loader: Loader::new(PgAttemptStore::new(db, cfg.table.clone())),
        batch_size: cfg.batch_size,
        exporter: exporter.as_ref().map(|e| e as &dyn SummaryExporter),
        notifier: notifier.as_ref().map(|n| n as &dyn Notifier),
    };

    match pipeline.run().await? {
        RunOutcome::Completed(report) => tracing::info!(
            fetched = report.fetched,
            accepted = report.validation.accepted.len(),
            inserted = report.load.inserted,
            "ETL process finished"
        ),
        RunOutcome::NoRawData => tracing::warn!("nothing fetched for the window"),
        RunOutcome::NothingValid { rejected } => {
            tracing::warn!(rejected, "every fetched record was rejected")
        }
    }
    Ok(())
}
