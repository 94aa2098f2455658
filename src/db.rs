use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};

use crate::config::DatabaseConfig;

pub type Db = Pool<Postgres>;

/// A single-connection pool. Nothing is opened until the first query; after
/// that the connection is reused and reopened if the server dropped it.
pub fn connect_lazy(cfg: &DatabaseConfig) -> Result<Db, sqlx::Error> {
    let options = match cfg {
        DatabaseConfig::Url(url) => url.parse::<PgConnectOptions>()?,
        DatabaseConfig::Params {
            host,
            port,
            database,
            user,
            password,
        } => PgConnectOptions::new()
            .host(host)
            .port(*port)
            .database(database)
            .username(user)
            .password(password),
    };
    tracing::info!(host = cfg.host(), "postgres connection configured");
    Ok(PgPoolOptions::new()
        .max_connections(1)
        .connect_lazy_with(options))
}
