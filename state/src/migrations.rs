use sqlx::migrate::Migrator;

/// Idempotent schema migrations, embedded at compile time.
pub(crate) static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
