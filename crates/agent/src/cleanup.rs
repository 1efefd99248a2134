use crate::config::{
    ConfigService, BASIC_SYNC_LOG_RETENTION_DAYS, DEFAULT_LOG_RETENTION_DAYS,
    THEMATIC_SYNC_LOG_RETENTION_DAYS,
};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;

/// Daily at 02:00, seconds-precision cron form.
const CLEANUP_SCHEDULE: &str = "0 0 2 * * *";

/// LogCleaner deletes aged execution history: basic-library rows past
/// `basic_sync_log_retention_days`, thematic rows past
/// `thematic_sync_log_retention_days`. It runs once at startup and then
/// daily at 02:00.
pub struct LogCleaner {
    pool: sqlx::PgPool,
    config: Arc<ConfigService>,
}

impl LogCleaner {
    pub fn new(pool: sqlx::PgPool, config: Arc<ConfigService>) -> Self {
        Self { pool, config }
    }

    pub async fn run_once(&self) {
        let basic_days = self
            .config
            .get_i64(BASIC_SYNC_LOG_RETENTION_DAYS, DEFAULT_LOG_RETENTION_DAYS)
            .await
            .max(1);
        let thematic_days = self
            .config
            .get_i64(THEMATIC_SYNC_LOG_RETENTION_DAYS, DEFAULT_LOG_RETENTION_DAYS)
            .await
            .max(1);

        let now = Utc::now();
        match datahub_sql::executions::delete_before(
            now - chrono::Duration::days(basic_days),
            &self.pool,
        )
        .await
        {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, retention_days = basic_days, "cleaned basic sync logs");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(%err, "basic sync log cleanup failed"),
        }
        match datahub_sql::executions::delete_thematic_before(
            now - chrono::Duration::days(thematic_days),
            &self.pool,
        )
        .await
        {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, retention_days = thematic_days, "cleaned thematic sync logs");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(%err, "thematic sync log cleanup failed"),
        }
    }

    /// Run at startup and then on the daily schedule until `shutdown`.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) {
        // The schedule is a compile-time constant; parsing cannot fail.
        let schedule = cron::Schedule::from_str(CLEANUP_SCHEDULE).expect("invalid cleanup schedule");
        tokio::pin!(shutdown);

        self.run_once().await;

        loop {
            let Some(next) = schedule.after(&Utc::now()).next() else {
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                () = &mut shutdown => return,
                () = tokio::time::sleep(wait) => {}
            }
            self.run_once().await;
        }
    }
}
