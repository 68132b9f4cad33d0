use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use depeg_watch::services::notifier::{Notification, Notifier, NotifyError};
use parking_lot::Mutex;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use std::env;

/// Set up test database connection
/// Uses TEST_DATABASE_URL environment variable or falls back to default.
/// Runs migrations and empties both tables.
#[allow(dead_code)]
pub async fn setup_test_db() -> Result<DatabaseConnection, DbErr> {
    let database_url = env::var("TEST_DATABASE_URL").unwrap_or_else(|_| {
        "postgresql://depeg_watch@localhost:5432/depeg_watch_test".to_string()
    });

    let db = Database::connect(&database_url).await?;
    migration::Migrator::up(&db, None).await?;
    db.execute_unprepared("TRUNCATE alerts, rate_samples RESTART IDENTITY")
        .await?;
    Ok(db)
}

/// 2026-03-14 at the given time, UTC
#[allow(dead_code)]
pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
}

/// Notifier that keeps every notification it receives
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}
