//! Daily run quota, counted per UTC day.

use chrono::{DateTime, NaiveTime, Utc};
use relay_db::Database;
use uuid::Uuid;

use crate::error::CoreError;

/// Midnight UTC of the day containing `now`.
pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[derive(Clone)]
pub struct QuotaChecker {
    db: Database,
    max_runs_per_day: u32,
}

impl QuotaChecker {
    pub fn new(db: Database, max_runs_per_day: u32) -> Self {
        Self {
            db,
            max_runs_per_day,
        }
    }

    /// Returns true while the user is under today's limit. Callers check
    /// before inserting the Run row, so a denied request leaves no trace.
    pub async fn check(&self, user_id: Uuid) -> Result<bool, CoreError> {
        let since = start_of_utc_day(Utc::now());
        let used = self.db.count_runs_since(user_id, since).await?;
        Ok(used < u64::from(self.max_runs_per_day))
    }
}
