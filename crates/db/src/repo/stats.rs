use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};

/// Totals since a given day, plus a snapshot of how many jobs sit in each
/// state right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSummary {
    pub since: NaiveDate,
    pub files_processed: u64,
    pub bytes_saved: i64,
    pub failures: u64,
    /// Completed, but the catalogue update did not go through.
    pub sync_warnings: u64,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub files_processed: u64,
    pub bytes_saved: i64,
    pub failures: u64,
}

fn day_of(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

pub(crate) async fn record_completion(
    conn: &mut SqliteConnection,
    at: i64,
    bytes_saved: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO processing_stats (date, files_processed, bytes_saved, failures) \
         VALUES (?, 1, ?, 0) \
         ON CONFLICT(date) DO UPDATE SET \
             files_processed = files_processed + 1, \
             bytes_saved = bytes_saved + excluded.bytes_saved",
    )
    .bind(day_of(at))
    .bind(bytes_saved)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn record_failure(conn: &mut SqliteConnection, at: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO processing_stats (date, files_processed, bytes_saved, failures) \
         VALUES (?, 0, 0, 1) \
         ON CONFLICT(date) DO UPDATE SET failures = failures + 1",
    )
    .bind(day_of(at))
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn summary(pool: &SqlitePool, since: NaiveDate) -> Result<StatsSummary, sqlx::Error> {
    let since_text = since.format("%Y-%m-%d").to_string();

    let (files_processed, bytes_saved, failures): (i64, i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(files_processed), 0), COALESCE(SUM(bytes_saved), 0), \
                COALESCE(SUM(failures), 0) \
         FROM processing_stats WHERE date >= ?",
    )
    .bind(&since_text)
    .fetch_one(pool)
    .await?;

    let counts: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM processed_files GROUP BY status")
            .fetch_all(pool)
            .await?;

    let (sync_warnings,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM processed_files \
         WHERE status = 'completed' AND sync_error IS NOT NULL AND updated_at >= ?",
    )
    .bind(
        since
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default(),
    )
    .fetch_one(pool)
    .await?;

    Ok(StatsSummary {
        since,
        files_processed: files_processed.max(0) as u64,
        bytes_saved,
        failures: failures.max(0) as u64,
        sync_warnings: sync_warnings.max(0) as u64,
        by_status: counts
            .into_iter()
            .map(|(status, n)| (status, n.max(0) as u64))
            .collect(),
    })
}

/// Per-day rows, oldest first.
pub async fn daily(pool: &SqlitePool, since: NaiveDate) -> Result<Vec<DailyStats>, sqlx::Error> {
    let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
        "SELECT date, files_processed, bytes_saved, failures FROM processing_stats \
         WHERE date >= ? ORDER BY date ASC",
    )
    .bind(since.format("%Y-%m-%d").to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(date, files_processed, bytes_saved, failures)| DailyStats {
            date,
            files_processed: files_processed.max(0) as u64,
            bytes_saved,
            failures: failures.max(0) as u64,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_accumulate_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");
        let pool = crate::open(path.to_str().unwrap()).await.unwrap();

        // 2024-03-01 12:00:00 UTC
        let at = 1_709_294_400;
        let mut conn = pool.acquire().await.unwrap();
        record_completion(&mut conn, at, 500).await.unwrap();
        record_completion(&mut conn, at + 60, 250).await.unwrap();
        record_failure(&mut conn, at + 120).await.unwrap();
        record_completion(&mut conn, at + 86_400, 1).await.unwrap();
        drop(conn);

        let days = daily(&pool, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, "2024-03-01");
        assert_eq!(days[0].files_processed, 2);
        assert_eq!(days[0].bytes_saved, 750);
        assert_eq!(days[0].failures, 1);

        let later = summary(&pool, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(later.files_processed, 1);
        assert_eq!(later.bytes_saved, 1);
        assert_eq!(later.failures, 0);
    }
}
