//! Processing-metric store: one record per terminal job outcome.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{MetricRecord, NewMetric};

#[derive(Clone)]
pub struct MetricStore {
    pool: Pool<Sqlite>,
}

impl MetricStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn record(&self, metric: &NewMetric, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_metrics
                (id, job_type, status, duration_ms, image_count, extraction_count,
                 model, tokens_used, batch_id, project_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(metric.job_type.as_str())
        .bind(metric.status.as_str())
        .bind(metric.duration_ms)
        .bind(metric.image_count)
        .bind(metric.extraction_count)
        .bind(&metric.model)
        .bind(metric.tokens_used)
        .bind(&metric.batch_id)
        .bind(&metric.project_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent metrics, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<MetricRecord>> {
        let metrics = sqlx::query_as(
            "SELECT * FROM processing_metrics ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricStatus;
    use crate::Store;
    use docgrid_protocol::JobType;

    #[tokio::test]
    async fn test_record_and_list() {
        let store = Store::open_memory().await.unwrap();
        let metrics = store.metrics();

        metrics
            .record(
                &NewMetric {
                    job_type: JobType::ProcessBatch,
                    status: MetricStatus::Success,
                    duration_ms: 1200,
                    image_count: 3,
                    extraction_count: 9,
                    model: "vision-1".to_string(),
                    tokens_used: Some(2048),
                    batch_id: "b1".to_string(),
                    project_id: "p1".to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let recent = metrics.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, MetricStatus::Success);
        assert_eq!(recent[0].extraction_count, 9);
        assert_eq!(recent[0].tokens_used, Some(2048));
    }
}
