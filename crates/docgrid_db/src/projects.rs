//! Project store.

use chrono::{DateTime, Utc};
use docgrid_protocol::Project;
use sqlx::{Pool, Sqlite};

use crate::error::{DbError, Result};
use crate::models::ProjectRecord;

#[derive(Clone)]
pub struct ProjectStore {
    pool: Pool<Sqlite>,
}

impl ProjectStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Persist a project configuration. The schema is validated before the
    /// write so the store never holds a project with duplicate column ids.
    pub async fn create_project(&self, project: &Project, now: DateTime<Utc>) -> Result<()> {
        project
            .validate()
            .map_err(|e| DbError::constraint(e.to_string()))?;
        let columns_json = serde_json::to_string(&project.columns)?;

        sqlx::query(
            r#"
            INSERT INTO projects
                (id, owner_id, name, columns_json,
                 bounding_boxes, confidence_scores, multi_row_extraction, toon_output,
                 endpoint_url, model, api_key,
                 requests_per_minute, enable_parallel_requests, parallel_request_limit,
                 request_timeout_secs, coordinate_format, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.owner_id)
        .bind(&project.name)
        .bind(columns_json)
        .bind(project.flags.bounding_boxes)
        .bind(project.flags.confidence_scores)
        .bind(project.flags.multi_row_extraction)
        .bind(project.flags.toon_output)
        .bind(&project.llm.endpoint_url)
        .bind(&project.llm.model)
        .bind(&project.llm.api_key)
        .bind(project.limits.requests_per_minute as i64)
        .bind(project.limits.enable_parallel_requests)
        .bind(project.limits.parallel_request_limit as i64)
        .bind(project.request_timeout_secs as i64)
        .bind(project.coordinate_format.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_record(&self, project_id: &str) -> Result<Option<ProjectRecord>> {
        let record = sqlx::query_as("SELECT * FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Load and decode a project; `NotFound` when it does not exist.
    pub async fn get_project(&self, project_id: &str) -> Result<Project> {
        let record = self
            .get_record(project_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("project {project_id}")))?;
        record.into_project()
    }

    /// Ownership check for adapter-level authorization.
    pub async fn owned_by(&self, project_id: &str, user_id: &str) -> Result<bool> {
        let owner: Option<String> = sqlx::query_scalar("SELECT owner_id FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner.as_deref() == Some(user_id))
    }

    /// Update the throttle settings of an existing project; takes effect on
    /// the pool's next admission decision.
    pub async fn update_rate_limits(
        &self,
        project_id: &str,
        requests_per_minute: u32,
        enable_parallel_requests: bool,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE projects
            SET requests_per_minute = ?, enable_parallel_requests = ?
            WHERE id = ?
            "#,
        )
        .bind(requests_per_minute as i64)
        .bind(enable_parallel_requests)
        .bind(project_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DbError::not_found(format!("project {project_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use docgrid_protocol::{
        ColumnDefinition, ColumnType, CoordinateFormat, FeatureFlags, LlmSettings,
        RateLimitSettings,
    };

    fn sample_project() -> Project {
        Project {
            id: "p1".to_string(),
            owner_id: "u1".to_string(),
            name: "Receipts".to_string(),
            columns: vec![ColumnDefinition {
                id: "total".to_string(),
                name: "Total".to_string(),
                column_type: ColumnType::Currency,
                description: Some("Grand total of the receipt".to_string()),
                allowed_values: None,
                validation_pattern: None,
            }],
            flags: FeatureFlags::default(),
            llm: LlmSettings {
                endpoint_url: "https://llm.example/v1/chat/completions".to_string(),
                model: "vision-1".to_string(),
                api_key: "secret".to_string(),
            },
            limits: RateLimitSettings::default(),
            request_timeout_secs: 60,
            coordinate_format: CoordinateFormat::default(),
        }
    }

    #[tokio::test]
    async fn test_project_round_trip() {
        let store = Store::open_memory().await.unwrap();
        let projects = store.projects();
        projects.create_project(&sample_project(), Utc::now()).await.unwrap();

        let loaded = projects.get_project("p1").await.unwrap();
        assert_eq!(loaded.name, "Receipts");
        assert_eq!(loaded.columns.len(), 1);
        assert_eq!(loaded.columns[0].column_type, ColumnType::Currency);
        assert_eq!(loaded.limits.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_project_is_not_found() {
        let store = Store::open_memory().await.unwrap();
        let err = store.projects().get_project("nope").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_owned_by() {
        let store = Store::open_memory().await.unwrap();
        let projects = store.projects();
        projects.create_project(&sample_project(), Utc::now()).await.unwrap();

        assert!(projects.owned_by("p1", "u1").await.unwrap());
        assert!(!projects.owned_by("p1", "someone-else").await.unwrap());
        assert!(!projects.owned_by("ghost", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_rate_limits() {
        let store = Store::open_memory().await.unwrap();
        let projects = store.projects();
        projects.create_project(&sample_project(), Utc::now()).await.unwrap();

        projects.update_rate_limits("p1", 2, true).await.unwrap();
        let loaded = projects.get_project("p1").await.unwrap();
        assert_eq!(loaded.limits.requests_per_minute, 2);
        assert!(loaded.limits.enable_parallel_requests);
    }
}
