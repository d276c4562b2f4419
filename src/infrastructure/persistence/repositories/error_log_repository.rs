use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;

const MESSAGE_MAX: usize = 2 * 1024;
const STACK_MAX: usize = 8 * 1024;
const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One structured error-ledger row.
#[derive(Debug, Clone)]
pub struct ErrorLogRow {
    pub id: Option<i64>,
    pub logged_at: DateTime<Utc>,
    pub severity: Severity,
    pub service: String,
    pub module: String,
    pub message: String,
    pub stack: Option<String>,
    pub type_tag: String,
    pub correlation_id: Option<String>,
}

impl ErrorLogRow {
    pub fn new(
        severity: Severity,
        module: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            logged_at: Utc::now(),
            severity,
            service: "kquant".to_string(),
            module: module.into(),
            message: message.into(),
            stack: None,
            type_tag: String::new(),
            correlation_id: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_type_tag(mut self, tag: impl Into<String>) -> Self {
        self.type_tag = tag.into();
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Long strings are cut at the limit with an explicit marker, never
/// silently.
fn truncate_marked(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max - TRUNCATION_MARKER.len();
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], TRUNCATION_MARKER)
}

pub struct ErrorLogRepository {
    database: Database,
}

impl ErrorLogRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn insert(&self, row: &ErrorLogRow) -> Result<i64> {
        let message = truncate_marked(&row.message, MESSAGE_MAX);
        let stack = row.stack.as_deref().map(|s| truncate_marked(s, STACK_MAX));

        let result = sqlx::query(
            r#"
            INSERT INTO error_logs (
                logged_at, severity, service, module, message, stack,
                type_tag, correlation_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(row.logged_at)
        .bind(row.severity.to_string())
        .bind(&row.service)
        .bind(&row.module)
        .bind(message)
        .bind(stack)
        .bind(&row.type_tag)
        .bind(&row.correlation_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to insert error log row")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn resolve(&self, id: i64, note: &str) -> Result<()> {
        sqlx::query(
            "UPDATE error_logs SET resolved_at = CURRENT_TIMESTAMP, resolution_note = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(note)
        .execute(&self.database.pool)
        .await
        .context("Failed to resolve error log row")?;
        Ok(())
    }

    /// System errors in the trailing hour; feeds the circuit breaker's
    /// error-spike trigger.
    pub async fn errors_in_last_hour(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM error_logs
            WHERE severity IN ('ERROR', 'CRITICAL')
              AND logged_at >= DATETIME('now', '-1 hour')
            "#,
        )
        .fetch_one(&self.database.pool)
        .await
        .context("Failed to count recent errors")?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_count() {
        let db = Database::in_memory().await.unwrap();
        let repo = ErrorLogRepository::new(db);

        for _ in 0..3 {
            repo.insert(
                &ErrorLogRow::new(Severity::Error, "phase2", "batch 5 failed")
                    .with_type_tag("batch_failure")
                    .with_correlation_id("c-123"),
            )
            .await
            .unwrap();
        }
        repo.insert(&ErrorLogRow::new(Severity::Info, "scheduler", "catch-up done"))
            .await
            .unwrap();

        assert_eq!(repo.errors_in_last_hour().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_resolve() {
        let db = Database::in_memory().await.unwrap();
        let repo = ErrorLogRepository::new(db);
        let id = repo
            .insert(&ErrorLogRow::new(Severity::Warning, "cache", "redis down"))
            .await
            .unwrap();
        repo.resolve(id, "redis recovered").await.unwrap();
    }

    #[test]
    fn test_truncation_has_marker() {
        let long = "x".repeat(MESSAGE_MAX + 100);
        let cut = truncate_marked(&long, MESSAGE_MAX);
        assert_eq!(cut.len(), MESSAGE_MAX);
        assert!(cut.ends_with(TRUNCATION_MARKER));

        let short = "all fine";
        assert_eq!(truncate_marked(short, MESSAGE_MAX), short);
    }
}
