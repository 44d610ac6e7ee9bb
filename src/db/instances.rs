//! Instance shadow rows. libvirt is authoritative for the running state
//! of a domain; this table exists for data AWS clients expect that
//! libvirt doesn't carry (availability zone, subnet, and the brief
//! "terminated" tombstone window before garbage collection).

use sqlx::{Executor, Sqlite};

use crate::error::ApiResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopping,
    Stopped,
    Terminated,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(InstanceState::Running),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            "terminated" => Some(InstanceState::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRow {
    pub id: String,
    pub state: String,
    pub availability_zone: String,
    pub subnet_id: Option<String>,
    pub terminated_at: Option<String>,
}

pub async fn insert<'e, E>(exec: E, id: &str, availability_zone: &str, subnet_id: Option<&str>) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO instance (id, state, availability_zone, subnet_id) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(InstanceState::Running.as_str())
        .bind(availability_zone)
        .bind(subnet_id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn find<'e, E>(exec: E, id: &str) -> ApiResult<Option<InstanceRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT id, state, availability_zone, subnet_id, terminated_at FROM instance WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(exec)
    .await?;
    Ok(row.map(|(id, state, availability_zone, subnet_id, terminated_at)| InstanceRow {
        id,
        state,
        availability_zone,
        subnet_id,
        terminated_at,
    }))
}

pub async fn list<'e, E>(exec: E) -> ApiResult<Vec<InstanceRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String, String, String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT id, state, availability_zone, subnet_id, terminated_at FROM instance ORDER BY id",
    )
    .fetch_all(exec)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, state, availability_zone, subnet_id, terminated_at)| InstanceRow {
            id,
            state,
            availability_zone,
            subnet_id,
            terminated_at,
        })
        .collect())
}

pub async fn set_state<'e, E>(exec: E, id: &str, state: InstanceState) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE instance SET state = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Marks the instance terminated and stamps the tombstone time. A no-op
/// if it was already terminated, mirroring `WHERE terminated_at IS NULL`.
pub async fn terminate<'e, E>(exec: E, id: &str, terminated_at: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE instance SET state = ?, terminated_at = ? WHERE id = ? AND terminated_at IS NULL",
    )
    .bind(InstanceState::Terminated.as_str())
    .bind(terminated_at)
    .bind(id)
    .execute(exec)
    .await?;
    Ok(())
}

/// Deletes terminated rows whose tombstone time is older than `cutoff`
/// (an RFC 3339 timestamp the caller computes as `now - 2 minutes`).
pub async fn gc_terminated<'e, E>(exec: E, cutoff: &str) -> ApiResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM instance WHERE terminated_at IS NOT NULL AND terminated_at < ?")
        .bind(cutoff)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn insert_defaults_to_running() {
        let pool = connect_in_memory().await;
        insert(&pool, "i-1", "us-east-2a", Some("subnet-1")).await.unwrap();
        let row = find(&pool, "i-1").await.unwrap().unwrap();
        assert_eq!(row.state, "running");
        assert_eq!(row.subnet_id.as_deref(), Some("subnet-1"));
    }

    #[tokio::test]
    async fn terminate_is_idempotent_once_tombstoned() {
        let pool = connect_in_memory().await;
        insert(&pool, "i-1", "us-east-2a", None).await.unwrap();
        terminate(&pool, "i-1", "2024-01-01T00:00:00Z").await.unwrap();
        terminate(&pool, "i-1", "2024-01-01T00:05:00Z").await.unwrap();
        let row = find(&pool, "i-1").await.unwrap().unwrap();
        assert_eq!(row.terminated_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn gc_terminated_removes_only_old_tombstones() {
        let pool = connect_in_memory().await;
        insert(&pool, "i-1", "us-east-2a", None).await.unwrap();
        terminate(&pool, "i-1", "2024-01-01T00:00:00Z").await.unwrap();
        insert(&pool, "i-2", "us-east-2a", None).await.unwrap();
        terminate(&pool, "i-2", "2024-01-01T00:10:00Z").await.unwrap();

        let removed = gc_terminated(&pool, "2024-01-01T00:05:00Z").await.unwrap();
        assert_eq!(removed, 1);
        assert!(find(&pool, "i-1").await.unwrap().is_none());
        assert!(find(&pool, "i-2").await.unwrap().is_some());
    }
}
