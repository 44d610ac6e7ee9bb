//! DNS zone and change-batch bookkeeping. The libvirt network itself
//! carries the primary zone's record set; this table only layers
//! virtual sub-zones (and the append-only change-batch log) on top.

use sqlx::{Executor, Sqlite};

use crate::error::ApiResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRow {
    pub id: String,
    pub name: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    pub id: String,
    pub submitted_at: String,
    pub comment: Option<String>,
}

pub async fn insert_zone<'e, E>(exec: E, id: &str, name: &str, comment: Option<&str>) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO dns_zones (id, name, comment) VALUES (?, ?, ?)")
        .bind(id)
        .bind(name)
        .bind(comment)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn find_zone<'e, E>(exec: E, id: &str) -> ApiResult<Option<ZoneRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, Option<String>)> =
        sqlx::query_as("SELECT id, name, comment FROM dns_zones WHERE id = ?")
            .bind(id)
            .fetch_optional(exec)
            .await?;
    Ok(row.map(|(id, name, comment)| ZoneRow { id, name, comment }))
}

pub async fn find_zone_by_name<'e, E>(exec: E, name: &str) -> ApiResult<Option<ZoneRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, Option<String>)> =
        sqlx::query_as("SELECT id, name, comment FROM dns_zones WHERE name = ?")
            .bind(name)
            .fetch_optional(exec)
            .await?;
    Ok(row.map(|(id, name, comment)| ZoneRow { id, name, comment }))
}

pub async fn list_zones<'e, E>(exec: E) -> ApiResult<Vec<ZoneRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String, String, Option<String>)> =
        sqlx::query_as("SELECT id, name, comment FROM dns_zones ORDER BY name")
            .fetch_all(exec)
            .await?;
    Ok(rows.into_iter().map(|(id, name, comment)| ZoneRow { id, name, comment }).collect())
}

pub async fn delete_zone<'e, E>(exec: E, id: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM dns_zones WHERE id = ?").bind(id).execute(exec).await?;
    Ok(())
}

pub async fn update_zone_comment<'e, E>(exec: E, id: &str, comment: Option<&str>) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE dns_zones SET comment = ? WHERE id = ?")
        .bind(comment)
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Appends a change-batch row; all batches are applied synchronously and
/// are reported `INSYNC` immediately, so only the id/time/comment survive.
pub async fn insert_change<'e, E>(exec: E, id: &str, submitted_at: &str, comment: Option<&str>) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO dns_changes (id, submitted_at, comment) VALUES (?, ?, ?)")
        .bind(id)
        .bind(submitted_at)
        .bind(comment)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn find_change<'e, E>(exec: E, id: &str) -> ApiResult<Option<ChangeRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, Option<String>)> =
        sqlx::query_as("SELECT id, submitted_at, comment FROM dns_changes WHERE id = ?")
            .bind(id)
            .fetch_optional(exec)
            .await?;
    Ok(row.map(|(id, submitted_at, comment)| ChangeRow { id, submitted_at, comment }))
}
