//! Tag storage: `UPSERT` semantics keyed on (resource_name, resource_type, key).

use sqlx::{Executor, Sqlite};

use crate::error::ApiResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Insert or overwrite tags for a resource. Callers run this inside the
/// same transaction as the resource creation it tags.
pub async fn put_tags<'e, E>(exec: E, resource_name: &str, resource_type: &str, tags: &[Tag]) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite> + Copy,
{
    for tag in tags {
        sqlx::query(
            "INSERT INTO tags (resource_name, resource_type, key, value) VALUES (?, ?, ?, ?)
             ON CONFLICT(resource_name, resource_type, key) DO UPDATE SET value = excluded.value",
        )
        .bind(resource_name)
        .bind(resource_type)
        .bind(&tag.key)
        .bind(&tag.value)
        .execute(exec)
        .await?;
    }
    Ok(())
}

pub async fn remove_tags<'e, E>(exec: E, resource_name: &str, resource_type: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM tags WHERE resource_name = ? AND resource_type = ?")
        .bind(resource_name)
        .bind(resource_type)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn remove_tag<'e, E>(exec: E, resource_name: &str, resource_type: &str, key: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM tags WHERE resource_name = ? AND resource_type = ? AND key = ?")
        .bind(resource_name)
        .bind(resource_type)
        .bind(key)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get_tags<'e, E>(exec: E, resource_name: &str, resource_type: &str) -> ApiResult<Vec<Tag>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM tags WHERE resource_name = ? AND resource_type = ?")
            .bind(resource_name)
            .bind(resource_type)
            .fetch_all(exec)
            .await?;

    Ok(rows.into_iter().map(|(key, value)| Tag { key, value }).collect())
}
