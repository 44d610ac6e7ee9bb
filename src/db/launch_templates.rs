//! Launch template storage. Versioning is nominal: every template has
//! exactly one version, reported as both "default" and "latest" (1).

use sqlx::{Executor, Sqlite};

use crate::error::ApiResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplateRow {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub data: String,
}

pub const VERSION_NUMBER: u32 = 1;

pub async fn insert<'e, E>(exec: E, id: &str, name: &str, image_id: &str, data: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO launch_template (id, name, image_id, data) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(name)
        .bind(image_id)
        .bind(data)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn find_by_id<'e, E>(exec: E, id: &str) -> ApiResult<Option<LaunchTemplateRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, String, String)> =
        sqlx::query_as("SELECT id, name, image_id, data FROM launch_template WHERE id = ?")
            .bind(id)
            .fetch_optional(exec)
            .await?;
    Ok(row.map(|(id, name, image_id, data)| LaunchTemplateRow { id, name, image_id, data }))
}

pub async fn find_by_name<'e, E>(exec: E, name: &str) -> ApiResult<Option<LaunchTemplateRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, String, String)> =
        sqlx::query_as("SELECT id, name, image_id, data FROM launch_template WHERE name = ?")
            .bind(name)
            .fetch_optional(exec)
            .await?;
    Ok(row.map(|(id, name, image_id, data)| LaunchTemplateRow { id, name, image_id, data }))
}

pub async fn list<'e, E>(exec: E) -> ApiResult<Vec<LaunchTemplateRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String, String, String, String)> =
        sqlx::query_as("SELECT id, name, image_id, data FROM launch_template ORDER BY name")
            .fetch_all(exec)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(id, name, image_id, data)| LaunchTemplateRow { id, name, image_id, data })
        .collect())
}

pub async fn delete<'e, E>(exec: E, id: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM launch_template WHERE id = ?")
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn insert_then_find_round_trips() {
        let pool = connect_in_memory().await;
        insert(&pool, "lt-1", "web-template", "img-1", r#"{"instanceType":"t3.micro"}"#)
            .await
            .unwrap();
        let row = find_by_id(&pool, "lt-1").await.unwrap().unwrap();
        assert_eq!(row.name, "web-template");
        assert_eq!(find_by_name(&pool, "web-template").await.unwrap().unwrap().id, "lt-1");
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let pool = connect_in_memory().await;
        insert(&pool, "lt-1", "web-template", "img-1", "{}").await.unwrap();
        delete(&pool, "lt-1").await.unwrap();
        assert!(find_by_id(&pool, "lt-1").await.unwrap().is_none());
    }
}
