//! Machine image registry. A name is the only stored attribute; an
//! image is really just a libvirt domain serving as a `virt-clone`
//! template, registered here under its own name. Names may contain
//! `/`, which is quoted to `%2F` at whatever boundary needs a flat
//! identifier (the dispatcher's URL-ish action framing); this module
//! stores and returns the unquoted form.

use sqlx::{Executor, Sqlite};

use crate::error::ApiResult;

pub async fn insert<'e, E>(exec: E, name: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO machine_image (name) VALUES (?)")
        .bind(name)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn exists<'e, E>(exec: E, name: &str) -> ApiResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT name FROM machine_image WHERE name = ?")
        .bind(name)
        .fetch_optional(exec)
        .await?;
    Ok(row.is_some())
}

pub async fn list<'e, E>(exec: E) -> ApiResult<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM machine_image ORDER BY name")
        .fetch_all(exec)
        .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

pub async fn delete<'e, E>(exec: E, name: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM machine_image WHERE name = ?")
        .bind(name)
        .execute(exec)
        .await?;
    Ok(())
}

/// `quote`/`unquote` mirror the `/` <-> `%2F` boundary encoding: image
/// names commonly look like `pool/debian-12.qcow2`.
pub fn quote_name(name: &str) -> String {
    name.replace('/', "%2F")
}

pub fn unquote_name(quoted: &str) -> String {
    quoted.replace("%2F", "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn insert_then_list_round_trips() {
        let pool = connect_in_memory().await;
        insert(&pool, "default/debian-12.qcow2").await.unwrap();
        assert!(exists(&pool, "default/debian-12.qcow2").await.unwrap());
        assert_eq!(list(&pool).await.unwrap(), vec!["default/debian-12.qcow2".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let pool = connect_in_memory().await;
        insert(&pool, "img-1").await.unwrap();
        delete(&pool, "img-1").await.unwrap();
        assert!(!exists(&pool, "img-1").await.unwrap());
    }

    #[test]
    fn quoting_round_trips_through_slash() {
        assert_eq!(quote_name("default/debian-12.qcow2"), "default%2Fdebian-12.qcow2");
        assert_eq!(unquote_name("default%2Fdebian-12.qcow2"), "default/debian-12.qcow2");
    }
}
