//! SSM document store and command-invocation results. A document's
//! content is stored exactly as submitted (JSON or YAML); only the
//! single `mainStep`/`mainSteps[0]` shape is ever dispatched.

use sqlx::{Executor, Sqlite};

use crate::error::ApiResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRow {
    pub command_id: String,
    pub instance_id: String,
    pub response_code: i64,
    pub stdout: String,
    pub stderr: String,
}

pub async fn put_document<'e, E>(exec: E, name: &str, content: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO ssm_documents (name, content) VALUES (?, ?)
         ON CONFLICT(name) DO UPDATE SET content = excluded.content",
    )
    .bind(name)
    .bind(content)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn find_document<'e, E>(exec: E, name: &str) -> ApiResult<Option<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT content FROM ssm_documents WHERE name = ?")
        .bind(name)
        .fetch_optional(exec)
        .await?;
    Ok(row.map(|(content,)| content))
}

pub async fn list_documents<'e, E>(exec: E) -> ApiResult<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM ssm_documents ORDER BY name")
        .fetch_all(exec)
        .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

pub async fn delete_document<'e, E>(exec: E, name: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM ssm_documents WHERE name = ?")
        .bind(name)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn record_invocation<'e, E>(
    exec: E,
    command_id: &str,
    instance_id: &str,
    response_code: i64,
    stdout: &str,
    stderr: &str,
) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO ssm_command_invocations (command_id, instance_id, response_code, stdout, stderr)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(command_id, instance_id) DO UPDATE SET
            response_code = excluded.response_code, stdout = excluded.stdout, stderr = excluded.stderr",
    )
    .bind(command_id)
    .bind(instance_id)
    .bind(response_code)
    .bind(stdout)
    .bind(stderr)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn find_invocation<'e, E>(exec: E, command_id: &str, instance_id: &str) -> ApiResult<Option<InvocationRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, i64, String, String)> = sqlx::query_as(
        "SELECT command_id, instance_id, response_code, stdout, stderr
         FROM ssm_command_invocations WHERE command_id = ? AND instance_id = ?",
    )
    .bind(command_id)
    .bind(instance_id)
    .fetch_optional(exec)
    .await?;
    Ok(row.map(|(command_id, instance_id, response_code, stdout, stderr)| InvocationRow {
        command_id,
        instance_id,
        response_code,
        stdout,
        stderr,
    }))
}
