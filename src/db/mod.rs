//! Persistence layer: a single SQLite file holding AWS-only shadow state
//! (tags, addresses, DNS zones/changes, images, launch templates,
//! instances, SSM documents + invocations). libvirt owns the materialized
//! resources; this store owns everything AWS clients expect that libvirt
//! does not track.

pub mod addresses;
pub mod dns;
pub mod images;
pub mod instances;
pub mod launch_templates;
pub mod ssm;
pub mod tags;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use log::LevelFilter;

use crate::error::ApiResult;

pub type Db = SqlitePool;

/// Open (creating if absent) the SQLite file and apply the schema. A
/// single writer connection mirrors the single-writer-lane requirement:
/// every handler serializes on this one pool.
pub async fn connect(path: &Path) -> ApiResult<Db> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(crate::error::ApiError::internal)?
        .create_if_missing(true)
        .log_statements(LevelFilter::Debug);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &Db) -> ApiResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tags (
            resource_name TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            UNIQUE(resource_name, resource_type, key)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ip_addresses (
            allocation_id TEXT UNIQUE NOT NULL,
            ip_address TEXT UNIQUE NOT NULL,
            association_id TEXT UNIQUE,
            instance_id TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS private_ip_addresses (
            ip_address TEXT UNIQUE NOT NULL,
            instance_id TEXT NOT NULL,
            interface TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dns_zones (
            id TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            comment TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dns_changes (
            id TEXT UNIQUE NOT NULL,
            submitted_at TEXT NOT NULL,
            comment TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE TABLE IF NOT EXISTS machine_image (name TEXT UNIQUE NOT NULL)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS launch_template (
            id TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            image_id TEXT NOT NULL,
            data TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS instance (
            id TEXT UNIQUE NOT NULL,
            state TEXT NOT NULL,
            availability_zone TEXT NOT NULL,
            subnet_id TEXT,
            terminated_at TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE TABLE IF NOT EXISTS ssm_documents (name TEXT UNIQUE NOT NULL, content TEXT NOT NULL)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ssm_command_invocations (
            command_id TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            response_code INTEGER NOT NULL,
            stdout TEXT NOT NULL,
            stderr TEXT NOT NULL,
            UNIQUE(command_id, instance_id)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// In-memory pool with the schema already applied, for tests.
pub async fn connect_in_memory() -> Db {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
    create_schema(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_creates_idempotently() {
        let pool = connect_in_memory().await;
        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn connect_creates_file_backed_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");

        let pool = connect(&path).await.unwrap();
        images::insert(&pool, "ami-img1").await.unwrap();
        pool.close().await;

        let reopened = connect(&path).await.unwrap();
        assert!(images::exists(&reopened, "ami-img1").await.unwrap());
    }
}
