//! Shadow storage for elastic IPs and secondary private IPs.
//!
//! Invariant (checked by callers, enforced by the schema only loosely
//! since SQLite has no CHECK-constraint-across-columns support here):
//! `association_id IS NULL <=> instance_id IS NULL`.

use sqlx::{Executor, Sqlite};

use crate::error::ApiResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    pub allocation_id: String,
    pub ip_address: String,
    pub association_id: Option<String>,
    pub instance_id: Option<String>,
}

pub async fn all_ips<'e, E>(exec: E) -> ApiResult<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as("SELECT ip_address FROM ip_addresses")
        .fetch_all(exec)
        .await?;
    Ok(rows.into_iter().map(|(ip,)| ip).collect())
}

pub async fn insert<'e, E>(exec: E, allocation_id: &str, ip_address: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO ip_addresses (allocation_id, ip_address) VALUES (?, ?)")
        .bind(allocation_id)
        .bind(ip_address)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn find_by_allocation_id<'e, E>(exec: E, allocation_id: &str) -> ApiResult<Option<AddressRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT allocation_id, ip_address, association_id, instance_id FROM ip_addresses WHERE allocation_id = ?",
    )
    .bind(allocation_id)
    .fetch_optional(exec)
    .await?;

    Ok(row.map(|(allocation_id, ip_address, association_id, instance_id)| AddressRow {
        allocation_id,
        ip_address,
        association_id,
        instance_id,
    }))
}

pub async fn find_by_ip<'e, E>(exec: E, ip_address: &str) -> ApiResult<Option<AddressRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT allocation_id, ip_address, association_id, instance_id FROM ip_addresses WHERE ip_address = ?",
    )
    .bind(ip_address)
    .fetch_optional(exec)
    .await?;

    Ok(row.map(|(allocation_id, ip_address, association_id, instance_id)| AddressRow {
        allocation_id,
        ip_address,
        association_id,
        instance_id,
    }))
}

pub async fn find_by_association_id<'e, E>(exec: E, association_id: &str) -> ApiResult<Option<AddressRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT allocation_id, ip_address, association_id, instance_id FROM ip_addresses WHERE association_id = ?",
    )
    .bind(association_id)
    .fetch_optional(exec)
    .await?;

    Ok(row.map(|(allocation_id, ip_address, association_id, instance_id)| AddressRow {
        allocation_id,
        ip_address,
        association_id,
        instance_id,
    }))
}

pub async fn associate<'e, E>(
    exec: E,
    allocation_id: &str,
    association_id: &str,
    instance_id: &str,
) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE ip_addresses SET association_id = ?, instance_id = ? WHERE allocation_id = ?")
        .bind(association_id)
        .bind(instance_id)
        .bind(allocation_id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn disassociate<'e, E>(exec: E, association_id: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE ip_addresses SET association_id = NULL, instance_id = NULL WHERE association_id = ?")
        .bind(association_id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn release<'e, E>(exec: E, allocation_id: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM ip_addresses WHERE allocation_id = ?")
        .bind(allocation_id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn insert_private_ip<'e, E>(exec: E, ip_address: &str, instance_id: &str, interface: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO private_ip_addresses (ip_address, instance_id, interface) VALUES (?, ?, ?)")
        .bind(ip_address)
        .bind(instance_id)
        .bind(interface)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn delete_private_ip<'e, E>(exec: E, ip_address: &str) -> ApiResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM private_ip_addresses WHERE ip_address = ?")
        .bind(ip_address)
        .execute(exec)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn allocate_then_release_round_trips() {
        let pool = connect_in_memory().await;
        insert(&pool, "eipalloc-1", "10.0.0.16").await.unwrap();
        assert_eq!(all_ips(&pool).await.unwrap(), vec!["10.0.0.16".to_string()]);

        let row = find_by_allocation_id(&pool, "eipalloc-1").await.unwrap().unwrap();
        assert_eq!(row.ip_address, "10.0.0.16");
        assert!(row.instance_id.is_none());

        release(&pool, "eipalloc-1").await.unwrap();
        assert!(find_by_allocation_id(&pool, "eipalloc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn associate_then_disassociate_clears_instance_fields() {
        let pool = connect_in_memory().await;
        insert(&pool, "eipalloc-1", "10.0.0.16").await.unwrap();
        associate(&pool, "eipalloc-1", "eipassoc-1", "i-1").await.unwrap();

        let row = find_by_allocation_id(&pool, "eipalloc-1").await.unwrap().unwrap();
        assert_eq!(row.instance_id.as_deref(), Some("i-1"));
        assert_eq!(row.association_id.as_deref(), Some("eipassoc-1"));

        disassociate(&pool, "eipassoc-1").await.unwrap();
        let row = find_by_allocation_id(&pool, "eipalloc-1").await.unwrap().unwrap();
        assert!(row.instance_id.is_none());
        assert!(row.association_id.is_none());
    }
}
