//! Route 53-shaped surface: hosted zones, record sets, change batches.
//! The libvirt network's own DNS domain is always the primary zone;
//! `dns_zones` rows layer virtual sub-zones on top of the same record
//! set, partitioned by name.

pub mod changes;
pub mod diff;
pub mod records;
pub mod tags;
pub mod zones;

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::libvirt::objects::Network;
use crate::state::AppState;

pub async fn current_network(state: &AppState) -> ApiResult<Network> {
    let xml = state.libvirt.network_xml(&state.config.libvirt_network).await?;
    Network::from_xml(&xml)
}

/// A zone resolved to its name, independent of whether it is the
/// primary (libvirt-backed) zone or a persisted sub-zone.
pub struct ZoneInfo {
    pub id: String,
    pub name: String,
    pub comment: Option<String>,
}

pub async fn resolve_zone(state: &AppState, net: &Network, zone_id: &str) -> ApiResult<ZoneInfo> {
    if zone_id == net.name {
        let domain = net
            .dns_domain
            .clone()
            .ok_or_else(|| ApiError::internal("libvirt network does not define a domain"))?;
        return Ok(ZoneInfo { id: net.name.clone(), name: domain, comment: Some("libvirt network zone".to_string()) });
    }

    let row = db::dns::find_zone(&state.db, zone_id)
        .await?
        .ok_or_else(|| ApiError::NoSuchHostedZone(format!("zone {zone_id} does not exist")))?;
    Ok(ZoneInfo { id: row.id, name: row.name, comment: row.comment })
}

pub fn zone_names(zones: &[db::dns::ZoneRow]) -> Vec<&str> {
    zones.iter().map(|z| z.name.as_str()).collect()
}
