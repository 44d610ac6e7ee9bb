//! Elastic IP and secondary private IP address handlers.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::libvirt::{objects::Network, LibvirtDriver};
use crate::state::AppState;

/// Real AWS supports a `Filter` list (tag:, public-ip, instance-id,
/// allocation-id, association-id); this host only needs to return every
/// row, which is all a single-tenant test double's clients actually
/// filter over client-side.
pub async fn describe_addresses(state: &AppState, _args: &Value) -> ApiResult<Value> {
    let mut addresses = Vec::new();
    for ip in db::addresses::all_ips(&state.db).await? {
        let Some(row) = db::addresses::find_by_ip(&state.db, &ip).await? else { continue };
        let tags = db::tags::get_tags(&state.db, &row.ip_address, "ip_address").await?;
        addresses.push(json!({
            "publicIp": row.ip_address,
            "instanceId": row.instance_id,
            "allocationId": row.allocation_id,
            "associationId": row.association_id,
            "domain": "vpc",
            "tagSet": tags.iter().map(|t| json!({"key": t.key, "value": t.value})).collect::<Vec<_>>(),
        }));
    }
    Ok(json!({ "addressesSet": addresses }))
}

pub async fn allocate_address(state: &AppState, args: &Value) -> ApiResult<Value> {
    if args.str_at("Address").is_some() {
        return Err(ApiError::InvalidParameter("claiming existing addresses is not supported".into()));
    }
    if let Some(domain) = args.str_at("Domain") {
        if domain != "vpc" {
            return Err(ApiError::InvalidParameter("standard domain is not supported".into()));
        }
    }

    let existing: std::collections::HashSet<String> = db::addresses::all_ips(&state.db).await?.into_iter().collect();

    let network_xml = state.libvirt.network_xml(&state.config.libvirt_network).await?;
    let network = Network::from_xml(&network_xml)?;
    let (start, end) = network.static_ip_range()?;

    let address = first_free_address(start, end, &existing)
        .ok_or_else(|| ApiError::AddressLimitExceeded("libvirt network is out of static addresses".into()))?;

    let allocation_id = format!("eipalloc-{}", Uuid::new_v4());

    let mut tx = state.db.begin().await?;
    db::addresses::insert(&mut *tx, &allocation_id, &address.to_string()).await?;
    if let Some(tags) = extract_tag_specs(args) {
        db::tags::put_tags(&mut *tx, &address.to_string(), "ip_address", &tags).await?;
    }
    tx.commit().await?;

    Ok(json!({ "publicIp": address.to_string(), "domain": "vpc", "allocationId": allocation_id }))
}

/// Public block occupies the first 16 addresses of the static range;
/// allocation always prefers that block first.
fn first_free_address(start: Ipv4Addr, end: Ipv4Addr, existing: &std::collections::HashSet<String>) -> Option<Ipv4Addr> {
    let start_u = u32::from(start);
    let end_u = u32::from(end);
    (start_u..end_u).map(Ipv4Addr::from).find(|addr| !existing.contains(&addr.to_string()))
}

fn extract_tag_specs(args: &Value) -> Option<Vec<db::tags::Tag>> {
    let specs = args.list_at("TagSpecification");
    if specs.is_empty() {
        return None;
    }
    let mut tags = Vec::new();
    for spec in specs {
        for tag in spec.list_at("Tag") {
            if let (Some(key), Some(value)) = (tag.str_at("Key"), tag.str_at("Value")) {
                tags.push(db::tags::Tag { key: key.to_string(), value: value.to_string() });
            }
        }
    }
    if tags.is_empty() {
        None
    } else {
        Some(tags)
    }
}

pub async fn associate_address(state: &AppState, args: &Value) -> ApiResult<Value> {
    let alloc_id = args.require_str("AllocationId")?;
    let instance_id = args.require_str("InstanceId")?;

    let row = db::addresses::find_by_allocation_id(&state.db, alloc_id)
        .await?
        .ok_or_else(|| ApiError::AddressIdNotFound("could not find address for specified AllocationId".into()))?;

    state.libvirt.domain_xml(instance_id).await.map_err(|_| ApiError::InstanceNotFound(instance_id.to_string()))?;

    let network_xml = state.libvirt.network_xml(&state.config.libvirt_network).await?;
    let network = Network::from_xml(&network_xml)?;

    if let Some(prev_instance) = row.instance_id.clone() {
        if let Ok(iface) = find_interface(state, &prev_instance, &network).await {
            let _ = exec_ip_command(state, &prev_instance, &["addr", "del", &row.ip_address, "dev", &iface]).await;
        }
    }

    let iface = find_interface(state, instance_id, &network).await?;
    let result = exec_ip_command(state, instance_id, &["addr", "add", &row.ip_address, "dev", &iface]).await?;
    if result.exit_code != 0 {
        return Err(ApiError::internal(format!(
            "could not assign address in VM: {}\n{}",
            result.exit_code, result.stderr
        )));
    }

    let assoc_id = format!("eipassoc-{}", Uuid::new_v4());
    db::addresses::associate(&state.db, alloc_id, &assoc_id, instance_id).await?;

    Ok(json!({ "return": true, "associationId": assoc_id }))
}

pub async fn disassociate_address(state: &AppState, args: &Value) -> ApiResult<Value> {
    let assoc_id = args.require_str("AssociationId")?;

    let row = db::addresses::find_by_association_id(&state.db, assoc_id)
        .await?
        .ok_or_else(|| ApiError::AssociationIdNotFound("could not find address for specified AssociationId".into()))?;

    if let Some(instance_id) = row.instance_id.clone() {
        let network_xml = state.libvirt.network_xml(&state.config.libvirt_network).await?;
        let network = Network::from_xml(&network_xml)?;
        if let Ok(iface) = find_interface(state, &instance_id, &network).await {
            let _ = exec_ip_command(state, &instance_id, &["addr", "del", &row.ip_address, "dev", &iface]).await;
        }
    }

    db::addresses::disassociate(&state.db, assoc_id).await?;
    Ok(json!({ "return": true }))
}

pub async fn release_address(state: &AppState, args: &Value) -> ApiResult<Value> {
    let alloc_id = args.require_str("AllocationId")?;
    let row = db::addresses::find_by_allocation_id(&state.db, alloc_id)
        .await?
        .ok_or_else(|| ApiError::AddressNotFound("could not find address for specified AllocationId".into()))?;

    if let Some(instance_id) = row.instance_id {
        return Err(ApiError::AddressInUse(format!(
            "specified address is in use by instance {instance_id}, call DisassociateAddress first"
        )));
    }

    db::addresses::release(&state.db, alloc_id).await?;
    Ok(json!({ "return": true }))
}

/// Allocates `count` unused addresses above the public block and assigns
/// each to `instance_id` as a secondary private IP via in-guest `ip addr
/// add`. Rolls back every partially-inserted row on any failure.
pub async fn assign_private_ip_addresses(state: &AppState, args: &Value) -> ApiResult<Value> {
    let instance_id = match args.str_at("NetworkInterfaceId") {
        Some(eni) => parse_instance_from_eni(eni)?,
        None => args.require_str("InstanceId")?.to_string(),
    };
    let count: usize = args.str_at("SecondaryPrivateIpAddressCount").and_then(|s| s.parse().ok()).unwrap_or(1);

    let network_xml = state.libvirt.network_xml(&state.config.libvirt_network).await?;
    let network = Network::from_xml(&network_xml)?;
    let (static_start, dhcp_start) = network.static_ip_range()?;
    let public_block_end = u32::from(static_start).saturating_add(16).min(u32::from(dhcp_start));

    let existing: std::collections::HashSet<String> =
        db::addresses::all_ips(&state.db).await?.into_iter().collect();

    let iface = find_interface(state, &instance_id, &network).await?;

    let mut assigned = Vec::new();
    let mut cursor = public_block_end;
    while assigned.len() < count && cursor < u32::from(dhcp_start) {
        let addr = Ipv4Addr::from(cursor);
        cursor += 1;
        if existing.contains(&addr.to_string()) {
            continue;
        }
        let result = exec_ip_command(state, &instance_id, &["addr", "add", &addr.to_string(), "dev", &iface]).await;
        match result {
            Ok(r) if r.exit_code == 0 => {
                db::addresses::insert_private_ip(&state.db, &addr.to_string(), &instance_id, &iface).await?;
                assigned.push(addr.to_string());
            }
            _ => {
                for ip in &assigned {
                    db::addresses::delete_private_ip(&state.db, ip).await?;
                }
                return Err(ApiError::internal("failed to assign secondary private IP address"));
            }
        }
    }

    if assigned.len() < count {
        for ip in &assigned {
            db::addresses::delete_private_ip(&state.db, ip).await?;
        }
        return Err(ApiError::internal("static range exhausted while assigning private IP addresses"));
    }

    Ok(json!({ "assignedPrivateIpAddressesSet": assigned }))
}

fn parse_instance_from_eni(eni: &str) -> ApiResult<String> {
    let rest = eni.strip_prefix("eni-").ok_or_else(|| ApiError::InvalidParameter("malformed NetworkInterfaceId".into()))?;
    let (instance_id, _ifname) = rest
        .split_once("::")
        .ok_or_else(|| ApiError::InvalidParameter("malformed NetworkInterfaceId".into()))?;
    Ok(instance_id.to_string())
}

#[derive(Deserialize)]
struct AddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

#[derive(Deserialize)]
struct IfaceDesc {
    ifname: String,
    addr_info: Vec<AddrInfo>,
}

/// Matches the VM's interfaces against the libvirt network's subnet by
/// address, since the VM has no notion of "the libvirt network".
async fn find_interface(state: &AppState, instance_id: &str, network: &Network) -> ApiResult<String> {
    let result = exec_ip_command(state, instance_id, &["-json", "addr", "show"]).await?;
    if result.exit_code != 0 {
        return Err(ApiError::internal("could not list VM network interfaces"));
    }
    let interfaces: Vec<IfaceDesc> = serde_json::from_str(&result.stdout).map_err(ApiError::internal)?;

    let (net_addr, prefix) =
        network.ipv4_network.ok_or_else(|| ApiError::internal("libvirt network has no IPv4 address"))?;
    for iface in interfaces {
        for addr in &iface.addr_info {
            if addr.family != "inet" {
                continue;
            }
            if addr.prefixlen != prefix {
                continue;
            }
            if let Ok(candidate) = addr.local.parse::<Ipv4Addr>() {
                if same_network(candidate, net_addr, prefix) {
                    return Ok(iface.ifname);
                }
            }
        }
    }
    Err(ApiError::internal(format!("could not find interface for network {net_addr}/{prefix}")))
}

fn same_network(a: Ipv4Addr, b: Ipv4Addr, prefix: u8) -> bool {
    let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
    u32::from(a) & mask == u32::from(b) & mask
}

async fn exec_ip_command(
    state: &AppState,
    instance_id: &str,
    args: &[&str],
) -> ApiResult<crate::libvirt::guest_agent::ExecResult> {
    let driver: Arc<dyn LibvirtDriver> = Arc::clone(&state.libvirt);
    let args = args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    crate::libvirt::guest_agent::exec_and_wait(&driver, instance_id, "ip", &args, &[], None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::connect_in_memory;
    use crate::libvirt::FakeDriver;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use clap::Parser;

    const NETWORK_XML: &str = r#"
        <network>
            <name>default</name>
            <domain name='example.local'/>
            <ip address='10.0.0.1' netmask='255.255.255.0'>
                <dhcp><range start='10.0.0.128' end='10.0.0.254'/></dhcp>
            </ip>
        </network>
    "#;

    async fn test_state() -> (AppState, Arc<FakeDriver>) {
        let db = connect_in_memory().await;
        let config = Config::parse_from(["libvirt-aws"]);
        let driver = Arc::new(FakeDriver::new());
        driver.networks.lock().await.insert("default".to_string(), NETWORK_XML.to_string());
        let state = AppState::new(db, Arc::clone(&driver) as Arc<dyn LibvirtDriver>, config);
        (state, driver)
    }

    async fn queue_exec(driver: &FakeDriver, stdout: &str) {
        let mut responses = driver.agent_responses.lock().await;
        responses.push(json!({"return": {"pid": 1}}).to_string());
        responses.push(
            json!({
                "return": { "exited": true, "exitcode": 0, "out-data": BASE64.encode(stdout), "err-data": "" }
            })
            .to_string(),
        );
    }

    fn addr_show(iface: &str, addr: &str) -> String {
        json!([{ "ifname": iface, "addr_info": [{ "family": "inet", "local": addr, "prefixlen": 24 }] }]).to_string()
    }

    #[tokio::test]
    async fn allocate_then_release_then_reallocate_yields_same_address() {
        let (state, _driver) = test_state().await;
        let first = allocate_address(&state, &json!({})).await.unwrap();
        let ip = first["publicIp"].as_str().unwrap().to_string();
        let alloc_id = first["allocationId"].as_str().unwrap().to_string();

        release_address(&state, &json!({ "AllocationId": alloc_id })).await.unwrap();

        let second = allocate_address(&state, &json!({})).await.unwrap();
        assert_eq!(second["publicIp"], ip);
    }

    #[tokio::test]
    async fn allocate_claiming_existing_address_is_rejected() {
        let (state, _driver) = test_state().await;
        let err = allocate_address(&state, &json!({ "Address": "10.0.0.2" })).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn associate_then_disassociate_round_trips() {
        let (state, driver) = test_state().await;
        state.libvirt.clone_and_start_domain("base", "i-1").await.unwrap();
        let allocated = allocate_address(&state, &json!({})).await.unwrap();
        let alloc_id = allocated["allocationId"].as_str().unwrap().to_string();

        queue_exec(&driver, &addr_show("eth0", "10.0.0.5")).await;
        queue_exec(&driver, "").await;
        let associated = associate_address(&state, &json!({ "AllocationId": alloc_id, "InstanceId": "i-1" }))
            .await
            .unwrap();
        assert_eq!(associated["return"], true);
        let assoc_id = associated["associationId"].as_str().unwrap().to_string();

        disassociate_address(&state, &json!({ "AssociationId": assoc_id })).await.unwrap();
        let described = describe_addresses(&state, &json!({})).await.unwrap();
        assert_eq!(described["addressesSet"][0]["instanceId"], Value::Null);
    }

    #[tokio::test]
    async fn release_in_use_address_is_rejected() {
        let (state, driver) = test_state().await;
        state.libvirt.clone_and_start_domain("base", "i-1").await.unwrap();
        let allocated = allocate_address(&state, &json!({})).await.unwrap();
        let alloc_id = allocated["allocationId"].as_str().unwrap().to_string();

        queue_exec(&driver, &addr_show("eth0", "10.0.0.5")).await;
        queue_exec(&driver, "").await;
        associate_address(&state, &json!({ "AllocationId": alloc_id, "InstanceId": "i-1" })).await.unwrap();

        let err = release_address(&state, &json!({ "AllocationId": alloc_id })).await.unwrap_err();
        assert!(matches!(err, ApiError::AddressInUse(_)));
    }

    #[test]
    fn first_free_address_skips_existing() {
        let existing: std::collections::HashSet<String> = ["10.0.0.2".to_string()].into_iter().collect();
        let addr = first_free_address(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 128), &existing).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 3));
    }
}
