//! Hosted zone CRUD. `ListHostedZones`/`GetHostedZone` are grounded on
//! the source's direct libvirt-network read; `CreateHostedZone`,
//! `DeleteHostedZone`, and `ListHostedZonesByName` have no source
//! counterpart and follow the CRUD shape used elsewhere (launch
//! templates, images) instead.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::route53::{current_network, resolve_zone, zone_names};
use crate::state::AppState;

fn render_zone(id: &str, name: &str, comment: Option<&str>, record_count: usize) -> Value {
    json!({
        "Id": format!("/hostedzone/{id}"),
        "Name": name,
        "Config": { "Comment": comment.unwrap_or(""), "PrivateZone": false },
        "ResourceRecordSetCount": record_count,
    })
}

pub async fn list_hosted_zones(state: &AppState, _args: &Value) -> ApiResult<Value> {
    let net = current_network(state).await?;
    let domain = net.dns_domain.clone().ok_or_else(|| ApiError::internal("libvirt network does not define a domain"))?;
    let zones = db::dns::list_zones(&state.db).await?;
    let names = zone_names(&zones);

    let mut entries = vec![render_zone(
        &net.name,
        &domain,
        Some("libvirt network zone"),
        net.records_for_zone(&domain, &names).len(),
    )];
    for zone in &zones {
        let others: Vec<&str> = names.iter().copied().filter(|n| *n != zone.name).collect();
        entries.push(render_zone(
            &zone.id,
            &zone.name,
            zone.comment.as_deref(),
            net.records_for_zone(&zone.name, &others).len(),
        ));
    }

    Ok(json!({ "HostedZones": entries, "IsTruncated": false }))
}

pub async fn get_hosted_zone(state: &AppState, args: &Value) -> ApiResult<Value> {
    let zone_id = args.require_str("Id")?;
    let net = current_network(state).await?;
    let zone = resolve_zone(state, &net, zone_id).await?;

    let zones = db::dns::list_zones(&state.db).await?;
    let others: Vec<&str> = zone_names(&zones).into_iter().filter(|n| *n != zone.name).collect();

    Ok(json!({
        "HostedZone": render_zone(&zone.id, &zone.name, zone.comment.as_deref(), net.records_for_zone(&zone.name, &others).len()),
        "DelegationSet": { "NameServers": { "NameServer": format!("gw.{}", zone.name) } },
    }))
}

pub async fn create_hosted_zone(state: &AppState, args: &Value) -> ApiResult<Value> {
    let name = args.require_str("Name")?;
    args.require_str("CallerReference")?;

    let net = current_network(state).await?;
    let domain = net.dns_domain.clone().ok_or_else(|| ApiError::internal("libvirt network does not define a domain"))?;

    let fqdn = if name.ends_with('.') { name.to_string() } else { format!("{name}.") };
    if fqdn == domain {
        return Err(ApiError::InvalidParameter(format!("{fqdn} is already the primary hosted zone")));
    }
    if !fqdn.ends_with(&format!(".{domain}")) {
        return Err(ApiError::InvalidParameter(format!("hosted zone name {fqdn} is not a sub-domain of {domain}")));
    }
    if db::dns::find_zone_by_name(&state.db, &fqdn).await?.is_some() {
        return Err(ApiError::InvalidParameter(format!("hosted zone {fqdn} already exists")));
    }

    let id = Uuid::new_v4().simple().to_string();
    db::dns::insert_zone(&state.db, &id, &fqdn, None).await?;

    Ok(json!({
        "HostedZone": render_zone(&id, &fqdn, None, 0),
        "ChangeInfo": { "Id": Uuid::new_v4().simple().to_string(), "Status": "INSYNC" },
        "DelegationSet": { "NameServers": { "NameServer": format!("gw.{domain}") } },
    }))
}

pub async fn update_hosted_zone_comment(state: &AppState, args: &Value) -> ApiResult<Value> {
    let zone_id = args.require_str("Id")?;
    let net = current_network(state).await?;
    if zone_id == net.name {
        return Err(ApiError::InvalidParameter("the primary hosted zone's comment cannot be changed".into()));
    }

    let row = db::dns::find_zone(&state.db, zone_id)
        .await?
        .ok_or_else(|| ApiError::NoSuchHostedZone(format!("zone {zone_id} does not exist")))?;

    let comment = args.str_at("Comment");
    db::dns::update_zone_comment(&state.db, zone_id, comment).await?;

    let zones = db::dns::list_zones(&state.db).await?;
    let others: Vec<&str> = zone_names(&zones).into_iter().filter(|n| *n != row.name).collect();
    Ok(json!({
        "HostedZone": render_zone(&row.id, &row.name, comment, net.records_for_zone(&row.name, &others).len()),
    }))
}

pub async fn delete_hosted_zone(state: &AppState, args: &Value) -> ApiResult<Value> {
    let zone_id = args.require_str("Id")?;
    let net = current_network(state).await?;
    if zone_id == net.name {
        return Err(ApiError::InvalidParameter("the primary hosted zone cannot be deleted".into()));
    }

    let row = db::dns::find_zone(&state.db, zone_id)
        .await?
        .ok_or_else(|| ApiError::NoSuchHostedZone(format!("zone {zone_id} does not exist")))?;

    let zones = db::dns::list_zones(&state.db).await?;
    let others: Vec<&str> = zone_names(&zones).into_iter().filter(|n| *n != row.name).collect();
    let non_trivial = net
        .records_for_zone(&row.name, &others)
        .into_iter()
        .filter(|((typ, _), _)| typ != "SOA" && typ != "NS")
        .count();
    if non_trivial > 0 {
        return Err(ApiError::HostedZoneNotEmpty(format!("zone {zone_id} still has resource record sets")));
    }

    db::dns::delete_zone(&state.db, zone_id).await?;
    Ok(json!({ "ChangeInfo": { "Id": Uuid::new_v4().simple().to_string(), "Status": "INSYNC" } }))
}

pub async fn list_hosted_zones_by_name(state: &AppState, args: &Value) -> ApiResult<Value> {
    let dnsname = args.str_at("dnsname");
    let net = current_network(state).await?;
    let domain = net.dns_domain.clone().ok_or_else(|| ApiError::internal("libvirt network does not define a domain"))?;
    let zones = db::dns::list_zones(&state.db).await?;
    let names = zone_names(&zones);

    let mut all: Vec<(String, String, Option<String>)> = vec![(net.name.clone(), domain, Some("libvirt network zone".to_string()))];
    all.extend(zones.iter().map(|z| (z.id.clone(), z.name.clone(), z.comment.clone())));
    all.sort_by(|a, b| a.1.cmp(&b.1));

    if let Some(start) = dnsname {
        all.retain(|(_, name, _)| name.as_str() >= start);
    }

    let entries: Vec<Value> = all
        .into_iter()
        .map(|(id, name, comment)| {
            let others: Vec<&str> = names.iter().copied().filter(|n| *n != name).collect();
            render_zone(&id, &name, comment.as_deref(), net.records_for_zone(&name, &others).len())
        })
        .collect();

    Ok(json!({ "HostedZones": entries, "IsTruncated": false }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::connect_in_memory;
    use crate::libvirt::FakeDriver;
    use clap::Parser;
    use std::sync::Arc;

    const NETWORK_XML: &str = r#"
        <network>
            <name>default</name>
            <domain name='example.local'/>
            <ip address='10.0.0.1' netmask='255.255.255.0'>
                <dhcp><range start='10.0.0.128' end='10.0.0.254'/></dhcp>
            </ip>
        </network>
    "#;

    async fn test_state() -> AppState {
        let db = connect_in_memory().await;
        let config = Config::parse_from(["libvirt-aws"]);
        let driver = FakeDriver::new();
        driver.networks.lock().await.insert("default".to_string(), NETWORK_XML.to_string());
        AppState::new(db, Arc::new(driver), config)
    }

    #[tokio::test]
    async fn get_primary_zone_by_libvirt_name() {
        let state = test_state().await;
        let result = get_hosted_zone(&state, &json!({ "Id": "default" })).await.unwrap();
        assert_eq!(result["HostedZone"]["Name"], "example.local.");
    }

    #[tokio::test]
    async fn create_rejects_name_outside_primary_domain() {
        let state = test_state().await;
        let err = create_hosted_zone(&state, &json!({ "Name": "app.other.local.", "CallerReference": "c1" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn create_then_delete_sub_zone_round_trips() {
        let state = test_state().await;
        let created = create_hosted_zone(&state, &json!({ "Name": "app.example.local.", "CallerReference": "c1" }))
            .await
            .unwrap();
        let id = created["HostedZone"]["Id"].as_str().unwrap().trim_start_matches("/hostedzone/").to_string();

        delete_hosted_zone(&state, &json!({ "Id": id.clone() })).await.unwrap();

        let err = delete_hosted_zone(&state, &json!({ "Id": id })).await.unwrap_err();
        assert!(matches!(err, ApiError::NoSuchHostedZone(_)));
    }

    #[tokio::test]
    async fn update_comment_on_sub_zone_round_trips() {
        let state = test_state().await;
        let created = create_hosted_zone(&state, &json!({ "Name": "app.example.local.", "CallerReference": "c1" }))
            .await
            .unwrap();
        let id = created["HostedZone"]["Id"].as_str().unwrap().trim_start_matches("/hostedzone/").to_string();

        let updated = update_hosted_zone_comment(&state, &json!({ "Id": id, "Comment": "new comment" })).await.unwrap();
        assert_eq!(updated["HostedZone"]["Config"]["Comment"], "new comment");
    }

    #[tokio::test]
    async fn update_comment_on_primary_zone_is_rejected() {
        let state = test_state().await;
        let err = update_hosted_zone_comment(&state, &json!({ "Id": "default", "Comment": "x" })).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn delete_primary_zone_is_rejected() {
        let state = test_state().await;
        let err = delete_hosted_zone(&state, &json!({ "Id": "default" })).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }
}
