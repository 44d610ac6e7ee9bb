//! `ListResourceRecordSets`: sort order, offset/limit pagination via
//! binary search over the computed sort key, and synthetic SOA/NS
//! records prepended to every zone's listing.

use serde_json::{json, Value};

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::route53::{current_network, resolve_zone, zone_names};
use crate::state::AppState;

fn name_key(name: &str) -> String {
    name.split('.').rev().collect::<Vec<_>>().join(".")
}

fn sort_key(rec: &((String, String), Vec<String>)) -> (String, String) {
    let ((typ, name), _) = rec;
    (typ.clone(), name_key(name))
}

pub async fn list_resource_record_sets(state: &AppState, args: &Value) -> ApiResult<Value> {
    let zone_id = args.require_str("Id")?;
    let net = current_network(state).await?;
    let zone = resolve_zone(state, &net, zone_id).await?;

    let zones = db::dns::list_zones(&state.db).await?;
    let others: Vec<&str> = zone_names(&zones).into_iter().filter(|n| *n != zone.name).collect();

    let mut records: Vec<((String, String), Vec<String>)> = net
        .records_for_zone(&zone.name, &others)
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let gw = format!("gw.{}", zone.name);
    records.push((
        ("SOA".to_string(), zone.name.clone()),
        vec![format!("{gw} hostmaster.{gw} 1 1200 180 1209600 600")],
    ));
    records.push((("NS".to_string(), zone.name.clone()), vec![gw]));
    records.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    let name = args.str_at("name");
    let record_type = args.str_at("type");
    let max_items = args.str_at("maxitems");

    let offset = match (name, record_type) {
        (Some(name), Some(typ)) => {
            let target = (typ.to_string(), name_key(name));
            records.partition_point(|r| sort_key(r) < target)
        }
        (Some(name), None) => {
            let target = name_key(name);
            records.partition_point(|r| sort_key(r).1 < target)
        }
        (None, Some(_)) => return Err(ApiError::InvalidInput("cannot specify Type without Name".into())),
        (None, None) => 0,
    };

    let limit = match max_items {
        Some(raw) => raw.parse::<usize>().map_err(|_| ApiError::InvalidInput("invalid MaxItems value".into()))?,
        None => records.len(),
    };

    let page: Vec<Value> = records
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|((typ, name), values)| {
            json!({
                "Name": name,
                "Type": typ,
                "TTL": 300,
                "ResourceRecords": values.into_iter().map(|v| json!({ "Value": v })).collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(json!({ "ResourceRecordSets": page, "IsTruncated": false }))
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
                <host ip='10.0.0.10'><hostname>www.example.local</hostname></host>
                <host ip='10.0.0.11'><hostname>api.example.local</hostname></host>
                <txt name='_verify.example.local' value='abc'/>
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
    async fn lists_records_with_synthetic_soa_and_ns_prepended() {
        let state = test_state().await;
        let result = list_resource_record_sets(&state, &json!({ "Id": "default" })).await.unwrap();
        let sets = result["ResourceRecordSets"].as_array().unwrap();
        assert!(sets.iter().any(|r| r["Type"] == "SOA"));
        assert!(sets.iter().any(|r| r["Type"] == "NS"));
        assert!(sets.iter().any(|r| r["Type"] == "A" && r["Name"] == "www.example.local."));
    }

    #[tokio::test]
    async fn max_items_limits_page_size() {
        let state = test_state().await;
        let result = list_resource_record_sets(&state, &json!({ "Id": "default", "maxitems": "1" })).await.unwrap();
        assert_eq!(result["ResourceRecordSets"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn type_without_name_is_rejected() {
        let state = test_state().await;
        let err = list_resource_record_sets(&state, &json!({ "Id": "default", "type": "A" })).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }
}
