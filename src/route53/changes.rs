//! `ChangeResourceRecordSets`: parse the change-batch XML body, apply it
//! to a working copy of the zone's record table, then diff that against
//! the live libvirt record set and push the resulting ops. `GetChange`
//! just replays the logged row; every batch here is synchronous and
//! always reports `INSYNC`.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::libvirt::objects::RecordTable;
use crate::route53::{current_network, diff, resolve_zone};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeAction {
    Create,
    Delete,
    Upsert,
}

struct ChangeEntry {
    action: ChangeAction,
    record_type: String,
    name: String,
    values: Vec<String>,
}

struct ParsedBatch {
    comment: String,
    changes: Vec<ChangeEntry>,
}

fn parse_change_batch(xml: &str) -> ApiResult<ParsedBatch> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut comment = String::new();
    let mut changes = Vec::new();

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut cur_action: Option<String> = None;
    let mut cur_name: Option<String> = None;
    let mut cur_type: Option<String> = None;
    let mut cur_values: Vec<String> = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| ApiError::InvalidInput(e.to_string()))? {
            Event::Eof => break,
            Event::Start(e) => {
                let local = e.local_name().as_ref().to_vec();
                if local == b"Change" {
                    cur_action = None;
                    cur_name = None;
                    cur_type = None;
                    cur_values = Vec::new();
                }
                stack.push(local);
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| ApiError::InvalidInput(e.to_string()))?.into_owned();
                let parent = stack.last().map(|v| v.as_slice());
                let grandparent = stack.get(stack.len().wrapping_sub(2)).map(|v| v.as_slice());
                match parent {
                    Some(b"Comment") => comment = text,
                    Some(b"Action") => cur_action = Some(text),
                    Some(b"Name") if grandparent == Some(b"ResourceRecordSet") => cur_name = Some(text),
                    Some(b"Type") if grandparent == Some(b"ResourceRecordSet") => cur_type = Some(text),
                    Some(b"Value") => cur_values.push(text),
                    _ => {}
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"Change" {
                    let action = match cur_action.take().as_deref() {
                        Some("CREATE") => ChangeAction::Create,
                        Some("DELETE") => ChangeAction::Delete,
                        Some("UPSERT") => ChangeAction::Upsert,
                        Some(other) => return Err(ApiError::InvalidInput(format!("Action = {other} is not supported"))),
                        None => return Err(ApiError::InvalidInput("input is not valid".into())),
                    };
                    let name = cur_name.take().ok_or_else(|| ApiError::InvalidInput("input is not valid".into()))?;
                    let record_type = cur_type.take().ok_or_else(|| ApiError::InvalidInput("input is not valid".into()))?;
                    let values = std::mem::take(&mut cur_values);
                    if values.is_empty() {
                        return Err(ApiError::InvalidInput("input is not valid".into()));
                    }
                    changes.push(ChangeEntry { action, record_type, name, values });
                }
                stack.pop();
            }
            _ => {}
        }
        buf.clear();
    }

    if changes.is_empty() {
        return Err(ApiError::InvalidInput("input is not valid".into()));
    }

    Ok(ParsedBatch { comment, changes })
}

/// `CNAME` is not a libvirt record type; resolve it once, at write time,
/// to the addresses its target currently answers with and fold those in
/// as A records. Never re-resolved afterward (see design notes).
async fn resolve_cnames(mut table: RecordTable) -> ApiResult<RecordTable> {
    let cname_keys: Vec<_> = table.keys().filter(|(t, _)| t == "CNAME").cloned().collect();
    for key in cname_keys {
        let (_, name) = key.clone();
        let targets = table.remove(&key).unwrap_or_default();
        let mut resolved = Vec::new();
        for target in &targets {
            let host = target.trim_end_matches('.');
            let addrs = tokio::net::lookup_host((host, 0)).await.map_err(ApiError::internal)?;
            resolved.extend(addrs.map(|a| a.ip().to_string()));
        }
        if !resolved.is_empty() {
            table.entry(("A".to_string(), name)).or_default().extend(resolved);
        }
    }
    Ok(table)
}

pub async fn change_resource_record_sets(state: &AppState, args: &Value) -> ApiResult<Value> {
    let zone_id = args.require_str("Id")?;
    let net = current_network(state).await?;
    resolve_zone(state, &net, zone_id).await?;

    let body = args.require_str("BodyText")?;
    let batch = parse_change_batch(body)?;

    let mut table: RecordTable = net.records.clone();
    let pre_existing: std::collections::HashSet<_> = table.keys().cloned().collect();
    for change in &batch.changes {
        let key = (change.record_type.clone(), change.name.clone());
        match change.action {
            ChangeAction::Create => {
                if pre_existing.contains(&key) {
                    return Err(ApiError::InvalidChangeBatch(format!(
                        "{} {} is already present in the record set",
                        change.name, change.record_type
                    )));
                }
                table.insert(key, change.values.clone());
            }
            ChangeAction::Delete => {
                if table.get(&key) != Some(&change.values) {
                    return Err(ApiError::InvalidChangeBatch(format!(
                        "{} {} with specified values is not present in the record set",
                        change.name, change.record_type
                    )));
                }
                table.remove(&key);
            }
            ChangeAction::Upsert => {
                table.insert(key, change.values.clone());
            }
        }
    }

    let resolved = resolve_cnames(table).await?;
    let (deletes, adds) = diff::diff(&net.records, &resolved);

    for op in deletes.into_iter().chain(adds) {
        state
            .libvirt
            .network_update(&state.config.libvirt_network, op.command, op.section, &op.xml)
            .await?;
    }

    let change_id = Uuid::new_v4().simple().to_string();
    let submitted_at = chrono::Utc::now().to_rfc3339();
    let comment = if batch.comment.is_empty() { None } else { Some(batch.comment.as_str()) };
    db::dns::insert_change(&state.db, &change_id, &submitted_at, comment).await?;

    Ok(json!({
        "ChangeInfo": {
            "Comment": batch.comment,
            "Id": change_id,
            "Status": "INSYNC",
            "SubmittedAt": submitted_at,
        },
    }))
}

pub async fn get_change(state: &AppState, args: &Value) -> ApiResult<Value> {
    let change_id = args.require_str("Id")?;
    let row = db::dns::find_change(&state.db, change_id)
        .await?
        .ok_or_else(|| ApiError::NoSuchChange(format!("no such change: {change_id}")))?;

    Ok(json!({
        "ChangeInfo": {
            "Comment": row.comment.unwrap_or_default(),
            "Id": row.id,
            "Status": "INSYNC",
            "SubmittedAt": row.submitted_at,
        },
    }))
}
