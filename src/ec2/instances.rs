//! Instance lifecycle: run, describe, stop, terminate.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::args::ArgsExt;
use crate::db;
use crate::db::instances::InstanceState;
use crate::error::{ApiError, ApiResult};
use crate::libvirt::objects::Domain;
use crate::libvirt::DomainState;
use crate::state::AppState;

const STOP_POLL_INTERVAL: Duration = Duration::from_secs(2);
const STOP_DEADLINE: Duration = Duration::from_secs(120);

/// Deletes shadow rows for instances that have been `terminated` for
/// longer than the tombstone window, mirroring the Python source's
/// GC sweep run at the top of every `RunInstances` call.
async fn garbage_collect_terminated(state: &AppState) -> ApiResult<()> {
    let cutoff = (Utc::now() - ChronoDuration::minutes(2)).to_rfc3339();
    db::instances::gc_terminated(&state.db, &cutoff).await?;
    Ok(())
}

pub async fn describe_instance_types(_state: &AppState, _args: &Value) -> ApiResult<Value> {
    Ok(json!({
        "nextToken": Value::Null,
        "instanceTypeSet": [{ "instanceType": "t2.micro" }],
    }))
}

pub async fn describe_instance_attribute(_state: &AppState, _args: &Value) -> ApiResult<Value> {
    Ok(json!({
        "instanceInitiatedShutdownBehavior": { "value": "STOP" },
        "disableApiStop": { "value": false },
        "disableApiTermination": { "value": false },
    }))
}

fn extract_tag_specs(args: &Value) -> Vec<db::tags::Tag> {
    let mut tags = Vec::new();
    for spec in args.list_at("TagSpecification") {
        for tag in spec.list_at("Tag") {
            if let (Some(key), Some(value)) = (tag.str_at("Key"), tag.str_at("Value")) {
                tags.push(db::tags::Tag { key: key.to_string(), value: value.to_string() });
            }
        }
    }
    tags
}

async fn resolve_image_id(state: &AppState, args: &Value) -> ApiResult<String> {
    if let Some(image_id) = args.str_at("ImageId") {
        return Ok(image_id.to_string());
    }
    if let Some(launch_template) = args.get("LaunchTemplate") {
        if let Some(template_id) = launch_template.str_at("LaunchTemplateId") {
            let template = db::launch_templates::find_by_id(&state.db, template_id)
                .await?
                .ok_or_else(|| ApiError::InvalidParameter(format!("invalid LaunchTemplateId: {template_id}")))?;
            return Ok(template.image_id);
        }
        if let Some(template_name) = launch_template.str_at("LaunchTemplateName") {
            let template = db::launch_templates::find_by_name(&state.db, template_name)
                .await?
                .ok_or_else(|| {
                    ApiError::InvalidParameter(format!("invalid LaunchTemplateName: {template_name}"))
                })?;
            return Ok(template.image_id);
        }
    }
    Err(ApiError::InvalidParameter("missing required ImageId".into()))
}

pub async fn run_instances(state: &AppState, args: &Value) -> ApiResult<Value> {
    garbage_collect_terminated(state).await?;

    let image_id = resolve_image_id(state, args).await?;
    if !db::images::exists(&state.db, &image_id).await? {
        return Err(ApiError::InvalidParameter(format!("invalid ImageId: {image_id}")));
    }

    if let Some(user_data) = args.str_at("UserData") {
        BASE64.decode(user_data).map_err(|_| ApiError::InvalidParameter("UserData is not valid base64".into()))?;
    }

    let instance_id = format!("i-{}", Uuid::new_v4().simple());
    let az = args
        .get("Placement")
        .and_then(|p| p.str_at("AvailabilityZone"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}a", state.config.region));
    let subnet_id = args.str_at("SubnetId").map(str::to_string);
    let tags = extract_tag_specs(args);

    let mut tx = state.db.begin().await?;
    db::instances::insert(&mut *tx, &instance_id, &az, subnet_id.as_deref()).await?;
    if !tags.is_empty() {
        db::tags::put_tags(&mut *tx, &instance_id, "instance", &tags).await?;
    }
    tx.commit().await?;

    state.libvirt.clone_and_start_domain(&image_id, &instance_id).await?;

    Ok(json!({ "instancesSet": [{ "instanceId": instance_id }] }))
}

async fn block_device_mapping(state: &AppState, instance_id: &str) -> ApiResult<Vec<Value>> {
    let xml = state.libvirt.domain_xml(instance_id).await?;
    let domain = Domain::from_xml(&xml)?;
    let mut mappings = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for disk in &domain.disks {
        if disk.pool != state.config.libvirt_image_pool {
            continue;
        }
        let tracked_status = state
            .attachments
            .get(&disk.volume, instance_id)
            .await
            .map(|a| a.status.as_str())
            .unwrap_or("attached");
        mappings.push(json!({
            "deviceName": format!("/dev/{}", disk.device),
            "ebs": { "volumeId": disk.volume, "status": tracked_status },
        }));
        seen.insert(disk.volume.clone());
    }

    for ((volume_id, _), entry) in state.attachments.for_instance(instance_id).await {
        if seen.contains(&volume_id) || entry.status == crate::attachment_tracker::AttachmentStatus::Detached {
            continue;
        }
        mappings.push(json!({
            "deviceName": format!("/dev/{}", entry.device),
            "ebs": { "volumeId": volume_id, "status": entry.status.as_str() },
        }));
    }

    Ok(mappings)
}

pub async fn describe_instances(state: &AppState, args: &Value) -> ApiResult<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut instances = Vec::new();

    for instance_id in args.non_null_strings("InstanceId") {
        if !seen.insert(instance_id.clone()) {
            continue;
        }

        let row = db::instances::find(&state.db, &instance_id)
            .await?
            .ok_or_else(|| ApiError::InstanceNotFound(format!("invalid InstanceId: {instance_id}")))?;

        if row.state == InstanceState::Terminated.as_str() {
            let tags = db::tags::get_tags(&state.db, &instance_id, "instance").await?;
            instances.push(json!({
                "instanceId": instance_id,
                "instanceState": { "name": row.state },
                "placement": { "availabilityZone": row.availability_zone },
                "subnetId": row.subnet_id,
                "tagSet": tags.iter().map(|t| json!({"key": t.key, "value": t.value})).collect::<Vec<_>>(),
            }));
            continue;
        }

        let domain_state = state
            .libvirt
            .domain_state(&instance_id)
            .await
            .map_err(|_| ApiError::InstanceNotFound(format!("invalid InstanceId: {instance_id}")))?;
        let aws_state = domain_state.as_aws_str();
        if aws_state != row.state {
            db::instances::set_state(
                &state.db,
                &instance_id,
                InstanceState::parse(aws_state).unwrap_or(InstanceState::Running),
            )
            .await?;
        }

        let block_devices = block_device_mapping(state, &instance_id).await?;
        let tags = db::tags::get_tags(&state.db, &instance_id, "instance").await?;

        instances.push(json!({
            "instanceId": instance_id,
            "instanceType": "t2.micro",
            "instanceState": { "name": aws_state },
            "placement": { "availabilityZone": row.availability_zone },
            "subnetId": row.subnet_id,
            "blockDeviceMapping": block_devices,
            "networkInterfaceSet": [],
            "tagSet": tags.iter().map(|t| json!({"key": t.key, "value": t.value})).collect::<Vec<_>>(),
        }));
    }

    Ok(json!({
        "nextToken": Value::Null,
        "reservationSet": [{ "instancesSet": instances }],
    }))
}

pub async fn terminate_instances(state: &AppState, args: &Value) -> ApiResult<Value> {
    let mut results = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for instance_id in args.non_null_strings("InstanceId") {
        if !seen.insert(instance_id.clone()) {
            continue;
        }

        db::tags::remove_tags(&state.db, &instance_id, "instance").await?;
        db::instances::terminate(&state.db, &instance_id, &Utc::now().to_rfc3339()).await?;

        if let Ok(xml) = state.libvirt.domain_xml(&instance_id).await {
            if let Ok(domain) = Domain::from_xml(&xml) {
                for disk in &domain.disks {
                    if disk.pool == state.config.libvirt_image_pool {
                        let _ = state.libvirt.delete_volume(&disk.pool, &disk.volume).await;
                    }
                }
            }
            let _ = state.libvirt.destroy_and_undefine_domain(&instance_id).await;
        }

        results.push(json!({ "instanceId": instance_id }));
    }

    Ok(json!({ "instancesSet": results }))
}

pub async fn stop_instances(state: &AppState, args: &Value) -> ApiResult<Value> {
    let mut results = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for instance_id in args.non_null_strings("InstanceId") {
        if !seen.insert(instance_id.clone()) {
            continue;
        }

        db::instances::set_state(&state.db, &instance_id, InstanceState::Stopping).await?;
        state
            .libvirt
            .shutdown_domain(&instance_id)
            .await
            .map_err(|_| ApiError::InstanceNotFound(format!("invalid InstanceId: {instance_id}")))?;

        let deadline = tokio::time::Instant::now() + STOP_DEADLINE;
        loop {
            let state_now = state.libvirt.domain_state(&instance_id).await?;
            if state_now == DomainState::Stopped {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ApiError::internal(format!(
                    "instance {instance_id} did not reach stopped within {}s",
                    STOP_DEADLINE.as_secs()
                )));
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        db::instances::set_state(&state.db, &instance_id, InstanceState::Stopped).await?;
        results.push(json!({ "instanceId": instance_id }));
    }

    Ok(json!({ "instancesSet": results }))
}
