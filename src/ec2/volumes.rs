//! Volume lifecycle and attach/detach handlers.

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::args::ArgsExt;
use crate::attachment_tracker::AttachmentStatus;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::libvirt::objects::Domain;
use crate::state::AppState;

struct VolumeAttachment {
    domain: String,
    device: String,
}

/// Cross-references every domain's disks for ones backed by `volume_id`
/// in the configured image pool, mirroring the source's scan-every-
/// domain approach since libvirt volumes carry no back-reference.
async fn attachments_for_volume(state: &AppState, volume_id: &str) -> ApiResult<Vec<VolumeAttachment>> {
    let mut found = Vec::new();
    for name in state.libvirt.list_domain_names().await? {
        let xml = state.libvirt.domain_xml(&name).await?;
        let domain = Domain::from_xml(&xml)?;
        for disk in domain.disks {
            if disk.pool == state.config.libvirt_image_pool && disk.volume == volume_id {
                found.push(VolumeAttachment { domain: name.clone(), device: disk.device });
            }
        }
    }
    Ok(found)
}

/// Rebuilds the attachment tracker from live libvirt state. Call once at
/// startup before serving requests: the tracker otherwise starts empty and
/// every already-attached volume looks available until something else
/// touches it.
pub async fn reconcile_attachments(state: &AppState) -> ApiResult<()> {
    for name in state.libvirt.list_domain_names().await? {
        let xml = state.libvirt.domain_xml(&name).await?;
        let domain = Domain::from_xml(&xml)?;
        for disk in domain.disks {
            if disk.pool == state.config.libvirt_image_pool {
                state.attachments.seed_attached(&disk.volume, &name, &disk.device).await;
            }
        }
    }
    Ok(())
}

async fn attachment_status(state: &AppState, volume_id: &str, instance_id: &str) -> &'static str {
    match state.attachments.get(volume_id, instance_id).await {
        Some(entry) => entry.status.as_str(),
        None => "attached",
    }
}

async fn volume_status(state: &AppState, volume_id: &str, live: &[VolumeAttachment]) -> ApiResult<&'static str> {
    let mut statuses = Vec::new();
    for att in live {
        statuses.push(attachment_status(state, volume_id, &att.domain).await);
    }
    for (key, entry) in state.attachments.for_volume(volume_id).await {
        if !live.iter().any(|a| a.domain == key.1) {
            statuses.push(entry.status.as_str());
        }
    }
    Ok(if statuses.iter().all(|s| *s == "detached") { "available" } else { "in-use" })
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

pub async fn create_volume(state: &AppState, args: &Value) -> ApiResult<Value> {
    let size_gib: u64 = args
        .str_at("Size")
        .ok_or_else(|| ApiError::InvalidParameter("missing required Size".into()))?
        .parse()
        .map_err(|_| ApiError::InvalidParameter("Size must be an integer".into()))?;
    let az = args.require_str("AvailabilityZone")?;
    let volume_type = args.str_at("VolumeType").unwrap_or("gp2");

    let volume_id = format!("{}.qcow2", Uuid::new_v4());
    state.libvirt.create_volume(&state.config.libvirt_image_pool, &volume_id, size_gib * 1024 * 1024 * 1024).await?;

    if let Some(tags) = extract_tag_specs(args) {
        db::tags::put_tags(&state.db, &volume_id, "volume", &tags).await?;
    }

    Ok(json!({
        "volumeId": volume_id,
        "size": size_gib,
        "iops": 10000,
        "availabilityZone": az,
        "snapshotId": Value::Null,
        "status": "creating",
        "createTime": Utc::now().to_rfc3339(),
        "volumeType": volume_type,
        "multiAttachEnabled": false,
    }))
}

pub async fn delete_volume(state: &AppState, args: &Value) -> ApiResult<Value> {
    let volume_id = args.require_str("VolumeId")?;
    state
        .libvirt
        .delete_volume(&state.config.libvirt_image_pool, volume_id)
        .await
        .map_err(|_| ApiError::VolumeNotFound(volume_id.to_string()))?;
    db::tags::remove_tags(&state.db, volume_id, "volume").await?;
    Ok(json!({ "return": true }))
}

pub async fn describe_volumes(state: &AppState, args: &Value) -> ApiResult<Value> {
    let requested: Vec<String> = args.non_null_strings("VolumeId");
    let mut volumes = Vec::new();

    for name in state.libvirt.list_volume_names(&state.config.libvirt_image_pool).await? {
        if !requested.is_empty() && !requested.contains(&name) {
            continue;
        }
        let xml = state.libvirt.volume_xml(&state.config.libvirt_image_pool, &name).await?;
        let volume = crate::libvirt::objects::Volume::from_xml(&xml)?;
        let live = attachments_for_volume(state, &name).await?;
        let status = volume_status(state, &name, &live).await?;

        let mut attachment_set = Vec::new();
        for att in &live {
            attachment_set.push(json!({
                "instanceId": att.domain,
                "volumeId": name,
                "device": format!("/dev/{}", att.device),
                "status": attachment_status(state, &name, &att.domain).await,
            }));
        }
        for (key, entry) in state.attachments.for_volume(&name).await {
            if !live.iter().any(|a| a.domain == key.1) {
                attachment_set.push(json!({
                    "instanceId": key.1,
                    "volumeId": name,
                    "device": format!("/dev/{}", entry.device),
                    "status": entry.status.as_str(),
                }));
            }
        }

        volumes.push(json!({
            "volumeId": name,
            "volumeType": "standard",
            "size": volume.capacity_bytes / 1_073_741_824,
            "status": status,
            "attachmentSet": attachment_set,
        }));
    }

    Ok(json!({ "volumeSet": volumes }))
}

pub async fn attach_volume(state: &AppState, args: &Value) -> ApiResult<Value> {
    let instance_id = args.require_str("InstanceId")?.to_string();
    let volume_id = args.require_str("VolumeId")?.to_string();
    let mut device = args.require_str("Device")?.to_string();

    if let Some(stripped) = device.strip_prefix('/') {
        if !stripped.starts_with("dev/") {
            return Err(ApiError::InvalidParameter("invalid Device, must start with /dev".into()));
        }
        device = stripped.trim_start_matches("dev/").to_string();
    }

    state.libvirt.domain_xml(&instance_id).await.map_err(|_| ApiError::InvalidParameter(format!("invalid InstanceId: {instance_id}")))?;
    state
        .libvirt
        .volume_xml(&state.config.libvirt_image_pool, &volume_id)
        .await
        .map_err(|_| ApiError::InvalidParameter(format!("invalid VolumeId: {volume_id}")))?;

    if !state.attachments.is_available(&volume_id).await {
        let live = attachments_for_volume(state, &volume_id).await?;
        if volume_status(state, &volume_id, &live).await? != "available" {
            return Err(ApiError::IncorrectState(format!("Volume {volume_id} is in use and cannot be attached.")));
        }
    }

    state
        .libvirt
        .attach_disk(&instance_id, &state.config.libvirt_image_pool, &volume_id, &device)
        .await?;

    state.attachments.begin_attach(volume_id.clone(), instance_id.clone(), device.clone());

    Ok(json!({
        "volumeId": volume_id,
        "instanceId": instance_id,
        "device": format!("/dev/{device}"),
        "status": "attaching",
    }))
}

pub async fn detach_volume(state: &AppState, args: &Value) -> ApiResult<Value> {
    let instance_id = args.require_str("InstanceId")?.to_string();
    let volume_id = args.require_str("VolumeId")?.to_string();

    state
        .libvirt
        .domain_xml(&instance_id)
        .await
        .map_err(|_| ApiError::InstanceNotFound(instance_id.clone()))?;
    state
        .libvirt
        .volume_xml(&state.config.libvirt_image_pool, &volume_id)
        .await
        .map_err(|_| ApiError::VolumeNotFound(volume_id.clone()))?;

    let live = attachments_for_volume(state, &volume_id).await?;
    let device = live.iter().find(|a| a.domain == instance_id).map(|a| a.device.clone());

    let device = match device {
        Some(d) => d,
        None => {
            let known = state.attachments.get(&volume_id, &instance_id).await;
            return match known {
                Some(entry) if entry.status == AttachmentStatus::Detaching => Ok(json!({
                    "volumeId": volume_id,
                    "instanceId": instance_id,
                    "status": "detaching",
                    "device": format!("/dev/{}", entry.device),
                })),
                _ => Err(ApiError::AttachmentNotFound(format!(
                    "Volume {volume_id} is not attached to Instance {instance_id}"
                ))),
            };
        }
    };

    state.libvirt.detach_disk(&instance_id, &device).await?;
    state.attachments.begin_detach(volume_id.clone(), instance_id.clone(), device.clone());

    Ok(json!({
        "volumeId": volume_id,
        "instanceId": instance_id,
        "status": "detaching",
        "device": format!("/dev/{device}"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::connect_in_memory;
    use crate::libvirt::FakeDriver;
    use clap::Parser;
    use std::sync::Arc;

    async fn test_state() -> AppState {
        let db = connect_in_memory().await;
        let config = Config::parse_from(["libvirt-aws"]);
        AppState::new(db, Arc::new(FakeDriver::new()), config)
    }

    fn domain_xml(id: &str) -> String {
        format!(
            "<domain type='kvm'>\n  <name>{id}</name>\n  <devices>\n    \
             <disk type='volume' device='disk'>\n      <source pool='default' volume='root.qcow2'/>\n      \
             <target dev='vda' bus='virtio'/>\n    </disk>\n  </devices>\n</domain>"
        )
    }

    #[tokio::test]
    async fn create_then_describe_volume_round_trips() {
        let state = test_state().await;
        let created =
            create_volume(&state, &json!({ "Size": "8", "AvailabilityZone": "us-east-2a" })).await.unwrap();
        let volume_id = created["volumeId"].as_str().unwrap().to_string();

        let described = describe_volumes(&state, &json!({})).await.unwrap();
        let volumes = described["volumeSet"].as_array().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0]["volumeId"], volume_id);
        assert_eq!(volumes[0]["status"], "available");
        assert_eq!(volumes[0]["size"], 8);
    }

    #[tokio::test]
    async fn attach_then_detach_transitions_through_tracker_states() {
        let state = test_state().await;

        state.libvirt.create_volume("default", "vol-1.qcow2", 8 * 1024 * 1024 * 1024).await.unwrap();
        state.libvirt.clone_and_start_domain("base", "i-1").await.unwrap();

        let attach = attach_volume(
            &state,
            &json!({ "InstanceId": "i-1", "VolumeId": "vol-1.qcow2", "Device": "/dev/sdf" }),
        )
        .await
        .unwrap();
        assert_eq!(attach["status"], "attaching");
        assert_eq!(attach["device"], "/dev/sdf");

        let entry = state.attachments.get("vol-1.qcow2", "i-1").await.unwrap();
        assert_eq!(entry.device, "sdf");

        let detach =
            detach_volume(&state, &json!({ "InstanceId": "i-1", "VolumeId": "vol-1.qcow2" })).await.unwrap();
        assert_eq!(detach["status"], "detaching");
    }

    #[tokio::test]
    async fn detach_without_prior_attach_is_rejected() {
        let state = test_state().await;
        state.libvirt.create_volume("default", "vol-1.qcow2", 1024).await.unwrap();
        state.libvirt.clone_and_start_domain("base", "i-1").await.unwrap();

        let err = detach_volume(&state, &json!({ "InstanceId": "i-1", "VolumeId": "vol-1.qcow2" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AttachmentNotFound(_)));
    }

    #[tokio::test]
    async fn reconcile_attachments_seeds_tracker_from_live_disks() {
        let db = connect_in_memory().await;
        let config = Config::parse_from(["libvirt-aws"]);
        let driver = Arc::new(FakeDriver::new());
        driver.domains.lock().await.insert(
            "i-1".to_string(),
            (domain_xml("i-1"), crate::libvirt::DomainState::Running),
        );
        let state = AppState::new(db, Arc::clone(&driver) as Arc<dyn crate::libvirt::LibvirtDriver>, config);

        reconcile_attachments(&state).await.unwrap();

        assert!(!state.attachments.is_available("root.qcow2").await);
        let entry = state.attachments.get("root.qcow2", "i-1").await.unwrap();
        assert_eq!(entry.device, "vda");
        assert_eq!(entry.status, AttachmentStatus::Attached);
    }

    #[test]
    fn domain_xml_fixture_parses_disk() {
        let xml = domain_xml("i-1");
        let domain = Domain::from_xml(&xml).unwrap();
        assert_eq!(domain.disks[0].volume, "root.qcow2");
    }
}
