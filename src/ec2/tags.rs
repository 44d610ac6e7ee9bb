//! Generic tag handlers. AWS's `CreateTags`/`DeleteTags` take a bare
//! `ResourceId` with no resource-type field; the type is recovered from
//! the id's prefix so it can key into the shared `tags` table the same
//! way every other handler's inline tag-spec handling does.

use serde_json::{json, Value};

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// AWS's `CreateTags`/`DeleteTags` take a bare `ResourceId` with no
/// type field, so the type is recovered by probing each shadow table
/// in turn (and, as a last resort, the libvirt volume pool, since
/// volumes have no shadow row of their own).
async fn resource_type_for(state: &AppState, resource_id: &str) -> ApiResult<&'static str> {
    if db::instances::find(&state.db, resource_id).await?.is_some() {
        return Ok("instance");
    }
    if db::addresses::find_by_allocation_id(&state.db, resource_id).await?.is_some() {
        return Ok("ip_address");
    }
    if db::launch_templates::find_by_id(&state.db, resource_id).await?.is_some() {
        return Ok("launch_template");
    }
    if db::images::exists(&state.db, resource_id).await? {
        return Ok("image");
    }
    if state.libvirt.list_volume_names(&state.config.libvirt_image_pool).await?.contains(&resource_id.to_string()) {
        return Ok("volume");
    }
    Err(ApiError::InvalidParameter(format!("invalid ResourceId: {resource_id}")))
}

fn tags_from_args(args: &Value) -> Vec<db::tags::Tag> {
    args.list_at("Tag")
        .into_iter()
        .filter_map(|tag| match (tag.str_at("Key"), tag.str_at("Value")) {
            (Some(key), Some(value)) => Some(db::tags::Tag { key: key.to_string(), value: value.to_string() }),
            _ => None,
        })
        .collect()
}

pub async fn create_tags(state: &AppState, args: &Value) -> ApiResult<Value> {
    let resource_ids = args.non_null_strings("ResourceId");
    if resource_ids.is_empty() {
        return Err(ApiError::InvalidParameter("missing required ResourceId".into()));
    }
    let tags = tags_from_args(args);
    if tags.is_empty() {
        return Err(ApiError::InvalidParameter("missing required Tag".into()));
    }

    for resource_id in &resource_ids {
        let resource_type = resource_type_for(state, resource_id).await?;
        db::tags::put_tags(&state.db, resource_id, resource_type, &tags).await?;
    }

    Ok(json!({ "return": true }))
}

pub async fn delete_tags(state: &AppState, args: &Value) -> ApiResult<Value> {
    let resource_ids = args.non_null_strings("ResourceId");
    if resource_ids.is_empty() {
        return Err(ApiError::InvalidParameter("missing required ResourceId".into()));
    }

    for resource_id in &resource_ids {
        let resource_type = resource_type_for(state, resource_id).await?;
        db::tags::remove_tags(&state.db, resource_id, resource_type).await?;
    }

    Ok(json!({ "return": true }))
}

/// The source stubs this out to an always-empty set; kept that way —
/// AWS clients calling `DescribeTags` with filters expect arbitrary
/// cross-resource search, which this single-tenant host has no index
/// for, and every real caller of this service reads tags back via the
/// owning resource's own Describe call instead.
pub async fn describe_tags(_state: &AppState, _args: &Value) -> ApiResult<Value> {
    Ok(json!({ "nextToken": Value::Null, "tagSet": Value::Array(Vec::new()) }))
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

    #[tokio::test]
    async fn create_then_delete_tags_round_trips() {
        let state = test_state().await;
        db::instances::insert(&state.db, "i-1", "us-east-2a", None).await.unwrap();

        create_tags(
            &state,
            &json!({ "ResourceId": ["i-1"], "Tag": [{ "Key": "Name", "Value": "web" }] }),
        )
        .await
        .unwrap();

        let tags = db::tags::get_tags(&state.db, "i-1", "instance").await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].value, "web");

        delete_tags(&state, &json!({ "ResourceId": ["i-1"] })).await.unwrap();
        let tags = db::tags::get_tags(&state.db, "i-1", "instance").await.unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn create_tags_rejects_unknown_resource() {
        let state = test_state().await;
        let err = create_tags(
            &state,
            &json!({ "ResourceId": ["i-missing"], "Tag": [{ "Key": "Name", "Value": "web" }] }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn volume_resource_type_resolved_via_libvirt() {
        let state = test_state().await;
        state.libvirt.create_volume("default", "vol-1.qcow2", 1024).await.unwrap();

        create_tags(
            &state,
            &json!({ "ResourceId": ["vol-1.qcow2"], "Tag": [{ "Key": "Name", "Value": "data" }] }),
        )
        .await
        .unwrap();

        let tags = db::tags::get_tags(&state.db, "vol-1.qcow2", "volume").await.unwrap();
        assert_eq!(tags.len(), 1);
    }
}
