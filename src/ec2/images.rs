//! Machine image registry: images are libvirt domain templates cloned
//! by `RunInstances`, registered here under a name distinct from the
//! source domain that was imaged.

use serde_json::{json, Value};

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::libvirt::DomainState;
use crate::state::AppState;

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

pub async fn describe_images(state: &AppState, _args: &Value) -> ApiResult<Value> {
    let names = db::images::list(&state.db).await?;
    let images = names
        .into_iter()
        .map(|name| json!({ "imageId": name.clone(), "name": name }))
        .collect::<Vec<_>>();
    Ok(json!({ "imagesSet": images }))
}

/// Clones `InstanceId`'s domain into a new template registered as
/// `Name`; the source domain must be inactive, since `virt-clone`
/// cannot safely clone disks that are open for writing.
pub async fn create_image(state: &AppState, args: &Value) -> ApiResult<Value> {
    let instance_id = args.require_str("InstanceId")?;
    let name = args.require_str("Name")?;

    let domain_state = state
        .libvirt
        .domain_state(instance_id)
        .await
        .map_err(|_| ApiError::InstanceNotFound(instance_id.to_string()))?;
    if matches!(domain_state, DomainState::Running | DomainState::Stopping) {
        return Err(ApiError::IncorrectState(format!(
            "the domain {instance_id:?} can't be cloned while it is running"
        )));
    }

    let tags = extract_tag_specs(args);
    let mut tx = state.db.begin().await?;
    db::images::insert(&mut *tx, name).await?;
    if !tags.is_empty() {
        db::tags::put_tags(&mut *tx, name, "image", &tags).await?;
    }
    tx.commit().await?;

    state.libvirt.clone_domain_template(instance_id, name).await?;

    Ok(json!({ "imageId": name }))
}

/// Undefines the domain backing `ImageId` and removes its registry
/// row. Distinctly named from `create_image` (the source reuses one
/// function name for both handlers, which this port does not).
pub async fn deregister_image(state: &AppState, args: &Value) -> ApiResult<Value> {
    let image_id = args.require_str("ImageId")?;

    let domain_state = state
        .libvirt
        .domain_state(image_id)
        .await
        .map_err(|_| ApiError::InvalidParameter(format!("invalid ImageId: {image_id}")))?;
    if matches!(domain_state, DomainState::Running | DomainState::Stopping) {
        return Err(ApiError::IncorrectState(format!(
            "the domain {image_id:?} can't be undefined while it is running"
        )));
    }

    db::tags::remove_tags(&state.db, image_id, "image").await?;
    db::images::delete(&state.db, image_id).await?;
    state.libvirt.undefine_domain(image_id).await?;

    Ok(json!({ "return": true }))
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
    async fn create_image_rejects_running_source() {
        let state = test_state().await;
        state.libvirt.clone_and_start_domain("base", "i-1").await.unwrap();

        let err = create_image(&state, &json!({ "InstanceId": "i-1", "Name": "my-image" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::IncorrectState(_)));
    }

    #[tokio::test]
    async fn create_then_describe_then_deregister_round_trips() {
        let state = test_state().await;
        state.libvirt.clone_domain_template("base", "i-1").await.unwrap();
        state.libvirt.shutdown_domain("i-1").await.unwrap();

        let created = create_image(&state, &json!({ "InstanceId": "i-1", "Name": "my-image" })).await.unwrap();
        assert_eq!(created["imageId"], "my-image");

        let described = describe_images(&state, &json!({})).await.unwrap();
        let images = described["imagesSet"].as_array().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0]["imageId"], "my-image");

        let deregistered = deregister_image(&state, &json!({ "ImageId": "my-image" })).await.unwrap();
        assert_eq!(deregistered["return"], true);

        let described = describe_images(&state, &json!({})).await.unwrap();
        assert!(described["imagesSet"].as_array().unwrap().is_empty());
    }
}
