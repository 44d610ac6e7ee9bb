//! Route 53's own tag surface. Only hosted zones are taggable here — the
//! real API also covers health checks, which this host doesn't model.

use serde_json::{json, Value};

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn require_hostedzone<'a>(args: &'a Value) -> ApiResult<&'a str> {
    let resource_type = args.require_str("ResourceType")?;
    if resource_type != "hostedzone" {
        return Err(ApiError::InvalidParameter(format!("unsupported ResourceType: {resource_type}")));
    }
    args.require_str("ResourceId")
}

pub async fn list_tags_for_resource(state: &AppState, args: &Value) -> ApiResult<Value> {
    let resource_id = require_hostedzone(args)?;
    let tags = db::tags::get_tags(&state.db, resource_id, "hostedzone").await?;

    Ok(json!({
        "ResourceTagSet": {
            "ResourceId": resource_id,
            "ResourceType": "hostedzone",
            "Tags": tags.into_iter().map(|t| json!({ "Key": t.key, "Value": t.value })).collect::<Vec<_>>(),
        }
    }))
}

pub async fn change_tags_for_resource(state: &AppState, args: &Value) -> ApiResult<Value> {
    let resource_id = require_hostedzone(args)?.to_string();

    let add_tags: Vec<db::tags::Tag> = args
        .get("AddTags")
        .map(|v| v.list_at("Tag"))
        .unwrap_or_default()
        .into_iter()
        .filter_map(|tag| match (tag.str_at("Key"), tag.str_at("Value")) {
            (Some(k), Some(v)) => Some(db::tags::Tag { key: k.to_string(), value: v.to_string() }),
            _ => None,
        })
        .collect();
    if !add_tags.is_empty() {
        db::tags::put_tags(&state.db, &resource_id, "hostedzone", &add_tags).await?;
    }

    let remove_keys = args.get("RemoveTagKeys").map(|v| v.non_null_strings("Key")).unwrap_or_default();
    for key in remove_keys {
        db::tags::remove_tag(&state.db, &resource_id, "hostedzone", &key).await?;
    }

    Ok(json!({}))
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
    async fn add_then_list_then_remove_tags_round_trips() {
        let state = test_state().await;
        change_tags_for_resource(
            &state,
            &json!({
                "ResourceType": "hostedzone",
                "ResourceId": "default",
                "AddTags": { "Tag": [{ "Key": "Env", "Value": "prod" }] },
            }),
        )
        .await
        .unwrap();

        let listed = list_tags_for_resource(&state, &json!({ "ResourceType": "hostedzone", "ResourceId": "default" }))
            .await
            .unwrap();
        assert_eq!(listed["ResourceTagSet"]["Tags"].as_array().unwrap().len(), 1);

        change_tags_for_resource(
            &state,
            &json!({
                "ResourceType": "hostedzone",
                "ResourceId": "default",
                "RemoveTagKeys": { "Key": ["Env"] },
            }),
        )
        .await
        .unwrap();

        let listed = list_tags_for_resource(&state, &json!({ "ResourceType": "hostedzone", "ResourceId": "default" }))
            .await
            .unwrap();
        assert!(listed["ResourceTagSet"]["Tags"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_resource_type_is_rejected() {
        let state = test_state().await;
        let err = list_tags_for_resource(&state, &json!({ "ResourceType": "healthcheck", "ResourceId": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }
}
