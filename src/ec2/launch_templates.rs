//! Launch template CRUD. A template has exactly one version; no
//! version-bump or default-version-switch operations exist.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::args::ArgsExt;
use crate::db;
use crate::db::launch_templates::VERSION_NUMBER;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn render(row: &db::launch_templates::LaunchTemplateRow) -> Value {
    json!({
        "launchTemplateId": row.id,
        "launchTemplateName": row.name,
        "defaultVersionNumber": VERSION_NUMBER,
        "latestVersionNumber": VERSION_NUMBER,
    })
}

pub async fn create_launch_template(state: &AppState, args: &Value) -> ApiResult<Value> {
    let name = args.require_str("LaunchTemplateName")?;
    let data = args.get("LaunchTemplateData").cloned().unwrap_or(Value::Null);
    let image_id = data
        .str_at("ImageId")
        .ok_or_else(|| ApiError::InvalidParameter("missing required LaunchTemplateData.ImageId".into()))?
        .to_string();

    if db::launch_templates::find_by_name(&state.db, name).await?.is_some() {
        return Err(ApiError::InvalidParameter(format!(
            "launch template with name {name} already exists"
        )));
    }

    let id = format!("lt-{}", Uuid::new_v4().simple());
    let serialized = serde_json::to_string(&data).map_err(ApiError::internal)?;
    db::launch_templates::insert(&state.db, &id, name, &image_id, &serialized).await?;

    let row = db::launch_templates::find_by_id(&state.db, &id).await?.unwrap();
    Ok(json!({ "launchTemplate": render(&row) }))
}

async fn resolve(state: &AppState, args: &Value) -> ApiResult<db::launch_templates::LaunchTemplateRow> {
    if let Some(id) = args.str_at("LaunchTemplateId") {
        return db::launch_templates::find_by_id(&state.db, id)
            .await?
            .ok_or_else(|| ApiError::InvalidParameter(format!("invalid LaunchTemplateId: {id}")));
    }
    if let Some(name) = args.str_at("LaunchTemplateName") {
        return db::launch_templates::find_by_name(&state.db, name)
            .await?
            .ok_or_else(|| ApiError::InvalidParameter(format!("invalid LaunchTemplateName: {name}")));
    }
    Err(ApiError::InvalidParameter("missing required LaunchTemplateId or LaunchTemplateName".into()))
}

pub async fn delete_launch_template(state: &AppState, args: &Value) -> ApiResult<Value> {
    let row = resolve(state, args).await?;
    db::launch_templates::delete(&state.db, &row.id).await?;
    Ok(json!({ "launchTemplate": render(&row) }))
}

pub async fn describe_launch_templates(state: &AppState, args: &Value) -> ApiResult<Value> {
    let requested_ids = args.non_null_strings("LaunchTemplateId");
    let requested_names = args.non_null_strings("LaunchTemplateName");

    let mut templates = Vec::new();
    for row in db::launch_templates::list(&state.db).await? {
        if !requested_ids.is_empty() && !requested_ids.contains(&row.id) {
            continue;
        }
        if !requested_names.is_empty() && !requested_names.contains(&row.name) {
            continue;
        }
        templates.push(render(&row));
    }

    Ok(json!({ "launchTemplates": templates }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    async fn test_db() -> crate::db::Db {
        connect_in_memory().await
    }

    fn state_with(db: crate::db::Db) -> AppState {
        use crate::config::Config;
        use crate::libvirt::FakeDriver;
        use clap::Parser;
        use std::sync::Arc;
        AppState::new(db, Arc::new(FakeDriver::new()), Config::parse_from(["libvirt-aws"]))
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let state = state_with(test_db().await);
        create_launch_template(
            &state,
            &json!({ "LaunchTemplateName": "web", "LaunchTemplateData": { "ImageId": "ami-1" } }),
        )
        .await
        .unwrap();

        let err = create_launch_template(
            &state,
            &json!({ "LaunchTemplateName": "web", "LaunchTemplateData": { "ImageId": "ami-2" } }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn create_describe_delete_round_trips() {
        let state = state_with(test_db().await);
        let created = create_launch_template(
            &state,
            &json!({ "LaunchTemplateName": "web", "LaunchTemplateData": { "ImageId": "ami-1" } }),
        )
        .await
        .unwrap();
        let id = created["launchTemplate"]["launchTemplateId"].as_str().unwrap().to_string();

        let described = describe_launch_templates(&state, &json!({})).await.unwrap();
        assert_eq!(described["launchTemplates"].as_array().unwrap().len(), 1);

        delete_launch_template(&state, &json!({ "LaunchTemplateId": id })).await.unwrap();
        let described = describe_launch_templates(&state, &json!({})).await.unwrap();
        assert!(described["launchTemplates"].as_array().unwrap().is_empty());
    }
}
