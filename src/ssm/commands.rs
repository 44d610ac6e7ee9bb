//! `SendCommand` runs a document's single step in each named instance
//! through the guest agent; `GetCommandInvocation` replays the stored
//! result for one `(command_id, instance_id)` pair.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::libvirt::guest_agent;
use crate::libvirt::LibvirtDriver;
use crate::state::AppState;

pub async fn send_command(state: &AppState, args: &Value) -> ApiResult<Value> {
    let name = args.require_str("DocumentName")?;
    let instance_ids = args.non_null_strings("InstanceIds");
    if instance_ids.is_empty() {
        return Err(ApiError::InvalidParameter("missing required InstanceIds".into()));
    }

    let stored = db::ssm::find_document(&state.db, name)
        .await?
        .ok_or_else(|| ApiError::InvalidParameter(format!("no document found with name {name:?}")))?;
    let document: Value = serde_json::from_str(&stored).map_err(ApiError::internal)?;
    let steps = document
        .get("mainSteps")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::internal("stored document is missing mainSteps"))?;
    let step = steps.first().ok_or_else(|| ApiError::InvalidParameter("document doesn't have any steps".into()))?;
    let run_command = step
        .pointer("/inputs/runCommand")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::InvalidParameter("document step is missing inputs.runCommand".into()))?;
    let script: String = run_command
        .iter()
        .filter_map(Value::as_str)
        .collect::<Vec<_>>()
        .join("\n");

    let command_id = Uuid::new_v4().to_string();
    let driver: Arc<dyn LibvirtDriver> = Arc::clone(&state.libvirt);
    for instance_id in &instance_ids {
        let result = guest_agent::exec_and_wait(&driver, instance_id, "bash", &["-c".to_string(), script.clone()], &[], None).await?;
        db::ssm::record_invocation(&state.db, &command_id, instance_id, result.exit_code, &result.stdout, &result.stderr).await?;
    }

    Ok(json!({ "Command": { "CommandId": command_id } }))
}

pub async fn get_command_invocation(state: &AppState, args: &Value) -> ApiResult<Value> {
    let command_id = args.require_str("CommandId")?;
    let instance_id = args.require_str("InstanceId")?;

    let row = db::ssm::find_invocation(&state.db, command_id, instance_id)
        .await?
        .ok_or_else(|| ApiError::InvalidParameter("no invocation found".into()))?;

    Ok(json!({
        "CommandId": row.command_id,
        "InstanceId": row.instance_id,
        "ResponseCode": row.response_code,
        "StandardOutputContent": row.stdout,
        "StandardErrorContent": row.stderr,
        "Status": if row.response_code == 0 { "Success" } else { "Failed" },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::connect_in_memory;
    use crate::libvirt::FakeDriver;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use clap::Parser;

    async fn test_state() -> AppState {
        let db = connect_in_memory().await;
        let config = Config::parse_from(["libvirt-aws"]);
        AppState::new(db, Arc::new(FakeDriver::new()), config)
    }

    #[tokio::test]
    async fn send_command_then_get_invocation_round_trips() {
        let db = connect_in_memory().await;
        let config = Config::parse_from(["libvirt-aws"]);
        let driver = FakeDriver::new();
        {
            let mut responses = driver.agent_responses.lock().await;
            responses.push(json!({"return": {"pid": 1}}).to_string());
            responses.push(
                json!({
                    "return": {
                        "exited": true,
                        "exitcode": 0,
                        "out-data": BASE64.encode("hi\n"),
                        "err-data": "",
                    }
                })
                .to_string(),
            );
        }
        let state = AppState::new(db, Arc::new(driver), config);

        let content = r#"{"mainSteps":[{"inputs":{"runCommand":["echo hi"]}}]}"#;
        db::ssm::put_document(&state.db, "ping", content).await.unwrap();

        let sent = send_command(&state, &json!({ "DocumentName": "ping", "InstanceIds": ["i-1"] })).await.unwrap();
        let command_id = sent["Command"]["CommandId"].as_str().unwrap().to_string();

        let invocation = get_command_invocation(&state, &json!({ "CommandId": command_id, "InstanceId": "i-1" }))
            .await
            .unwrap();
        assert_eq!(invocation["Status"], "Success");
        assert_eq!(invocation["StandardOutputContent"], "hi\n");
    }

    #[tokio::test]
    async fn send_command_rejects_unknown_document() {
        let state = test_state().await;
        let err = send_command(&state, &json!({ "DocumentName": "nope", "InstanceIds": ["i-1"] })).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn get_command_invocation_rejects_unknown_pair() {
        let state = test_state().await;
        let err = get_command_invocation(&state, &json!({ "CommandId": "nope", "InstanceId": "i-1" })).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }
}
