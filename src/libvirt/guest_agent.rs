//! Exec-and-wait over the QEMU guest-agent passthrough: submit
//! `guest-exec`, poll `guest-exec-status` every 100 ms until the process
//! exits, then decode its captured streams.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::libvirt::LibvirtDriver;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Deserialize)]
struct AgentEnvelope<T> {
    r#return: T,
}

#[derive(Deserialize)]
struct ExecStarted {
    pid: i64,
}

#[derive(Deserialize)]
struct ExecStatus {
    exited: bool,
    exitcode: Option<i64>,
    #[serde(rename = "out-data")]
    out_data: Option<String>,
    #[serde(rename = "err-data")]
    err_data: Option<String>,
}

/// Runs `path arg...` inside `domain` and waits for it to exit, bounded
/// by `timeout` (defaults to 5s when `None`).
pub async fn exec_and_wait(
    driver: &Arc<dyn LibvirtDriver>,
    domain: &str,
    path: &str,
    args: &[String],
    env: &[(String, String)],
    timeout: Option<Duration>,
) -> ApiResult<ExecResult> {
    let start_cmd = json!({
        "execute": "guest-exec",
        "arguments": {
            "path": path,
            "arg": args,
            "env": env.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>(),
            "capture-output": true,
        }
    });

    let response = driver.qemu_agent_command(domain, &start_cmd.to_string()).await?;
    let started: AgentEnvelope<ExecStarted> = serde_json::from_str(&response).map_err(ApiError::internal)?;
    let pid = started.r#return.pid;

    let poll = async {
        loop {
            let status_cmd = json!({
                "execute": "guest-exec-status",
                "arguments": { "pid": pid }
            });
            let response = driver.qemu_agent_command(domain, &status_cmd.to_string()).await?;
            let status: AgentEnvelope<ExecStatus> = serde_json::from_str(&response).map_err(ApiError::internal)?;

            if status.r#return.exited {
                let stdout = status
                    .r#return
                    .out_data
                    .as_deref()
                    .map(decode_base64)
                    .transpose()?
                    .unwrap_or_default();
                let stderr = status
                    .r#return
                    .err_data
                    .as_deref()
                    .map(decode_base64)
                    .transpose()?
                    .unwrap_or_default();
                return Ok(ExecResult {
                    exit_code: status.r#return.exitcode.unwrap_or(-1),
                    stdout,
                    stderr,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    tokio::time::timeout(timeout.unwrap_or(DEFAULT_TIMEOUT), poll)
        .await
        .map_err(|_| ApiError::internal(format!("guest-exec on {domain} timed out")))?
}

fn decode_base64(s: &str) -> ApiResult<String> {
    let bytes = BASE64.decode(s).map_err(ApiError::internal)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libvirt::FakeDriver;
    use std::sync::Arc;

    #[tokio::test]
    async fn exec_and_wait_decodes_captured_streams() {
        let fake = Arc::new(FakeDriver::new());
        {
            let mut responses = fake.agent_responses.lock().await;
            responses.push(json!({"return": {"pid": 42}}).to_string());
            responses.push(
                json!({
                    "return": {
                        "exited": true,
                        "exitcode": 0,
                        "out-data": BASE64.encode("hello\n"),
                        "err-data": "",
                    }
                })
                .to_string(),
            );
        }
        let driver: Arc<dyn LibvirtDriver> = fake;
        let result = exec_and_wait(&driver, "i-1", "/bin/echo", &["hello".to_string()], &[], None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
    }

    #[tokio::test]
    async fn exec_and_wait_times_out_when_never_exited() {
        let fake = Arc::new(FakeDriver::new());
        {
            let mut responses = fake.agent_responses.lock().await;
            responses.push(json!({"return": {"pid": 1}}).to_string());
            for _ in 0..20 {
                responses.push(json!({"return": {"exited": false}}).to_string());
            }
        }
        let driver: Arc<dyn LibvirtDriver> = fake;
        let result = exec_and_wait(
            &driver,
            "i-1",
            "/bin/sleep",
            &["100".to_string()],
            &[],
            Some(Duration::from_millis(300)),
        )
        .await;
        assert!(result.is_err());
    }
}
