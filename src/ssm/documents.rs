//! `CreateDocument`: JSON or YAML `Command` documents with exactly one
//! `mainStep`, normalized to JSON before storage so `SendCommand` only
//! has one format to read back.

use regex::Regex;
use serde_json::{json, Value};

use crate::args::ArgsExt;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn create_document(state: &AppState, args: &Value) -> ApiResult<Value> {
    let name = args.require_str("Name")?;
    let name_re = Regex::new(r"^[A-Za-z0-9_\-.]{3,128}$").map_err(ApiError::internal)?;
    if !name_re.is_match(name) {
        return Err(ApiError::InvalidParameter(format!(
            "the name {name:?} doesn't match the regex ^[A-Za-z0-9_\\-.]{{3,128}}$"
        )));
    }

    let doc_type = args.str_at("DocumentType").unwrap_or("Command");
    if doc_type != "Command" {
        return Err(ApiError::InvalidParameter(format!("the {doc_type:?} document type is not implemented")));
    }

    let raw = args.require_str("Content")?;
    let format = args.str_at("DocumentFormat").unwrap_or("json").to_lowercase();
    let content: Value = match format.as_str() {
        "json" => serde_json::from_str(raw).map_err(|e| ApiError::InvalidParameter(format!("invalid JSON content: {e}")))?,
        "yaml" => serde_yaml::from_str(raw).map_err(|e| ApiError::InvalidParameter(format!("invalid YAML content: {e}")))?,
        other => return Err(ApiError::InvalidParameter(format!("{other:?} is not a valid document format"))),
    };

    let steps = content
        .get("mainSteps")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::InvalidParameter("document is missing mainSteps".into()))?;
    match steps.len() {
        0 => return Err(ApiError::InvalidParameter("document doesn't have any steps".into())),
        1 => {}
        _ => return Err(ApiError::InvalidParameter("multiple steps are not currently implemented".into())),
    }

    let serialized = serde_json::to_string(&content).map_err(ApiError::internal)?;
    db::ssm::put_document(&state.db, name, &serialized).await?;

    Ok(json!({ "Name": name, "Status": "Active" }))
}
