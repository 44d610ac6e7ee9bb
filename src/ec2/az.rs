//! Availability zones. This host only ever exposes a single zone, the
//! configured region suffixed with `a`.

use serde_json::{json, Value};

use crate::state::AppState;
use crate::error::ApiResult;

pub async fn describe_availability_zones(state: &AppState, _args: &Value) -> ApiResult<Value> {
    let zone = format!("{}a", state.config.region);
    Ok(json!({
        "availabilityZoneInfo": [{
            "optInStatus": "opt-in-not-required",
            "zoneName": zone,
            "zoneId": zone,
            "zoneState": "available",
            "regionName": state.config.region,
        }],
    }))
}
