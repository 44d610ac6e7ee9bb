//! Central request dispatcher: resolves an inbound HTTP request to a
//! registered action, builds its argument tree, invokes the handler,
//! and renders the result to wire format.
//!
//! Three protocol shapes share one `AppState`: EC2-style query actions
//! on `/` (GET and POST, `Action` field or form body), SSM's JSON-1.1
//! actions (also POST on `/`, resolved by the `X-Amz-Target` header),
//! and Route 53's REST-ish paths under `/2013-04-01/…`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::args::{decode_query_form, ArgsExt};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::xml::{self, ListStyle};
use crate::{ec2, route53, ssm};

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ApiResult<Value>> + Send + 'a>>;
type HandlerFn = for<'a> fn(&'a AppState, &'a Value) -> HandlerFuture<'a>;

macro_rules! wrap {
    ($f:path) => {{
        fn wrapper<'a>(state: &'a AppState, args: &'a Value) -> HandlerFuture<'a> {
            Box::pin($f(state, args))
        }
        wrapper as HandlerFn
    }};
}

fn ec2_actions() -> &'static HashMap<&'static str, HandlerFn> {
    static REGISTRY: OnceLock<HashMap<&'static str, HandlerFn>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m: HashMap<&'static str, HandlerFn> = HashMap::new();
        m.insert("DescribeAvailabilityZones", wrap!(ec2::az::describe_availability_zones));
        m.insert("DescribeImages", wrap!(ec2::images::describe_images));
        m.insert("CreateImage", wrap!(ec2::images::create_image));
        m.insert("DeregisterImage", wrap!(ec2::images::deregister_image));
        m.insert("CreateLaunchTemplate", wrap!(ec2::launch_templates::create_launch_template));
        m.insert("DeleteLaunchTemplate", wrap!(ec2::launch_templates::delete_launch_template));
        m.insert("DescribeLaunchTemplates", wrap!(ec2::launch_templates::describe_launch_templates));
        m.insert("CreateVolume", wrap!(ec2::volumes::create_volume));
        m.insert("DeleteVolume", wrap!(ec2::volumes::delete_volume));
        m.insert("DescribeVolumes", wrap!(ec2::volumes::describe_volumes));
        m.insert("AttachVolume", wrap!(ec2::volumes::attach_volume));
        m.insert("DetachVolume", wrap!(ec2::volumes::detach_volume));
        m.insert("DescribeInstanceTypes", wrap!(ec2::instances::describe_instance_types));
        m.insert("DescribeInstanceAttribute", wrap!(ec2::instances::describe_instance_attribute));
        m.insert("RunInstances", wrap!(ec2::instances::run_instances));
        m.insert("DescribeInstances", wrap!(ec2::instances::describe_instances));
        m.insert("TerminateInstances", wrap!(ec2::instances::terminate_instances));
        m.insert("StopInstances", wrap!(ec2::instances::stop_instances));
        m.insert("CreateTags", wrap!(ec2::tags::create_tags));
        m.insert("DeleteTags", wrap!(ec2::tags::delete_tags));
        m.insert("DescribeTags", wrap!(ec2::tags::describe_tags));
        m.insert("DescribeAddresses", wrap!(ec2::addresses::describe_addresses));
        m.insert("AllocateAddress", wrap!(ec2::addresses::allocate_address));
        m.insert("AssociateAddress", wrap!(ec2::addresses::associate_address));
        m.insert("DisassociateAddress", wrap!(ec2::addresses::disassociate_address));
        m.insert("ReleaseAddress", wrap!(ec2::addresses::release_address));
        m.insert("AssignPrivateIpAddresses", wrap!(ec2::addresses::assign_private_ip_addresses));
        m
    })
}

fn ssm_actions() -> &'static HashMap<&'static str, HandlerFn> {
    static REGISTRY: OnceLock<HashMap<&'static str, HandlerFn>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m: HashMap<&'static str, HandlerFn> = HashMap::new();
        m.insert("CreateDocument", wrap!(ssm::documents::create_document));
        m.insert("SendCommand", wrap!(ssm::commands::send_command));
        m.insert("GetCommandInvocation", wrap!(ssm::commands::get_command_invocation));
        m
    })
}

fn request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Builds the axum router: `/` for EC2 query + SSM JSON-1.1 actions,
/// `/2013-04-01/…` for the Route 53 REST surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_ec2_get).post(handle_root_post).fallback(handle_root_method_not_allowed))
        .route("/2013-04-01/hostedzone", get(r53_list_zones).post(r53_create_zone))
        .route(
            "/2013-04-01/hostedzone/:id",
            get(r53_get_zone).post(r53_update_zone_comment).delete(r53_delete_zone),
        )
        .route("/2013-04-01/hostedzone/:id/rrset", get(r53_list_rrsets))
        .route("/2013-04-01/hostedzone/:id/rrset/", axum::routing::post(r53_change_rrsets))
        .route("/2013-04-01/hostedzonesbyname", get(r53_list_zones_by_name))
        .route(
            "/2013-04-01/tags/:resource_type/:resource_id",
            get(r53_list_tags).post(r53_change_tags),
        )
        .route("/2013-04-01/change/:id", get(r53_get_change))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Anything but GET/POST on the EC2 root route.
async fn handle_root_method_not_allowed() -> Response {
    render_ec2_error(&ApiError::MethodNotAllowed("The request must use GET or POST.".to_string()))
}

/// EC2 query dialect: GET reads the query string directly.
#[instrument(skip(state, query))]
async fn handle_ec2_get(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let pairs = query.as_deref().map(parse_query_pairs).unwrap_or_default();
    let args = match decode_query_form(&pairs) {
        Ok(args) => args,
        Err(err) => return render_ec2_error(&err),
    };
    run_ec2_action(&state, args).await
}

/// POST on `/` serves either the EC2 query dialect (form body) or the
/// JSON-1.1 protocol (`X-Amz-Target` + `application/x-amz-json-1.1`).
#[instrument(skip(state, headers, body))]
async fn handle_root_post(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    if let Some(target) = headers.get("x-amz-target").and_then(|v| v.to_str().ok()) {
        let action = target.rsplit('.').next().unwrap_or(target).to_string();
        let args: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => return render_ec2_error(&ApiError::InvalidParameter(format!("invalid JSON body: {e}"))),
        };
        return run_json_action(&state, &action, args).await;
    }

    let pairs = parse_query_pairs(&body);
    let mut args = match decode_query_form(&pairs) {
        Ok(args) => args,
        Err(err) => return render_ec2_error(&err),
    };
    if let Value::Object(map) = &mut args {
        map.insert("BodyText".to_string(), Value::String(body));
    }
    run_ec2_action(&state, args).await
}

fn parse_query_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            (decode_form_component(key), decode_form_component(value))
        })
        .collect()
}

fn decode_form_component(s: &str) -> String {
    let with_spaces = s.replace('+', " ");
    percent_encoding::percent_decode_str(&with_spaces).decode_utf8_lossy().into_owned()
}

async fn run_ec2_action(state: &AppState, args: Value) -> Response {
    let action = match args.str_at("Action") {
        Some(a) => a.to_string(),
        None => return render_ec2_error(&ApiError::InvalidAction("Invalid Action: missing".to_string())),
    };
    let Some(handler) = ec2_actions().get(action.as_str()) else {
        return render_ec2_error(&ApiError::InvalidAction(format!(
            "The action {action} is not valid for this web service."
        )));
    };

    let req_id = request_id();
    info!(action = %action, request_id = %req_id, "dispatching ec2 action");
    match handler(state, &args).await {
        Ok(mut body) => {
            if let Value::Object(map) = &mut body {
                map.insert("RequestID".to_string(), Value::String(req_id));
            }
            let version = args.str_at("Version");
            let xmlns = version.map(|v| format!("http://ec2.amazonaws.com/doc/{v}/"));
            let root = format!("{action}Response");
            let xml_body = xml::render_response(&body, &root, xmlns.as_deref(), ListStyle::Expanded);
            ([("content-type", "text/xml")], xml_body).into_response()
        }
        Err(err) => render_ec2_error(&err),
    }
}

async fn run_json_action(state: &AppState, action: &str, args: Value) -> Response {
    let Some(handler) = ssm_actions().get(action) else {
        return render_ec2_error(&ApiError::InvalidAction(format!(
            "The action {action} is not valid for this web service."
        )));
    };

    let req_id = request_id();
    info!(action = %action, request_id = %req_id, "dispatching json action");
    match handler(state, &args).await {
        Ok(body) => {
            let json_body = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
            ([("content-type", "application/x-amz-json-1.1")], json_body).into_response()
        }
        Err(err) => {
            log_error(&err);
            let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = serde_json::json!({ "__type": err.code(), "message": err.to_string() });
            (status, [("content-type", "application/x-amz-json-1.1")], body.to_string()).into_response()
        }
    }
}

fn log_error(err: &ApiError) {
    match err {
        ApiError::Internal(_) => error!(error = %err, "internal error"),
        other => warn!(error = %other, "client error"),
    }
}

fn render_ec2_error(err: &ApiError) -> Response {
    log_error(err);
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let xml_body = xml::render_ec2_error(&request_id(), err.code(), &err.to_string());
    (status, [("content-type", "text/xml")], xml_body).into_response()
}

fn render_route53_error(err: &ApiError) -> Response {
    log_error(err);
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let xml_body = xml::render_route53_error(&request_id(), err.code(), &err.to_string());
    (status, [("content-type", "text/xml")], xml_body).into_response()
}

async fn r53_respond(result: ApiResult<Value>, root: &str) -> Response {
    const XMLNS: &str = "https://route53.amazonaws.com/doc/2013-04-01/";
    match result {
        Ok(body) => {
            let xml_body = xml::render_response(&body, root, Some(XMLNS), ListStyle::Condensed);
            ([("content-type", "text/xml")], xml_body).into_response()
        }
        Err(err) => render_route53_error(&err),
    }
}

fn merge_query(mut args: Value, query: Option<&str>) -> Value {
    if let (Some(query), Value::Object(map)) = (query, &mut args) {
        for (k, v) in parse_query_pairs(query) {
            map.insert(k, Value::String(v));
        }
    }
    args
}

async fn r53_list_zones(State(state): State<AppState>) -> Response {
    r53_respond(route53::zones::list_hosted_zones(&state, &Value::Null).await, "ListHostedZonesResponse").await
}

async fn r53_create_zone(State(state): State<AppState>, body: String) -> Response {
    let args = match xml::parse_request_body(&body) {
        Ok(v) => v,
        Err(e) => return render_route53_error(&e),
    };
    r53_respond(route53::zones::create_hosted_zone(&state, &args).await, "CreateHostedZoneResponse").await
}

async fn r53_get_zone(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let args = serde_json::json!({ "Id": id });
    r53_respond(route53::zones::get_hosted_zone(&state, &args).await, "GetHostedZoneResponse").await
}

async fn r53_update_zone_comment(State(state): State<AppState>, Path(id): Path<String>, body: String) -> Response {
    let mut args = match xml::parse_request_body(&body) {
        Ok(v) => v,
        Err(e) => return render_route53_error(&e),
    };
    if let Value::Object(map) = &mut args {
        map.insert("Id".to_string(), Value::String(id));
    }
    r53_respond(
        route53::zones::update_hosted_zone_comment(&state, &args).await,
        "UpdateHostedZoneCommentResponse",
    )
    .await
}

async fn r53_delete_zone(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let args = serde_json::json!({ "Id": id });
    r53_respond(route53::zones::delete_hosted_zone(&state, &args).await, "DeleteHostedZoneResponse").await
}

async fn r53_list_zones_by_name(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let args = merge_query(serde_json::json!({}), query.as_deref());
    r53_respond(
        route53::zones::list_hosted_zones_by_name(&state, &args).await,
        "ListHostedZonesByNameResponse",
    )
    .await
}

async fn r53_list_rrsets(State(state): State<AppState>, Path(id): Path<String>, RawQuery(query): RawQuery) -> Response {
    let args = merge_query(serde_json::json!({ "Id": id }), query.as_deref());
    r53_respond(
        route53::records::list_resource_record_sets(&state, &args).await,
        "ListResourceRecordSetsResponse",
    )
    .await
}

async fn r53_change_rrsets(State(state): State<AppState>, Path(id): Path<String>, body: String) -> Response {
    let args = serde_json::json!({ "Id": id, "BodyText": body });
    r53_respond(
        route53::changes::change_resource_record_sets(&state, &args).await,
        "ChangeResourceRecordSetsResponse",
    )
    .await
}

async fn r53_get_change(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let args = serde_json::json!({ "Id": id });
    r53_respond(route53::changes::get_change(&state, &args).await, "GetChangeResponse").await
}

async fn r53_list_tags(
    State(state): State<AppState>,
    Path((resource_type, resource_id)): Path<(String, String)>,
) -> Response {
    let args = serde_json::json!({ "ResourceType": resource_type, "ResourceId": resource_id });
    r53_respond(route53::tags::list_tags_for_resource(&state, &args).await, "ListTagsForResourceResponse").await
}

async fn r53_change_tags(
    State(state): State<AppState>,
    Path((resource_type, resource_id)): Path<(String, String)>,
    body: String,
) -> Response {
    let mut args = match xml::parse_request_body(&body) {
        Ok(v) => v,
        Err(e) => return render_route53_error(&e),
    };
    if let Value::Object(map) = &mut args {
        map.insert("ResourceType".to_string(), Value::String(resource_type));
        map.insert("ResourceId".to_string(), Value::String(resource_id));
    }
    r53_respond(route53::tags::change_tags_for_resource(&state, &args).await, "ChangeTagsForResourceResponse").await
}
