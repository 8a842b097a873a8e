use std::net::{IpAddr, Ipv4Addr};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use joanet::{
    api::{ApiContext, ApiFunction, FunctionRegistry, result::ApiResult},
    backend::{
        output::OutputRegistry,
        router::BackendRouter,
        sensor::{Sensor, SensorRegistry},
    },
    device::DeviceRegistry,
    http::{RecvRequest, WebMethod},
    server::RequestHandler,
    utils::CiMap,
};
use serde_json::{Map, Value, json};

const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));

struct PlantsSensor;

impl Sensor for PlantsSensor {
    fn poll(&self) -> Result<Map<String, Value>> {
        let Value::Object(map) = json!({"plants": {"data": [0.1, 0.4], "status": "OK"}})
        else {
            panic!("fixture")
        };
        Ok(map)
    }
}

struct EchoFunction {
    required: u8,
    calls: Arc<AtomicUsize>,
}

impl ApiFunction for EchoFunction {
    fn permissions(&self, _default: u8) -> u8 {
        self.required
    }

    fn api(&mut self, ctx: &ApiContext) -> Result<ApiResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResult::by_json(
            json!({"args": ctx.args, "echo": ctx.body.get("topic").cloned()}),
            true,
        ))
    }
}

struct BrokenFunction;

impl ApiFunction for BrokenFunction {
    fn permissions(&self, _default: u8) -> u8 {
        0
    }

    fn api(&mut self, _ctx: &ApiContext) -> Result<ApiResult> {
        anyhow::bail!("downstream device refused")
    }
}

struct Fixture {
    router: Arc<BackendRouter>,
    registry: Arc<DeviceRegistry>,
    echo_calls: Arc<AtomicUsize>,
    guarded_calls: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(DeviceRegistry::new(0.1));

    let mut sensors = SensorRegistry::new();
    sensors.register("plants", Box::new(PlantsSensor));

    let echo_calls = Arc::new(AtomicUsize::new(0));
    let guarded_calls = Arc::new(AtomicUsize::new(0));

    let mut functions = FunctionRegistry::new();
    let calls = Arc::clone(&echo_calls);
    functions.register(
        "ntfy",
        Box::new(move || {
            Box::new(EchoFunction {
                required: 0,
                calls: Arc::clone(&calls),
            })
        }),
    );
    let calls = Arc::clone(&guarded_calls);
    functions.register(
        "evt",
        Box::new(move || {
            Box::new(EchoFunction {
                required: 100,
                calls: Arc::clone(&calls),
            })
        }),
    );
    functions.register("broken", Box::new(|| Box::new(BrokenFunction)));

    let router = Arc::new(BackendRouter::new(
        Arc::clone(&registry),
        OutputRegistry::new(),
        sensors,
        functions,
        false,
    ));

    Fixture {
        router,
        registry,
        echo_calls,
        guarded_calls,
    }
}

fn request(path: &str, token: Option<&str>, body: Option<Value>) -> RecvRequest {
    let mut headers = CiMap::new();
    if let Some(token) = token {
        headers.insert("Authorization", format!("BEARER {token}"));
    }

    let body_bytes = body.map(|b| {
        headers.insert("Content-Type", "application/json");
        serde_json::to_vec(&b).expect("body serializes")
    });

    RecvRequest {
        method: if body_bytes.is_some() {
            WebMethod::Post
        } else {
            WebMethod::Get
        },
        path: path.to_string(),
        version: "HTTP/1.1".to_string(),
        get_args: Map::new(),
        headers,
        body: body_bytes,
        peer: PEER,
    }
}

fn login(fx: &Fixture) -> String {
    let resp = fx.registry.login(
        PEER,
        json!({"subdevices": [{"name": "deck", "token": "SUB1"}], "funcs": ["lock"], "version": 0.1, "os": "test"})
            .as_object()
            .expect("login body"),
    );
    assert_eq!(resp.code, 200);
    let body: Value = serde_json::from_slice(&resp.body).expect("login json");
    assert_eq!(body["update"], json!(false));
    body["token"].as_str().expect("hex token").to_string()
}

#[test]
fn test_unknown_segment_is_404() {
    let fx = fixture();
    let resp = fx.router.handle(&request("/definitely_missing", None, None));
    assert_eq!((resp.code, resp.msg.as_str()), (404, "FUNC_NOT_FOUND"));
}

#[test]
fn test_composite_sensor_and_function() {
    let fx = fixture();
    let token = login(&fx);

    let resp = fx.router.handle(&request(
        "/:default/plants/ntfy.send",
        Some(&token),
        Some(json!({"topic": "x"})),
    ));
    assert_eq!(resp.code, 200);

    let body: Value = serde_json::from_slice(&resp.body).expect("composite json");
    assert_eq!(body["plants"]["status"], json!("OK"));
    assert_eq!(body["ntfy"]["echo"], json!("x"));
    assert_eq!(body["ntfy"]["args"], json!(["send"]));
    assert_eq!(fx.echo_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_token_is_401() {
    let fx = fixture();
    let _token = login(&fx);

    let resp = fx.router.handle(&request("/ntfy", None, None));
    assert_eq!((resp.code, resp.msg.as_str()), (401, "INVALID_TOK"));

    let resp = fx.router.handle(&request("/ntfy", Some("wrong"), None));
    assert_eq!((resp.code, resp.msg.as_str()), (401, "INVALID_TOK"));
    assert_eq!(fx.echo_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_permission_gate_blocks_subdevice() {
    let fx = fixture();
    let _token = login(&fx);

    // The subdevice token authenticates at level 50; `evt` demands 100.
    let resp = fx.router.handle(&request("/evt.SHUTDOWN", Some("sub1"), None));
    assert_eq!((resp.code, resp.msg.as_str()), (403, "NO_PERMS"));
    assert_eq!(
        fx.guarded_calls.load(Ordering::SeqCst),
        0,
        "plugin must not run"
    );

    let token = fx
        .registry
        .get(PEER)
        .expect("device registered")
        .token_hex();
    let resp = fx.router.handle(&request("/evt.SHUTDOWN", Some(&token), None));
    assert_eq!(resp.code, 200);
    assert_eq!(fx.guarded_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unregistered_peer_has_default_level() {
    let fx = fixture();

    // No device: level Default (0); `ntfy` requires 0, so it runs.
    let resp = fx.router.handle(&request("/ntfy", None, None));
    assert_eq!(resp.code, 200);

    // But anything above Default is refused.
    let resp = fx.router.handle(&request("/evt.SHUTDOWN", None, None));
    assert_eq!((resp.code, resp.msg.as_str()), (403, "NO_PERMS"));
}

#[test]
fn test_relogin_replaces_token() {
    let fx = fixture();
    let first = login(&fx);
    let second = login(&fx);
    assert_ne!(first, second);

    let resp = fx.router.handle(&request("/ntfy", Some(&first), None));
    assert_eq!((resp.code, resp.msg.as_str()), (401, "INVALID_TOK"));

    let resp = fx.router.handle(&request("/ntfy", Some(&second), None));
    assert_eq!(resp.code, 200);
}

#[test]
fn test_logout_drops_registration() {
    let fx = fixture();
    let token = login(&fx);

    let resp = fx.router.handle(&request("/logout", Some(&token), None));
    assert_eq!((resp.code, resp.msg.as_str()), (200, "LOGGED_OUT"));
    assert!(fx.registry.get(PEER).is_none());

    // A second logout has no device to drop and falls through to 404.
    let resp = fx.router.handle(&request("/logout", Some(&token), None));
    assert_eq!(resp.code, 404);
}

#[test]
fn test_failed_function_is_fail_stop() {
    let fx = fixture();

    let resp = fx.router.handle(&request("/ntfy/broken/ntfy", None, None));
    assert_eq!((resp.code, resp.msg.as_str()), (500, "FUNC_FAILED"));

    let body: Value = serde_json::from_slice(&resp.body).expect("error json");
    assert_eq!(body["message"], json!("Function `broken` failed!"));
    assert!(body["exception"].as_str().is_some());

    // The earlier segment ran once, the one after the failure never did.
    assert_eq!(fx.echo_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_close_only_from_loopback() {
    let fx = fixture();

    let resp = fx.router.handle(&request("/close", None, None));
    assert_eq!(resp.code, 404, "strangers do not reach the close path");
    assert!(fx.router.running_flag().load(Ordering::SeqCst));

    let mut req = request("/close", None, None);
    req.peer = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let resp = fx.router.handle(&req);
    assert_eq!((resp.code, resp.msg.as_str()), (200, "CLOSED"));
    assert!(!fx.router.running_flag().load(Ordering::SeqCst));
}

#[test]
fn test_execute_local_skips_auth_and_permissions() -> Result<()> {
    let fx = fixture();

    let result = fx
        .router
        .execute_local(&["evt".to_string(), "SHUTDOWN".to_string()], &Map::new())?;
    assert!(result.success());
    assert_eq!(fx.guarded_calls.load(Ordering::SeqCst), 1);

    assert!(
        fx.router
            .execute_local(&["missing".to_string()], &Map::new())
            .is_err()
    );
    Ok(())
}

#[test]
fn test_query_sensor_returns_default_output_shape() -> Result<()> {
    let fx = fixture();
    let result = fx
        .router
        .query_sensor(&["plants".to_string()], &Map::new())?;
    assert_eq!(result["plants"]["status"], json!("OK"));
    Ok(())
}
