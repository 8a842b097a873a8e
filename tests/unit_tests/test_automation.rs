use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use joanet::{
    api::{ApiContext, ApiFunction, FunctionRegistry, result::ApiResult},
    backend::{
        automation::{Automation, AutomationState},
        output::OutputRegistry,
        router::BackendRouter,
        sensor::{Sensor, SensorRegistry},
    },
    device::DeviceRegistry,
};
use serde_json::{Map, Value, json};

/// A sensor whose reading the test can move around.
struct MoistureSensor {
    value: Arc<Mutex<f64>>,
}

impl Sensor for MoistureSensor {
    fn poll(&self) -> Result<Map<String, Value>> {
        let value = *self.value.lock().expect("sensor value");
        let Value::Object(map) = json!({"0": value}) else {
            panic!("fixture")
        };
        Ok(map)
    }
}

struct CountedAction {
    calls: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<Map<String, Value>>>>,
}

impl ApiFunction for CountedAction {
    fn api(&mut self, ctx: &ApiContext) -> Result<ApiResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_body.lock().expect("body slot") = Some(ctx.body.clone());
        Ok(ApiResult::empty())
    }
}

struct Fixture {
    router: Arc<BackendRouter>,
    moisture: Arc<Mutex<f64>>,
    ntfy_calls: Arc<AtomicUsize>,
    ntfy_body: Arc<Mutex<Option<Map<String, Value>>>>,
}

fn fixture() -> Fixture {
    let moisture = Arc::new(Mutex::new(0.1));
    let ntfy_calls = Arc::new(AtomicUsize::new(0));
    let ntfy_body = Arc::new(Mutex::new(None));

    let mut sensors = SensorRegistry::new();
    // Zero re-poll window: every query reads the live value.
    sensors.register_with_window(
        "plants",
        Box::new(MoistureSensor {
            value: Arc::clone(&moisture),
        }),
        0.0,
    );

    let mut functions = FunctionRegistry::new();
    let calls = Arc::clone(&ntfy_calls);
    let body_slot = Arc::clone(&ntfy_body);
    functions.register(
        "ntfy",
        Box::new(move || {
            Box::new(CountedAction {
                calls: Arc::clone(&calls),
                last_body: Arc::clone(&body_slot),
            })
        }),
    );

    let router = Arc::new(BackendRouter::new(
        Arc::new(DeviceRegistry::new(0.1)),
        OutputRegistry::new(),
        sensors,
        functions,
        false,
    ));

    Fixture {
        router,
        moisture,
        ntfy_calls,
        ntfy_body,
    }
}

fn automation(fx: &Fixture, declaration: Value) -> Automation {
    Automation::from_value(declaration, Arc::downgrade(&fx.router))
        .expect("declaration parses")
        .expect("declaration is an automation")
}

fn dry_plant_automation(fx: &Fixture) -> Automation {
    automation(
        fx,
        json!({
            "@type": "automation",
            "title": "water reminder",
            "frequency": 1.0,
            "if": {
                "query": "plants",
                "check": "$v < 0.2",
                "body": {"$v": "0"}
            },
            "then": [{"path": "/ntfy", "body": {"level": "$v"}}],
            "wait": {
                "query": "plants",
                "check": "$v >= 0.2",
                "body": {"$v": "0"}
            }
        }),
    )
}

#[test]
fn test_fires_once_then_waits() {
    let fx = fixture();
    let mut auto = dry_plant_automation(&fx);
    assert_eq!(auto.state(), AutomationState::Normal);

    // Below threshold: IF holds, THEN runs, machine starts waiting.
    auto.tick();
    assert_eq!(auto.state(), AutomationState::Waiting);
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 1);

    // Still below threshold: WAIT does not hold, no re-fire.
    auto.tick();
    auto.tick();
    assert_eq!(auto.state(), AutomationState::Waiting);
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 1);

    // Watered: WAIT holds, machine re-arms, next dry spell fires again.
    *fx.moisture.lock().expect("moisture") = 0.6;
    auto.tick();
    assert_eq!(auto.state(), AutomationState::Normal);
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 1);

    *fx.moisture.lock().expect("moisture") = 0.05;
    auto.tick();
    assert_eq!(auto.state(), AutomationState::Waiting);
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_vars_substituted_into_then_body() {
    let fx = fixture();
    let mut auto = dry_plant_automation(&fx);

    auto.tick();
    let body = fx
        .ntfy_body
        .lock()
        .expect("body slot")
        .clone()
        .expect("action ran");
    assert_eq!(body.get("level"), Some(&json!("0.1")));
}

#[test]
fn test_failing_check_leaves_state() {
    let fx = fixture();
    let mut auto = automation(
        &fx,
        json!({
            "@type": "automation",
            "title": "broken",
            "frequency": 1.0,
            "if": {"query": "nosuchsensor", "check": "true", "body": {}},
            "then": [{"path": "/ntfy"}],
        }),
    );

    auto.tick();
    assert_eq!(auto.state(), AutomationState::Normal, "failure does not advance");
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_missing_wait_clause_never_rearms() {
    let fx = fixture();
    let mut auto = automation(
        &fx,
        json!({
            "@type": "automation",
            "title": "one shot",
            "frequency": 1.0,
            "if": {"query": "plants", "check": "$v < 0.2", "body": {"$v": "0"}},
            "then": [{"path": "/ntfy"}],
        }),
    );

    auto.tick();
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 1);

    // No wait clause: the waiting check fails and is logged, state stays.
    auto.tick();
    assert_eq!(auto.state(), AutomationState::Waiting);
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_other_file_types_are_skipped() {
    let fx = fixture();
    let parsed = Automation::from_value(
        json!({"@type": "event", "event": "STARTUP", "then": []}),
        Arc::downgrade(&fx.router),
    )
    .expect("parse succeeds");
    assert!(parsed.is_none());
}
