use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
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
    server::{RequestHandler, WebServer},
};
use serde_json::{Map, Value, json};

pub struct PlantsSensor;

impl Sensor for PlantsSensor {
    fn poll(&self) -> Result<Map<String, Value>> {
        let Value::Object(map) = json!({"plants": {"data": [0.1, 0.4], "status": "OK"}})
        else {
            panic!("fixture")
        };
        Ok(map)
    }
}

pub struct CountedFunction {
    pub required: u8,
    pub calls: Arc<AtomicUsize>,
}

impl ApiFunction for CountedFunction {
    fn permissions(&self, _default: u8) -> u8 {
        self.required
    }

    fn api(&mut self, ctx: &ApiContext) -> Result<ApiResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResult::by_json(
            json!({"echo": ctx.body.get("topic").cloned()}),
            true,
        ))
    }
}

pub fn counted(
    registry: &mut FunctionRegistry,
    name: &str,
    required: u8,
) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&calls);
    registry.register(
        name,
        Box::new(move || {
            Box::new(CountedFunction {
                required,
                calls: Arc::clone(&inner),
            })
        }),
    );
    calls
}

pub struct BackendFixture {
    pub router: Arc<BackendRouter>,
    pub registry: Arc<DeviceRegistry>,
    pub ntfy_calls: Arc<AtomicUsize>,
    pub log_calls: Arc<AtomicUsize>,
}

/// A backend router with a test sensor and counted stand-ins for the
/// built-in functions.
pub fn backend_fixture() -> BackendFixture {
    let registry = Arc::new(DeviceRegistry::new(0.1));

    let mut sensors = SensorRegistry::new();
    sensors.register("plants", Box::new(PlantsSensor));

    let mut functions = FunctionRegistry::new();
    let ntfy_calls = counted(&mut functions, "ntfy", 0);
    let log_calls = counted(&mut functions, "log", 0);

    let router = Arc::new(BackendRouter::new(
        Arc::clone(&registry),
        OutputRegistry::new(),
        sensors,
        functions,
        false,
    ));

    BackendFixture {
        router,
        registry,
        ntfy_calls,
        log_calls,
    }
}

/// Binds an ephemeral port, runs the accept loop on a thread and waits for
/// the bound address.
pub fn start_server(
    handler: Arc<dyn RequestHandler>,
    flag: Arc<AtomicBool>,
) -> (Arc<WebServer>, SocketAddr) {
    let server = Arc::new(WebServer::with_flag(0, handler, flag));
    let runner = Arc::clone(&server);
    thread::spawn(move || {
        let _ = runner.start_blocking();
    });

    for _ in 0..200 {
        if let Some(addr) = server.local_addr() {
            return (server, addr);
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not come up");
}

/// Polls a counter until it reaches `expected` or the timeout passes.
pub fn wait_for_count(counter: &AtomicUsize, expected: usize, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) >= expected {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}
