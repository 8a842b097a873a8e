use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyhow::Result;
use joanet::{
    frontend::shipper::RemoteLogLayer,
    http::{WebMethod, client::WebClient},
    server::RequestHandler,
};
use serde_json::{Value, json};
use serial_test::serial;
use tracing_subscriber::layer::SubscriberExt;

use super::common::{backend_fixture, start_server, wait_for_count};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn login_body() -> Value {
    json!({
        "subdevices": [],
        "funcs": ["lock"],
        "version": 0.1,
        "os": "Linux 5",
    })
}

#[test]
#[serial]
fn test_discovery_to_action_flow() -> Result<()> {
    let fx = backend_fixture();
    let flag = fx.router.running_flag();
    let (server, addr) = start_server(
        Arc::clone(&fx.router) as Arc<dyn RequestHandler>,
        flag,
    );

    // SECURE login: plaintext upgrade, encrypted /login on the same
    // connection server-side.
    let login = WebClient::new(LOCALHOST, addr.port())
        .set_secure(true)
        .set_method(WebMethod::Post)
        .set_path("/login")
        .set_json(login_body())
        .send()?;
    assert_eq!(login.code, 200);

    let body = login.json()?;
    assert_eq!(body["update"], json!(false));
    let token = body["token"].as_str().expect("hex token");
    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    // Composed request: sensor + backend action, encrypted, authenticated.
    let composite = WebClient::new(LOCALHOST, addr.port())
        .set_secure(true)
        .set_method(WebMethod::Post)
        .set_path("/:default/plants/ntfy.send")
        .authorize(Some(token))
        .set_json(json!({"topic": "x"}))
        .send()?;
    assert_eq!(composite.code, 200);

    let body = composite.json()?;
    assert_eq!(body["plants"]["status"], json!("OK"));
    assert_eq!(body["ntfy"]["echo"], json!("x"));
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 1);

    // A wrong token is rejected before any stage runs.
    let rejected = WebClient::new(LOCALHOST, addr.port())
        .set_secure(true)
        .set_path("/ntfy")
        .authorize(Some("deadbeef"))
        .send()?;
    assert_eq!(rejected.code, 401);
    assert_eq!(fx.ntfy_calls.load(Ordering::SeqCst), 1);

    // Logout invalidates the session.
    let logout = WebClient::new(LOCALHOST, addr.port())
        .set_secure(true)
        .set_path("/logout")
        .authorize(Some(token))
        .send()?;
    assert_eq!(logout.code, 200);
    assert!(fx.registry.is_empty());

    server.stop();
    Ok(())
}

#[test]
#[serial]
fn test_options_and_unknown_paths() -> Result<()> {
    let fx = backend_fixture();
    let flag = fx.router.running_flag();
    let (server, addr) = start_server(
        Arc::clone(&fx.router) as Arc<dyn RequestHandler>,
        flag,
    );

    let options = WebClient::new(LOCALHOST, addr.port())
        .set_method(WebMethod::Options)
        .set_path("/anything")
        .send()?;
    assert_eq!(options.code, 204);
    assert_eq!(options.headers.get("allow"), Some("GET, POST, OPTIONS"));

    let missing = WebClient::new(LOCALHOST, addr.port())
        .set_path("/definitely_missing")
        .send()?;
    assert_eq!(missing.code, 404);
    let body = missing.json()?;
    assert_eq!(
        body["message"],
        json!("API function `definitely_missing` not found!")
    );

    server.stop();
    Ok(())
}

#[test]
#[serial]
fn test_public_files_and_site_scripts() -> Result<()> {
    use joanet::server::sitescript::{PageVars, SiteScript, SiteScriptRegistry};

    struct StatusScript;

    impl SiteScript for StatusScript {
        fn display(&self, _get_args: &serde_json::Map<String, Value>) -> PageVars {
            let mut vars = PageVars::default();
            vars.set("STATUS", "#00FF00");
            vars
        }
    }

    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("index.html"), "<html>hi</html>")?;
    std::fs::write(dir.path().join("status.html"), "<b>%%STATUS%%</b>")?;

    let mut scripts = SiteScriptRegistry::new();
    scripts.register("status", Box::new(StatusScript));

    let fx = backend_fixture();
    // Rebuild the router with a public directory and a site script.
    let router = Arc::new(
        joanet::backend::router::BackendRouter::new(
            Arc::clone(&fx.registry),
            joanet::backend::output::OutputRegistry::new(),
            joanet::backend::sensor::SensorRegistry::new(),
            joanet::api::FunctionRegistry::new(),
            false,
        )
        .with_public_dir(dir.path().to_path_buf())
        .with_site_scripts(scripts),
    );
    let flag = router.running_flag();
    let (server, addr) = start_server(Arc::clone(&router) as Arc<dyn RequestHandler>, flag);

    let page = WebClient::new(LOCALHOST, addr.port()).set_path("/index").send()?;
    assert_eq!(page.code, 200);
    assert_eq!(page.body, b"<html>hi</html>");
    assert_eq!(page.content_type(), "text/html");
    assert_eq!(page.headers.get("access-control-allow-origin"), Some("*"));
    assert_eq!(page.headers.get("server"), Some("JoaNetAPI"));

    let templated = WebClient::new(LOCALHOST, addr.port()).set_path("/status").send()?;
    assert_eq!(templated.code, 200);
    assert_eq!(templated.body, b"<b>#00FF00</b>");

    server.stop();
    Ok(())
}

#[test]
#[serial]
fn test_log_shipper_reaches_backend() -> Result<()> {
    let fx = backend_fixture();
    let flag = fx.router.running_flag();
    let (server, addr) = start_server(
        Arc::clone(&fx.router) as Arc<dyn RequestHandler>,
        flag,
    );

    let shipper = RemoteLogLayer::new();
    shipper.arm(LOCALHOST, addr.port(), "sometoken".to_string());

    let subscriber = tracing_subscriber::registry().with(shipper);
    tracing::subscriber::with_default(subscriber, || {
        tracing::warn!("disk almost full");
        tracing::info!("this one stays local");
    });

    assert!(
        wait_for_count(&fx.log_calls, 1, Duration::from_secs(5)),
        "warning record reaches /log"
    );
    // INFO is below the shipping threshold.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fx.log_calls.load(Ordering::SeqCst), 1);

    server.stop();
    Ok(())
}
