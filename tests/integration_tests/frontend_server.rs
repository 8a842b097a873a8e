use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyhow::Result;
use joanet::{
    api::FunctionRegistry,
    frontend::FrontendRouter,
    http::{RecvRequest, WebMethod, client::WebClient},
    server::RequestHandler,
    utils::CiMap,
};
use serde_json::{Map, json};
use serial_test::serial;

use super::common::{counted, start_server};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const TOKEN: &str = "00112233445566778899aabbccddeeff";

fn router() -> (Arc<FrontendRouter>, Arc<std::sync::atomic::AtomicUsize>) {
    let mut functions = FunctionRegistry::new();
    let calls = counted(&mut functions, "lock", 50);
    let router = Arc::new(FrontendRouter::new(
        LOCALHOST,
        TOKEN.to_string(),
        functions,
    ));
    (router, calls)
}

#[test]
#[serial]
fn test_backend_token_grants_access() -> Result<()> {
    let (router, calls) = router();
    let flag = router.running_flag();
    let (server, addr) = start_server(Arc::clone(&router) as Arc<dyn RequestHandler>, flag);

    // The backend calls with the token it assigned at login.
    let ok = WebClient::new(LOCALHOST, addr.port())
        .set_secure(true)
        .set_method(WebMethod::Post)
        .set_path("/lock")
        .authorize(Some(TOKEN))
        .send()?;
    assert_eq!(ok.code, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Without the token the caller sits at Default and `lock` needs 50.
    let denied = WebClient::new(LOCALHOST, addr.port())
        .set_secure(true)
        .set_path("/lock")
        .send()?;
    assert_eq!(denied.code, 403);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let missing = WebClient::new(LOCALHOST, addr.port())
        .set_path("/paste")
        .authorize(Some(TOKEN))
        .send()?;
    assert_eq!(missing.code, 404);

    server.stop();
    Ok(())
}

#[test]
#[serial]
fn test_close_stops_the_server() -> Result<()> {
    let (router, _calls) = router();
    let flag = router.running_flag();
    let (_server, addr) =
        start_server(Arc::clone(&router) as Arc<dyn RequestHandler>, Arc::clone(&flag));

    let closed = WebClient::new(LOCALHOST, addr.port()).set_path("/close").send()?;
    assert_eq!(closed.code, 200);
    assert_eq!(closed.json()?["message"], json!("Closed!"));

    // The accept loop polls the flag at 100 ms; give it a moment.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while flag.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!flag.load(Ordering::SeqCst));
    Ok(())
}

#[test]
#[serial]
fn test_strangers_are_redirected() {
    // Direct handler call: a peer that is neither the backend nor loopback
    // gets pointed at the backend.
    let backend_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let router = FrontendRouter::new(backend_ip, TOKEN.to_string(), FunctionRegistry::new());

    let req = RecvRequest {
        method: WebMethod::Get,
        path: "/lock".to_string(),
        version: "HTTP/1.1".to_string(),
        get_args: Map::new(),
        headers: CiMap::new(),
        body: None,
        peer: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)),
    };
    let resp = router.handle(&req);
    assert_eq!((resp.code, resp.msg.as_str()), (301, "MOVED"));
    assert_eq!(
        resp.headers.get("Location").map(String::as_str),
        Some("http://10.0.0.1:4001/lock")
    );
}
