use std::net::{IpAddr, Ipv4Addr};

use joanet::device::DeviceRegistry;
use serde_json::{Map, Value, json};

const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

fn body(version: f64) -> Map<String, Value> {
    let Value::Object(map) = json!({
        "subdevices": [],
        "funcs": ["lock"],
        "version": version,
        "os": "Linux 5",
    }) else {
        panic!("fixture")
    };
    map
}

#[test]
fn test_login_issues_hex_token_and_update_flag() {
    let registry = DeviceRegistry::new(0.2);

    let resp = registry.login(PEER, &body(0.1));
    assert_eq!((resp.code, resp.msg.as_str()), (200, "LOGGED_IN"));

    let parsed: Value = serde_json::from_slice(&resp.body).expect("login json");
    assert_eq!(parsed["message"], json!("Device logged in"));
    assert_eq!(parsed["update"], json!(true), "0.2 > 0.1 asks for an update");

    let token = parsed["token"].as_str().expect("token");
    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    let device = registry.get(PEER).expect("registered");
    assert_eq!(device.token_hex(), token);
    assert!(device.has_remote_fun("lock"));
}

#[test]
fn test_same_version_needs_no_update() {
    let registry = DeviceRegistry::new(0.1);
    let resp = registry.login(PEER, &body(0.1));
    let parsed: Value = serde_json::from_slice(&resp.body).expect("login json");
    assert_eq!(parsed["update"], json!(false));
}

#[test]
fn test_malformed_login_is_bad_body() {
    let registry = DeviceRegistry::new(0.1);
    let Value::Object(bad) = json!({"subdevices": "not-a-list"}) else {
        panic!("fixture")
    };
    let resp = registry.login(PEER, &bad);
    assert_eq!((resp.code, resp.msg.as_str()), (400, "BAD_BODY"));
    assert!(registry.get(PEER).is_none());
}

#[test]
fn test_relogin_replaces_record() {
    let registry = DeviceRegistry::new(0.1);
    registry.login(PEER, &body(0.1));
    let first = registry.get(PEER).expect("first record").token_hex();

    registry.login(PEER, &body(0.1));
    let second = registry.get(PEER).expect("second record").token_hex();

    assert_ne!(first, second, "old token dies with the old record");
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_logout_removes_only_that_peer() {
    let registry = DeviceRegistry::new(0.1);
    let other = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 21));
    registry.login(PEER, &body(0.1));
    registry.login(other, &body(0.1));

    assert!(registry.logout(PEER).is_some());
    assert!(registry.get(PEER).is_none());
    assert!(registry.get(other).is_some());
    assert!(registry.logout(PEER).is_none());
}
