//! Dispatcher behaviour with fake response actions and host info.

mod common;

use common::{dispatcher_with, Call, FakeActions};
use serde_json::{json, Value};
use std::sync::Arc;

fn run(raw: &str) -> (String, Arc<FakeActions>) {
    let actions = Arc::new(FakeActions::default());
    let out = dispatcher_with(Arc::clone(&actions), false).execute(raw);
    (out, actions)
}

fn parsed(raw: &str) -> Value {
    let (out, _) = run(raw);
    serde_json::from_str(&out).expect("response is JSON")
}

#[test]
fn malformed_input_yields_error_envelope() {
    let expected = json!({"type": "error", "status": "invalid JSON or missing 'type' field"});
    for raw in [
        "",
        "null",
        "[]",
        "{",
        "\"ping\"",
        r#"{"type":5}"#,
        r#"{"parameters":{}}"#,
        r#"{"type":"ping","parameters":[1,2]}"#,
        "\u{0}\u{ff}garbage",
    ] {
        assert_eq!(parsed(raw), expected, "input {raw:?}");
    }
}

#[test]
fn ping_pongs() {
    assert_eq!(
        parsed(r#"{"type":"ping"}"#),
        json!({"type": "ping", "status": "pong"})
    );
}

#[test]
fn kill_process_routes_pid() {
    let (out, actions) = run(r#"{"type":"kill_process","parameters":{"pid":4242}}"#);
    assert_eq!(actions.calls(), vec![Call::Kill(4242)]);
    let v: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(v, json!({"status": "success", "message": "Process tree terminated"}));
}

#[test]
fn kill_process_without_usable_pid() {
    for raw in [
        r#"{"type":"kill_process"}"#,
        r#"{"type":"kill_process","parameters":{"pid":"4242"}}"#,
        r#"{"type":"kill_process","parameters":{"pid":-7}}"#,
        r#"{"type":"kill_process","parameters":{"pid":1.5}}"#,
    ] {
        let (out, actions) = run(raw);
        assert!(actions.calls().is_empty(), "{raw}");
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v, json!({"status": "failed", "message": "Missing PID"}), "{raw}");
    }
}

#[test]
fn isolation_commands_route_to_executor() {
    let (out, actions) = run(r#"{"type":"isolate_host","parameters":{},"command_id":"c-1"}"#);
    assert_eq!(actions.calls(), vec![Call::Isolate]);
    assert!(out.contains("\"status\":\"success\""));

    let (out, actions) = run(r#"{"type":"deisolate_host"}"#);
    assert_eq!(actions.calls(), vec![Call::Deisolate]);
    let v: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(v["status"], "failed");
    assert!(v["message"].as_str().unwrap().contains("Check Admin privileges"));
}

#[test]
fn auth_handshake_messages() {
    let v = parsed(r#"{"type":"auth","message":"Authentication required"}"#);
    assert_eq!(v["type"], "auth");
    assert_eq!(v["info"]["hostname"], "ws-042");
    assert_eq!(v["info"]["mac_address"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(v["info"]["version_number"], "6.8.0");

    let (out, _) = run(r#"{"type":"auth","message":"Authentication successful"}"#);
    assert_eq!(out, "");

    assert_eq!(parsed(r#"{"type":"auth","message":"who are you"}"#)["type"], "error");
    assert_eq!(parsed(r#"{"type":"auth"}"#)["type"], "error");
}

#[test]
fn system_info_is_nested() {
    let v = parsed(r#"{"type":"system_info"}"#);
    assert_eq!(v["type"], "system_info");
    let info = &v["info"]["system_info"];
    assert_eq!(info["cpu_cores"], 8);
    assert_eq!(info["total_memory"], 15.5);
    assert_eq!(info["username"], "analyst");
    assert_eq!(info["architecture"], "x86_64");
}

#[test]
fn system_info_failure() {
    let d = dispatcher_with(Arc::new(FakeActions::default()), true);
    let v: Value = serde_json::from_str(&d.execute(r#"{"type":"system_info"}"#)).unwrap();
    assert_eq!(v, json!({"type": "error", "status": "failed to get system info"}));
}

#[test]
fn echo_and_event_need_string_message() {
    assert_eq!(run(r#"{"type":"echo","message":"hi"}"#).0, "");
    assert_eq!(run(r#"{"type":"event","message":"disk full"}"#).0, "");
    let bad = json!({"type": "error", "status": "missing or invalid 'message'"});
    assert_eq!(parsed(r#"{"type":"echo"}"#), bad);
    assert_eq!(parsed(r#"{"type":"event","message":{"a":1}}"#), bad);
}

#[test]
fn unknown_command() {
    assert_eq!(
        parsed(r#"{"type":"reverse_shell","parameters":{"host":"x"}}"#),
        json!({"type": "error", "status": "unknown command"})
    );
}

#[test]
fn responses_round_trip() {
    use edr_agent::types::ResponseEnvelope;
    for raw in [
        r#"{"type":"ping"}"#,
        r#"{"type":"system_info"}"#,
        r#"{"type":"kill_process","parameters":{"pid":9}}"#,
        r#"{"type":"nope"}"#,
    ] {
        let out = run(raw).0;
        let env: ResponseEnvelope = serde_json::from_str(&out).unwrap();
        assert_eq!(env.to_json(), out);
    }
}
