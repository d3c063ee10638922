use serde_json::json;

use agent_fleet::agent::process::QueryOptions;
use agent_fleet::ipc::{ControlRequest, ControlResponse};
use agent_fleet::AppError;

#[test]
fn start_carries_query_options_inline() {
    let request: ControlRequest = serde_json::from_value(json!({
        "command": "start",
        "prompt": "List the files",
        "model": "sonnet",
        "resume": "conv-1",
    }))
    .expect("decode");

    match request {
        ControlRequest::Start(QueryOptions {
            prompt,
            model,
            resume,
            ..
        }) => {
            assert_eq!(prompt, "List the files");
            assert_eq!(model.as_deref(), Some("sonnet"));
            assert_eq!(resume.as_deref(), Some("conv-1"));
        }
        other => panic!("expected start, got {other:?}"),
    }
}

#[test]
fn cursor_defaults_to_zero() {
    let subscribe: ControlRequest =
        serde_json::from_value(json!({ "command": "subscribe" })).expect("decode");
    assert_eq!(subscribe, ControlRequest::Subscribe { after: 0 });

    let messages: ControlRequest =
        serde_json::from_value(json!({ "command": "messages", "after": 12 })).expect("decode");
    assert_eq!(messages, ControlRequest::Messages { after: 12 });
}

#[test]
fn unit_commands_encode_as_bare_verbs() {
    for (request, verb) in [
        (ControlRequest::Interrupt, "interrupt"),
        (ControlRequest::Status, "status"),
        (ControlRequest::Commands, "commands"),
        (ControlRequest::Health, "health"),
    ] {
        assert_eq!(
            serde_json::to_value(&request).expect("encode"),
            json!({ "command": verb })
        );
        assert_eq!(request.verb(), verb);
    }
}

#[test]
fn unknown_command_is_rejected() {
    assert!(serde_json::from_value::<ControlRequest>(json!({ "command": "reboot" })).is_err());
    assert!(serde_json::from_value::<ControlRequest>(json!({ "prompt": "x" })).is_err());
}

#[test]
fn failure_response_restores_error_category() {
    let response = ControlResponse::failure(&AppError::Conflict("a query is running".into()));
    let line = serde_json::to_string(&response).expect("encode");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&line).expect("json"),
        json!({ "ok": false, "error": "a query is running", "code": "conflict" })
    );

    let decoded: ControlResponse = serde_json::from_str(&line).expect("decode");
    match decoded.into_result() {
        Err(AppError::Conflict(msg)) => assert_eq!(msg, "a query is running"),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[test]
fn success_response_yields_data() {
    let response = ControlResponse::success(json!({ "started": true, "lastSequence": 4 }));
    let data = response.into_result().expect("ok");
    assert_eq!(data["lastSequence"], 4);

    let bare: ControlResponse = serde_json::from_value(json!({ "ok": true })).expect("decode");
    assert_eq!(bare.into_result().expect("ok"), serde_json::Value::Null);

    let uncoded: ControlResponse =
        serde_json::from_value(json!({ "ok": false, "error": "eh" })).expect("decode");
    assert!(matches!(uncoded.into_result(), Err(AppError::Ipc(_))));
}
