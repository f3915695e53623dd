//! Unit tests for JSON-RPC message discrimination and encoding.

use serde_json::json;

use cloud_codex::protocol::{Message, RpcId};
use cloud_codex::AppError;

// ── Shape discrimination ──────────────────────────────────────────────────────

/// `id` + `method` → Request.
#[test]
fn id_and_method_is_request() {
    let msg = Message::parse(r#"{"id":7,"method":"thread/start","params":{"x":1}}"#)
        .expect("valid request");

    match msg {
        Message::Request { id, method, params } => {
            assert_eq!(id, RpcId::Num(7));
            assert_eq!(method, "thread/start");
            assert_eq!(params, Some(json!({"x": 1})));
        }
        other => panic!("expected Request, got: {other:?}"),
    }
}

/// `id` + `result` → Response.
#[test]
fn id_and_result_is_response() {
    let msg = Message::parse(r#"{"id":3,"result":{"ok":true}}"#).expect("valid response");

    match msg {
        Message::Response { id, result, error } => {
            assert_eq!(id, RpcId::Num(3));
            assert_eq!(result, Some(json!({"ok": true})));
            assert!(error.is_none());
        }
        other => panic!("expected Response, got: {other:?}"),
    }
}

/// `method` without `id` → Notification.
#[test]
fn method_without_id_is_notification() {
    let msg = Message::parse(r#"{"method":"turn/started","params":{"turnId":"u1"}}"#)
        .expect("valid notification");

    assert!(
        matches!(msg, Message::Notification { ref method, .. } if method == "turn/started"),
        "expected Notification, got: {msg:?}"
    );
}

/// A response carrying both `result` and `error` keeps both; the error wins
/// at dispatch time.
#[test]
fn error_wins_over_result() {
    let msg = Message::parse(
        r#"{"id":9,"result":{"ok":true},"error":{"code":-32000,"message":"boom"}}"#,
    )
    .expect("valid response");

    match msg {
        Message::Response { error, result, .. } => {
            let error = error.expect("error must be preserved");
            assert_eq!(error.code, -32000);
            assert_eq!(error.message, "boom");
            assert!(result.is_some(), "result is parsed but must lose to error");
        }
        other => panic!("expected Response, got: {other:?}"),
    }
}

// ── Opaque ids ────────────────────────────────────────────────────────────────

/// String and integer ids are never coerced into each other.
#[test]
fn ids_are_opaque() {
    let num = Message::parse(r#"{"id":7,"result":null}"#).expect("numeric id");
    let text = Message::parse(r#"{"id":"7","result":null}"#).expect("string id");

    let (Message::Response { id: num_id, .. }, Message::Response { id: str_id, .. }) = (num, text)
    else {
        panic!("both must parse as responses");
    };

    assert_eq!(num_id, RpcId::Num(7));
    assert_eq!(str_id, RpcId::Str("7".to_owned()));
    assert_ne!(num_id, str_id, "7 and \"7\" must remain distinct ids");
}

// ── Rejections ────────────────────────────────────────────────────────────────

/// Invalid JSON is a protocol error.
#[test]
fn malformed_json_is_rejected() {
    match Message::parse("not-valid-json{{{") {
        Err(AppError::Protocol(msg)) => assert!(
            msg.contains("malformed json"),
            "error must mention 'malformed json', got: {msg}"
        ),
        other => panic!("expected Err(AppError::Protocol), got: {other:?}"),
    }
}

/// An object with neither `id` nor `method` matches no shape.
#[test]
fn shapeless_object_is_rejected() {
    let result = Message::parse(r#"{"params":{"x":1}}"#);
    assert!(
        matches!(result, Err(AppError::Protocol(_))),
        "shapeless object must be rejected, got: {result:?}"
    );
}

/// An id alone — no method, result, or error — matches no shape.
#[test]
fn bare_id_is_rejected() {
    let result = Message::parse(r#"{"id":4}"#);
    assert!(
        matches!(result, Err(AppError::Protocol(_))),
        "bare id must be rejected, got: {result:?}"
    );
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encoded frames are single-line JSON that parse back to the same message.
#[test]
fn encode_line_is_single_line_and_parses_back() {
    let msg = Message::Request {
        id: RpcId::Num(42),
        method: "turn/start".to_owned(),
        params: Some(json!({"threadId": "t1", "input": "hello\nworld"})),
    };

    let line = msg.encode_line();
    assert!(
        !line.contains('\n'),
        "NDJSON line must not contain embedded newlines"
    );

    let reparsed = Message::parse(&line).expect("encoded line must parse back");
    assert_eq!(reparsed, msg);
}

/// An error response encodes only the `error` member.
#[test]
fn error_response_encodes_error_member() {
    let msg = Message::Response {
        id: RpcId::Str("req-1".to_owned()),
        result: Some(json!({"ignored": true})),
        error: Some(cloud_codex::protocol::RpcError {
            code: -32601,
            message: "method not found".to_owned(),
        }),
    };

    let value: serde_json::Value =
        serde_json::from_str(&msg.encode_line()).expect("encoded line is valid JSON");

    assert_eq!(value["id"], "req-1");
    assert_eq!(value["error"]["code"], -32601);
    assert!(
        value.get("result").is_none(),
        "exactly one of result/error appears on the wire"
    );
}
