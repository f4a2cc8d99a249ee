//! End-to-end session routing through the broker with a stub downstream.

use serde_json::json;

use acp_broker::rpc::types::{ERR_INVALID_PARAMS, ERR_INVALID_REQUEST, ERR_METHOD_NOT_FOUND};

use super::test_helpers::{
    result_value, rich_caps, start_broker, stub_agent, stub_config, within,
};

#[tokio::test]
async fn session_new_returns_downstream_assigned_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (spawn, _handles) = stub_agent("session_stub", rich_caps());
    let fixture = start_broker(stub_config(), spawn);

    let resp = within(fixture.upstream.call(
        "session/new",
        &json!({ "cwd": temp.path().to_str().expect("utf-8 path") }),
    ))
    .await
    .expect("session/new must succeed");

    assert!(resp.error.is_none(), "unexpected error: {:?}", resp.error);
    assert_eq!(result_value(&resp), json!({ "sessionId": "session_stub" }));
}

#[tokio::test]
async fn prompt_routes_downstream_and_updates_flow_back() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (spawn, mut handles) = stub_agent("session_stub", rich_caps());
    let mut fixture = start_broker(stub_config(), spawn);

    let new_resp = within(fixture.upstream.call(
        "session/new",
        &json!({ "cwd": temp.path().to_str().expect("utf-8 path") }),
    ))
    .await
    .expect("session/new must succeed");
    assert!(new_resp.error.is_none());

    let prompt_resp = within(fixture.upstream.call(
        "session/prompt",
        &json!({
            "sessionId": "session_stub",
            "prompt": [{ "role": "user", "content": "hello" }],
        }),
    ))
    .await
    .expect("session/prompt must succeed");
    assert_eq!(result_value(&prompt_resp), json!({ "stopReason": "end" }));

    // The stub saw the prompt with the original session id and payload.
    let forwarded = within(handles.prompts.recv())
        .await
        .expect("prompt must reach the stub");
    assert_eq!(forwarded["sessionId"], "session_stub");
    assert_eq!(forwarded["prompt"][0]["content"], "hello");

    // Exactly one session/update notification must surface upstream.
    let note = within(fixture.notifications.recv())
        .await
        .expect("session/update must be forwarded upstream");
    assert_eq!(note.method, "session/update");
    let params: serde_json::Value =
        serde_json::from_str(note.params.as_deref().expect("params").get()).expect("json");
    assert_eq!(params["sessionId"], "session_stub");
}

#[tokio::test]
async fn prompt_for_unknown_session_is_invalid_params() {
    let (spawn, _handles) = stub_agent("session_stub", rich_caps());
    let fixture = start_broker(stub_config(), spawn);

    let resp = within(fixture.upstream.call(
        "session/prompt",
        &json!({ "sessionId": "ghost", "prompt": [] }),
    ))
    .await
    .expect("transport must stay healthy");

    let error = resp.error.expect("error expected");
    assert_eq!(error.code, ERR_INVALID_PARAMS);
    assert!(error.message.contains("unknown session"));
}

#[tokio::test]
async fn session_new_requires_absolute_cwd() {
    let (spawn, _handles) = stub_agent("session_stub", rich_caps());
    let fixture = start_broker(stub_config(), spawn);

    let resp = within(
        fixture
            .upstream
            .call("session/new", &json!({ "cwd": "relative/dir" })),
    )
    .await
    .expect("transport must stay healthy");

    let error = resp.error.expect("error expected");
    assert_eq!(error.code, ERR_INVALID_PARAMS);
    assert!(error.message.contains("absolute"));
}

#[tokio::test]
async fn session_new_requires_configured_agent_command() {
    let (spawn, _handles) = stub_agent("session_stub", rich_caps());
    let mut config = stub_config();
    config.agent.command = String::new();
    let fixture = start_broker(config, spawn);

    let resp = within(
        fixture
            .upstream
            .call("session/new", &json!({ "cwd": "/tmp" })),
    )
    .await
    .expect("transport must stay healthy");

    let error = resp.error.expect("error expected");
    assert_eq!(error.code, ERR_INVALID_PARAMS);
    assert!(error.message.contains("agent.command"));
}

#[tokio::test]
async fn close_deregisters_the_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (spawn, _handles) = stub_agent("session_stub", rich_caps());
    let fixture = start_broker(stub_config(), spawn);

    within(fixture.upstream.call(
        "session/new",
        &json!({ "cwd": temp.path().to_str().expect("utf-8 path") }),
    ))
    .await
    .expect("session/new must succeed");

    let close_resp = within(
        fixture
            .upstream
            .call("_tldw/session/close", &json!({ "sessionId": "session_stub" })),
    )
    .await
    .expect("close must succeed");
    assert!(close_resp.error.is_none());

    let resp = within(fixture.upstream.call(
        "session/prompt",
        &json!({ "sessionId": "session_stub", "prompt": [] }),
    ))
    .await
    .expect("transport must stay healthy");
    let error = resp.error.expect("session must be gone");
    assert!(error.message.contains("unknown session"));
}

#[tokio::test]
async fn cancel_is_forwarded_as_notification_and_acked() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (spawn, handles) = stub_agent("session_stub", rich_caps());
    let fixture = start_broker(stub_config(), spawn);

    within(fixture.upstream.call(
        "session/new",
        &json!({ "cwd": temp.path().to_str().expect("utf-8 path") }),
    ))
    .await
    .expect("session/new must succeed");

    // Capture cancel notifications on the stub side.
    let (cancel_tx, mut cancel_rx) = tokio::sync::mpsc::channel(4);
    {
        let conns = handles.conns.lock().expect("stub conns");
        let stub = conns.last().expect("stub conn spawned").clone();
        stub.set_notification_handler(move |msg| {
            let cancel_tx = cancel_tx.clone();
            Box::pin(async move {
                let _ = cancel_tx.send(msg).await;
            })
        });
    }

    let resp = within(
        fixture
            .upstream
            .call("session/cancel", &json!({ "sessionId": "session_stub" })),
    )
    .await
    .expect("cancel with id must be acked with null");
    assert!(resp.error.is_none());

    let note = within(cancel_rx.recv())
        .await
        .expect("cancel must reach the stub as a notification");
    assert_eq!(note.method, "session/cancel");
    assert!(note.id.is_none());
}

#[tokio::test]
async fn unknown_methods_are_rejected() {
    let (spawn, _handles) = stub_agent("session_stub", rich_caps());
    let fixture = start_broker(stub_config(), spawn);

    for method in ["session/load", "made/up"] {
        let resp = within(fixture.upstream.call(method, &json!({})))
            .await
            .expect("transport must stay healthy");
        let error = resp.error.expect("error expected");
        assert_eq!(error.code, ERR_METHOD_NOT_FOUND, "{method}");
    }
}

#[tokio::test]
async fn wrong_jsonrpc_version_is_invalid_request() {
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use acp_broker::broker::Broker;

    // Drive the broker over a raw transport so the -32600 response for an
    // id the client library never minted can be observed directly.
    let (spawn, _handles) = stub_agent("session_stub", rich_caps());
    let broker = Broker::new(Arc::new(stub_config()));
    broker.set_spawn_fn(spawn);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (sr, sw) = tokio::io::split(server_io);
    tokio::spawn(async move {
        let _ = broker.serve(sr, sw).await;
    });

    let (cr, mut cw) = tokio::io::split(client_io);
    cw.write_all(b"{\"jsonrpc\":\"1.0\",\"id\":99,\"method\":\"initialize\"}\n")
        .await
        .expect("write request");

    let mut reader = BufReader::new(cr);
    let mut line = String::new();
    within(reader.read_line(&mut line)).await.expect("read response");

    let resp: serde_json::Value = serde_json::from_str(&line).expect("valid JSON response");
    assert_eq!(resp["id"], 99);
    assert_eq!(resp["error"]["code"], ERR_INVALID_REQUEST);
}
