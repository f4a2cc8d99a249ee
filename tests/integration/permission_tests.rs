//! Permission-prompt forwarding: agent → broker → upstream client.

use std::sync::Arc;

use serde_json::json;

use acp_broker::rpc::conn::Conn;
use acp_broker::rpc::types::{RpcResponse, ERR_INTERNAL};

use super::test_helpers::{
    result_value, rich_caps, start_broker, stub_agent, stub_config, within,
};

async fn establish_session(
    fixture: &super::test_helpers::BrokerFixture,
    cwd: &std::path::Path,
) {
    within(fixture.upstream.call(
        "session/new",
        &json!({ "cwd": cwd.to_str().expect("utf-8 path") }),
    ))
    .await
    .expect("session/new must succeed");
}

fn stub_conn(handles: &super::test_helpers::StubHandles) -> Arc<Conn> {
    handles
        .conns
        .lock()
        .expect("stub conns")
        .last()
        .expect("stub conn spawned")
        .clone()
}

#[tokio::test]
async fn permission_prompt_round_trips_to_the_upstream_client() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (spawn, handles) = stub_agent("session_perm", rich_caps());
    let fixture = start_broker(stub_config(), spawn);

    // The upstream client grants whatever permission is requested.
    fixture.upstream.set_handler(|msg| {
        Box::pin(async move {
            assert_eq!(msg.method, "session/request_permission");
            Ok(Some(RpcResponse::from_value(
                msg.id,
                json!({ "outcome": { "outcome": "selected", "optionId": "allow" } }),
            )?))
        })
    });

    establish_session(&fixture, temp.path()).await;
    let stub = stub_conn(&handles);

    let resp = within(stub.call(
        "session/request_permission",
        &json!({
            "sessionId": "session_perm",
            "toolCall": { "title": "write file" },
            "options": [{ "optionId": "allow", "name": "Allow" }],
        }),
    ))
    .await
    .expect("permission call must succeed");

    assert!(resp.error.is_none());
    assert_eq!(
        result_value(&resp),
        json!({ "outcome": { "outcome": "selected", "optionId": "allow" } })
    );
}

#[tokio::test]
async fn upstream_error_degrades_to_cancelled_outcome() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (spawn, handles) = stub_agent("session_perm", rich_caps());
    let fixture = start_broker(stub_config(), spawn);

    // The upstream client refuses the method outright.
    fixture.upstream.set_handler(|msg| {
        Box::pin(async move {
            Ok(Some(RpcResponse::error(
                msg.id,
                ERR_INTERNAL,
                "no permission UI available",
            )))
        })
    });

    establish_session(&fixture, temp.path()).await;
    let stub = stub_conn(&handles);

    let resp = within(stub.call("session/request_permission", &json!({})))
        .await
        .expect("the agent must still receive a result");

    assert!(
        resp.error.is_none(),
        "failures must never surface as RPC errors to the agent"
    );
    assert_eq!(
        result_value(&resp),
        json!({ "outcome": { "outcome": "cancelled" } })
    );
}
