//! Session broker: routes ACP traffic between the upstream client and
//! per-session downstream agent processes.
//!
//! The broker serves the upstream method surface (`initialize`,
//! `session/new`, `session/prompt`, `session/cancel`, `_tldw/session/close`),
//! spawns one agent child per session, and answers the agent's callbacks:
//! file reads/writes through the workspace guard, terminal operations
//! through the allowlisted command engine, and permission prompts forwarded
//! upstream. Downstream notifications such as `session/update` pass through
//! to the client verbatim.
//!
//! Session ids are assigned by the downstream agent; a session is only
//! registered once its `session/new` round trip succeeded, and a watcher
//! task removes it again when the downstream read loop ends.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fsops::FsOps;
use crate::rpc::conn::Conn;
use crate::rpc::types::{
    RpcMessage, RpcResponse, ERR_INTERNAL, ERR_INVALID_PARAMS, ERR_INVALID_REQUEST,
    ERR_METHOD_NOT_FOUND, JSONRPC_VERSION,
};
use crate::terminal::TerminalManager;
use crate::workspace::WorkspaceGuard;
use crate::{AppError, Result};

/// ACP protocol version the broker speaks on both sides.
pub const PROTOCOL_VERSION: u32 = 1;

const BROKER_NAME: &str = "acp-broker";
const BROKER_TITLE: &str = "ACP Workspace Broker";

/// Bound on the one-shot capability probe spawn.
const CAPABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Spawn plumbing ───────────────────────────────────────────────────────────

/// A connected downstream agent produced by a spawn function.
pub struct SpawnedAgent {
    pub conn: Arc<Conn>,
    /// Child process handle; absent for in-process test doubles.
    pub child: Option<Child>,
}

/// Future produced by a [`SpawnFn`].
pub type SpawnFuture = Pin<Box<dyn Future<Output = Result<SpawnedAgent>> + Send>>;
/// Factory for downstream agents; swappable so tests can wire in-memory peers.
pub type SpawnFn = Box<dyn Fn() -> SpawnFuture + Send + Sync>;

// ── Session ──────────────────────────────────────────────────────────────────

struct Session {
    /// Downstream-assigned id; set exactly once at registration time.
    id: OnceLock<String>,
    downstream: Arc<Conn>,
    process: tokio::sync::Mutex<Option<Child>>,
    /// The session's workspace guard lives on inside `fs` and `terminals`.
    fs: FsOps,
    terminals: TerminalManager,
}

impl Session {
    fn matches_id(&self, requested: &str) -> bool {
        requested.is_empty() || self.id.get().map(String::as_str) == Some(requested)
    }
}

// ── Broker ───────────────────────────────────────────────────────────────────

/// The broker / session router.
pub struct Broker {
    config: Arc<Config>,
    upstream: Mutex<Option<Arc<Conn>>>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    cached_caps: Mutex<Option<Map<String, Value>>>,
    spawn_fn: Mutex<SpawnFn>,
}

impl Broker {
    /// Create a broker whose spawn function launches `agent.command` from
    /// the configuration.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let spawn_config = Arc::clone(&config);
        Arc::new(Self {
            config,
            upstream: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            cached_caps: Mutex::new(None),
            spawn_fn: Mutex::new(Box::new(move || {
                let config = Arc::clone(&spawn_config);
                Box::pin(async move { spawn_downstream(&config) })
            })),
        })
    }

    /// Replace the downstream spawn function (test hook).
    pub fn set_spawn_fn(&self, spawn: SpawnFn) {
        *self
            .spawn_fn
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = spawn;
    }

    /// Serve the upstream connection over the given byte streams until EOF,
    /// then shut down every session.
    ///
    /// # Errors
    ///
    /// Returns the transport or protocol error that terminated the upstream
    /// read loop; clean EOF is `Ok(())`.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Arc::new(Conn::new(reader, writer));
        *self
            .upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&conn));

        let broker = Arc::clone(&self);
        conn.set_handler(move |msg| {
            let broker = Arc::clone(&broker);
            Box::pin(async move { broker.handle_upstream_request(msg).await })
        });
        let broker = Arc::clone(&self);
        conn.set_notification_handler(move |msg| {
            let broker = Arc::clone(&broker);
            Box::pin(async move { broker.handle_upstream_notification(msg).await })
        });

        let result = conn.run().await;
        self.shutdown().await;
        result
    }

    // ── Upstream dispatch ────────────────────────────────────────────────────

    async fn handle_upstream_request(
        self: Arc<Self>,
        msg: RpcMessage,
    ) -> Result<Option<RpcResponse>> {
        if !msg.jsonrpc.is_empty() && msg.jsonrpc != JSONRPC_VERSION {
            return Ok(Some(RpcResponse::error(
                msg.id,
                ERR_INVALID_REQUEST,
                "unsupported jsonrpc version",
            )));
        }

        let method = msg.method.clone();
        match method.as_str() {
            "initialize" => self.handle_initialize(msg).await.map(Some),
            "session/new" => self.handle_session_new(msg).await.map(Some),
            "session/prompt" => self.handle_session_prompt(msg).await.map(Some),
            "session/cancel" => self.handle_session_cancel(msg).await,
            "_tldw/session/close" => self.handle_session_close(msg).await.map(Some),
            "session/load" => Ok(Some(RpcResponse::error(
                msg.id,
                ERR_METHOD_NOT_FOUND,
                "session/load not supported",
            ))),
            _ => Ok(Some(RpcResponse::error(
                msg.id,
                ERR_METHOD_NOT_FOUND,
                "method not found",
            ))),
        }
    }

    async fn handle_upstream_notification(&self, msg: RpcMessage) {
        // The only upstream notification with routing semantics is the
        // id-less form of session/cancel; everything else is ignored.
        if msg.method == "session/cancel" {
            self.forward_cancel(&msg.params).await;
        }
    }

    async fn handle_initialize(&self, msg: RpcMessage) -> Result<RpcResponse> {
        let capabilities = self.build_agent_capabilities().await;
        RpcResponse::from_value(
            msg.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "agentCapabilities": capabilities,
                "agentInfo": broker_info(),
                "authMethods": [],
            }),
        )
    }

    async fn handle_session_new(self: Arc<Self>, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();

        if self.config.agent.command.is_empty() {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "agent.command is required",
            ));
        }

        #[derive(Deserialize)]
        struct NewParams {
            #[serde(default)]
            cwd: String,
        }
        let Ok(params) = parse_params::<NewParams>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid session/new params",
            ));
        };
        if params.cwd.is_empty() || !Path::new(&params.cwd).is_absolute() {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "cwd must be an absolute path",
            ));
        }

        let guard = match WorkspaceGuard::new(&self.config) {
            Ok(guard) => Arc::new(guard),
            Err(err) => return Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        };
        if let Err(err) = guard.set_root(Path::new(&params.cwd)) {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                format!("invalid cwd: {err}"),
            ));
        }

        let spawned = match self.spawn_agent().await {
            Ok(spawned) => spawned,
            Err(err) => return Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        };

        let session = Arc::new(Session {
            id: OnceLock::new(),
            downstream: spawned.conn,
            process: tokio::sync::Mutex::new(spawned.child),
            fs: FsOps::new(Arc::clone(&self.config), Arc::clone(&guard)),
            terminals: TerminalManager::new(Arc::clone(&self.config), guard),
        });

        let broker = Arc::clone(&self);
        let handler_session = Arc::clone(&session);
        session.downstream.set_handler(move |req| {
            let broker = Arc::clone(&broker);
            let session = Arc::clone(&handler_session);
            Box::pin(async move { broker.handle_downstream_request(&session, req).await })
        });
        let broker = Arc::clone(&self);
        session.downstream.set_notification_handler(move |note| {
            let broker = Arc::clone(&broker);
            Box::pin(async move { broker.forward_downstream_notification(note).await })
        });

        let run_conn = Arc::clone(&session.downstream);
        let run_handle = tokio::spawn(async move { run_conn.run().await });

        // Downstream handshake: initialize, then forward session/new with the
        // caller's raw params so unknown fields survive.
        match session.downstream.call("initialize", &init_params(&self.config)).await {
            Err(err) => {
                terminate_session(&session).await;
                return Ok(RpcResponse::error(
                    id,
                    ERR_INTERNAL,
                    format!("downstream initialize failed: {err}"),
                ));
            }
            Ok(resp) => {
                if let Some(error) = resp.error {
                    terminate_session(&session).await;
                    return Ok(RpcResponse::from_error(id, error));
                }
                if let Some(result) = resp.result.as_deref() {
                    self.update_cached_capabilities(result);
                }
            }
        }

        let resp = match session
            .downstream
            .call_raw("session/new", msg.params.clone())
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                terminate_session(&session).await;
                return Ok(RpcResponse::error(
                    id,
                    ERR_INTERNAL,
                    format!("downstream session/new failed: {err}"),
                ));
            }
        };
        if let Some(error) = resp.error {
            terminate_session(&session).await;
            return Ok(RpcResponse::from_error(id, error));
        }
        let Some(result) = resp.result else {
            terminate_session(&session).await;
            return Ok(RpcResponse::error(
                id,
                ERR_INTERNAL,
                "invalid downstream session/new result",
            ));
        };

        #[derive(Deserialize)]
        struct NewResult {
            #[serde(rename = "sessionId", default)]
            session_id: String,
        }
        let session_id = match serde_json::from_str::<NewResult>(result.get()) {
            Ok(parsed) if !parsed.session_id.is_empty() => parsed.session_id,
            Ok(_) => {
                terminate_session(&session).await;
                return Ok(RpcResponse::error(
                    id,
                    ERR_INTERNAL,
                    "missing downstream sessionId",
                ));
            }
            Err(_) => {
                terminate_session(&session).await;
                return Ok(RpcResponse::error(
                    id,
                    ERR_INTERNAL,
                    "invalid downstream session/new result",
                ));
            }
        };

        let _ = session.id.set(session_id.clone());
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), Arc::clone(&session));
        info!(session_id, "session registered");

        // Watcher: when the downstream read loop ends (agent exit or EOF),
        // deregister and reap.
        let broker = Arc::clone(&self);
        let watch_id = session_id;
        tokio::spawn(async move {
            match run_handle.await {
                Ok(Ok(())) => debug!(session_id = %watch_id, "downstream closed"),
                Ok(Err(err)) => {
                    warn!(session_id = %watch_id, %err, "downstream connection failed");
                }
                Err(err) => warn!(session_id = %watch_id, %err, "downstream task panicked"),
            }
            broker.cleanup_session(&watch_id).await;
        });

        Ok(RpcResponse::from_raw(id, result))
    }

    async fn handle_session_prompt(&self, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();
        let Ok(params) = parse_params::<SessionRef>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid session/prompt params",
            ));
        };
        let Some(session) = self.get_session(&params.session_id) else {
            return Ok(RpcResponse::error(id, ERR_INVALID_PARAMS, "unknown session"));
        };

        match session
            .downstream
            .call_raw("session/prompt", msg.params.clone())
            .await
        {
            Err(err) => Ok(RpcResponse::error(
                id,
                ERR_INTERNAL,
                format!("downstream session/prompt failed: {err}"),
            )),
            Ok(resp) => {
                if let Some(error) = resp.error {
                    return Ok(RpcResponse::from_error(id, error));
                }
                match resp.result {
                    Some(result) => Ok(RpcResponse::from_raw(id, result)),
                    None => RpcResponse::null(id),
                }
            }
        }
    }

    async fn handle_session_cancel(&self, msg: RpcMessage) -> Result<Option<RpcResponse>> {
        self.forward_cancel(&msg.params).await;
        if msg.has_id() {
            return RpcResponse::null(msg.id).map(Some);
        }
        Ok(None)
    }

    /// Fire-and-forget `session/cancel` propagation; no ack is awaited.
    async fn forward_cancel(&self, params: &Option<Box<RawValue>>) {
        if let Ok(parsed) = parse_params::<SessionRef>(params) {
            if let Some(session) = self.get_session(&parsed.session_id) {
                if let Err(err) = session
                    .downstream
                    .notify_raw("session/cancel", params.clone())
                    .await
                {
                    debug!(%err, "failed to forward session/cancel downstream");
                }
            }
        }
    }

    async fn handle_session_close(&self, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();
        match parse_params::<SessionRef>(&msg.params) {
            Ok(params) if !params.session_id.is_empty() => {
                self.cleanup_session(&params.session_id).await;
                RpcResponse::null(id)
            }
            _ => Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid session/close params",
            )),
        }
    }

    // ── Downstream callbacks ─────────────────────────────────────────────────

    async fn handle_downstream_request(
        &self,
        session: &Session,
        msg: RpcMessage,
    ) -> Result<Option<RpcResponse>> {
        let method = msg.method.clone();
        let resp = match method.as_str() {
            "fs/read_text_file" => Self::handle_fs_read(session, msg).await?,
            "fs/write_text_file" => Self::handle_fs_write(session, msg).await?,
            "terminal/create" => Self::handle_terminal_create(session, msg)?,
            "terminal/output" => Self::handle_terminal_output(session, msg)?,
            "terminal/wait_for_exit" => Self::handle_terminal_wait(session, msg).await?,
            "terminal/kill" => Self::handle_terminal_kill(session, msg)?,
            "terminal/release" => Self::handle_terminal_release(session, msg)?,
            "session/request_permission" => self.handle_permission_request(msg).await?,
            _ => RpcResponse::error(msg.id, ERR_METHOD_NOT_FOUND, "method not found"),
        };
        Ok(Some(resp))
    }

    async fn forward_downstream_notification(&self, msg: RpcMessage) {
        let upstream = self
            .upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match upstream {
            Some(upstream) => {
                if let Err(err) = upstream.send_message(&msg).await {
                    warn!(method = %msg.method, %err, "failed to forward notification upstream");
                }
            }
            None => debug!(method = %msg.method, "dropping notification: no upstream"),
        }
    }

    async fn handle_fs_read(session: &Session, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct FsReadParams {
            #[serde(default)]
            session_id: String,
            #[serde(default)]
            path: String,
            #[serde(default)]
            line: u64,
            #[serde(default)]
            limit: u64,
        }
        let Ok(params) = parse_params::<FsReadParams>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid fs/read_text_file params",
            ));
        };
        if params.path.is_empty() || !Path::new(&params.path).is_absolute() {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "path must be absolute",
            ));
        }
        if !session.matches_id(&params.session_id) {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "sessionId mismatch",
            ));
        }

        // ACP's (line, limit) window maps onto the 1-indexed inclusive
        // (start_line, end_line) of the fs primitive.
        let (start_line, end_line) = if params.limit > 0 {
            let start = params.line.max(1);
            (Some(start), Some(start + params.limit - 1))
        } else if params.line > 0 {
            (Some(params.line), None)
        } else {
            (None, None)
        };

        match session
            .fs
            .read(Path::new(&params.path), start_line, end_line)
            .await
        {
            Ok(outcome) => RpcResponse::from_value(id, json!({ "content": outcome.content })),
            Err(err) => Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        }
    }

    async fn handle_fs_write(session: &Session, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct FsWriteParams {
            #[serde(default)]
            session_id: String,
            #[serde(default)]
            path: String,
            #[serde(default)]
            content: String,
        }
        let Ok(params) = parse_params::<FsWriteParams>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid fs/write_text_file params",
            ));
        };
        if params.path.is_empty() || !Path::new(&params.path).is_absolute() {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "path must be absolute",
            ));
        }
        if !session.matches_id(&params.session_id) {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "sessionId mismatch",
            ));
        }

        match session
            .fs
            .write(Path::new(&params.path), &params.content)
            .await
        {
            Ok(_) => RpcResponse::null(id),
            Err(err) => Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        }
    }

    fn handle_terminal_create(session: &Session, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CreateParams {
            #[serde(default)]
            session_id: String,
            #[serde(default)]
            command: String,
            #[serde(default)]
            args: Vec<String>,
            #[serde(default)]
            cwd: String,
            #[serde(default)]
            output_byte_limit: usize,
        }
        let Ok(params) = parse_params::<CreateParams>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid terminal/create params",
            ));
        };
        if !session.matches_id(&params.session_id) {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "sessionId mismatch",
            ));
        }

        let cwd = (!params.cwd.is_empty()).then(|| Path::new(params.cwd.as_str()));
        match session.terminals.create(
            &params.command,
            &params.args,
            cwd,
            params.output_byte_limit,
        ) {
            Ok(terminal_id) => {
                RpcResponse::from_value(id, json!({ "terminalId": terminal_id }))
            }
            Err(err) => Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        }
    }

    fn handle_terminal_output(session: &Session, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();
        let Ok(params) = parse_params::<TerminalRef>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid terminal/output params",
            ));
        };
        if !session.matches_id(&params.session_id) {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "sessionId mismatch",
            ));
        }

        match session.terminals.output(&params.terminal_id) {
            Ok((output, truncated, exit)) => {
                let mut result = json!({ "output": output, "truncated": truncated });
                if let Some(exit) = exit {
                    result["exitStatus"] = serde_json::to_value(exit)
                        .map_err(|err| AppError::Rpc(format!("marshal exit status: {err}")))?;
                }
                RpcResponse::from_value(id, result)
            }
            Err(err) => Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        }
    }

    async fn handle_terminal_wait(session: &Session, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();
        let Ok(params) = parse_params::<TerminalRef>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid terminal/wait_for_exit params",
            ));
        };
        if !session.matches_id(&params.session_id) {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "sessionId mismatch",
            ));
        }

        match session.terminals.wait_for_exit(&params.terminal_id).await {
            Ok(status) => RpcResponse::from_value(
                id,
                json!({ "exitCode": status.exit_code, "signal": status.signal }),
            ),
            Err(err) => Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        }
    }

    fn handle_terminal_kill(session: &Session, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();
        let Ok(params) = parse_params::<TerminalRef>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid terminal/kill params",
            ));
        };
        if !session.matches_id(&params.session_id) {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "sessionId mismatch",
            ));
        }

        match session.terminals.kill(&params.terminal_id) {
            Ok(()) => RpcResponse::null(id),
            Err(err) => Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        }
    }

    fn handle_terminal_release(session: &Session, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();
        let Ok(params) = parse_params::<TerminalRef>(&msg.params) else {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "invalid terminal/release params",
            ));
        };
        if !session.matches_id(&params.session_id) {
            return Ok(RpcResponse::error(
                id,
                ERR_INVALID_PARAMS,
                "sessionId mismatch",
            ));
        }

        match session.terminals.release(&params.terminal_id) {
            Ok(()) => RpcResponse::null(id),
            Err(err) => Ok(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
        }
    }

    /// Forward a permission prompt to the upstream client.
    ///
    /// Every failure path (no upstream, transport failure, upstream RPC
    /// error) degrades to a `cancelled` outcome so the agent treats missing
    /// or broken UI as a denial rather than a protocol error.
    async fn handle_permission_request(&self, msg: RpcMessage) -> Result<RpcResponse> {
        let id = msg.id.clone();
        let upstream = self
            .upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(upstream) = upstream else {
            return cancelled_outcome(id);
        };

        match upstream
            .call_raw("session/request_permission", msg.params.clone())
            .await
        {
            Ok(resp) if resp.error.is_none() => match resp.result {
                Some(result) => Ok(RpcResponse::from_raw(id, result)),
                None => cancelled_outcome(id),
            },
            Ok(_) | Err(_) => cancelled_outcome(id),
        }
    }

    // ── Capabilities ─────────────────────────────────────────────────────────

    /// Merge the cached downstream capabilities over the conservative
    /// defaults, probing a one-shot downstream when no cache exists yet.
    async fn build_agent_capabilities(&self) -> Map<String, Value> {
        let cached = self
            .cached_caps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let cached = match cached {
            Some(cached) => Some(cached),
            None => self.refresh_capabilities().await,
        };

        let mut merged = default_agent_capabilities();
        if let Some(cached) = cached {
            for key in ["promptCapabilities", "mcpCapabilities", "sessionCapabilities"] {
                if let Some(value) = cached.get(key) {
                    merged.insert(key.to_owned(), value.clone());
                }
            }
        }
        merged.insert("loadSession".to_owned(), Value::Bool(false));
        merged
    }

    /// One-shot spawn + initialize purely to learn the agent's capabilities,
    /// bounded by [`CAPABILITY_PROBE_TIMEOUT`]. The probe child is reaped
    /// immediately.
    async fn refresh_capabilities(&self) -> Option<Map<String, Value>> {
        if self.config.agent.command.is_empty() {
            return None;
        }
        let spawned = match self.spawn_agent().await {
            Ok(spawned) => spawned,
            Err(err) => {
                debug!(%err, "capability probe spawn failed");
                return None;
            }
        };

        let conn = spawned.conn;
        let mut child = spawned.child;
        let run_conn = Arc::clone(&conn);
        let run = tokio::spawn(async move {
            let _ = run_conn.run().await;
        });

        let resp = tokio::time::timeout(
            CAPABILITY_PROBE_TIMEOUT,
            conn.call("initialize", &init_params(&self.config)),
        )
        .await;

        if let Some(child) = child.as_mut() {
            if let Err(err) = child.kill().await {
                debug!(%err, "failed to reap capability probe child");
            }
        }
        run.abort();

        let resp = resp.ok()?.ok()?;
        if resp.error.is_some() {
            return None;
        }
        let caps = parse_agent_capabilities(resp.result.as_deref()?)?;
        *self
            .cached_caps
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(caps.clone());
        Some(caps)
    }

    fn update_cached_capabilities(&self, raw: &RawValue) {
        if let Some(caps) = parse_agent_capabilities(raw) {
            *self
                .cached_caps
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(caps);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn spawn_agent(&self) -> SpawnFuture {
        let spawn = self.spawn_fn.lock().unwrap_or_else(PoisonError::into_inner);
        (*spawn)()
    }

    async fn cleanup_session(&self, session_id: &str) {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if let Some(session) = session {
            info!(session_id, "session removed");
            terminate_session(&session).await;
        }
    }

    async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            terminate_session(&session).await;
        }
    }
}

// ── Free helpers ─────────────────────────────────────────────────────────────

/// Kill and reap the session's child process and release its terminals.
async fn terminate_session(session: &Session) {
    session.terminals.release_all();
    let mut process = session.process.lock().await;
    if let Some(child) = process.as_mut() {
        if let Err(err) = child.kill().await {
            debug!(%err, "failed to kill downstream agent");
        }
    }
    *process = None;
}

/// Default spawn function: launch `agent.command agent.args...` with
/// `agent.env` appended and stderr routed to the broker's stderr.
fn spawn_downstream(config: &Config) -> Result<SpawnedAgent> {
    if config.agent.command.is_empty() {
        return Err(AppError::Config("agent.command is required".into()));
    }

    let mut cmd = Command::new(&config.agent.command);
    cmd.args(&config.agent.args);
    for pair in &config.agent.env {
        if let Some((key, value)) = pair.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Exec(format!("failed to spawn agent: {err}")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Exec("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Exec("failed to capture agent stdout".into()))?;

    Ok(SpawnedAgent {
        conn: Arc::new(Conn::new(stdout, stdin)),
        child: Some(child),
    })
}

fn init_params(config: &Config) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": { "readTextFile": true, "writeTextFile": true },
            "terminal": config.execution.enabled,
        },
        "clientInfo": broker_info(),
    })
}

fn broker_info() -> Value {
    json!({
        "name": BROKER_NAME,
        "title": BROKER_TITLE,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

fn default_agent_capabilities() -> Map<String, Value> {
    let Value::Object(map) = json!({
        "loadSession": false,
        "promptCapabilities": { "image": false, "audio": false, "embeddedContext": false },
        "mcpCapabilities": { "http": false, "sse": false },
        "sessionCapabilities": {},
    }) else {
        return Map::new();
    };
    map
}

/// Extract `agentCapabilities` from an initialize result, aliasing the
/// legacy `mcp` key to `mcpCapabilities`.
fn parse_agent_capabilities(raw: &RawValue) -> Option<Map<String, Value>> {
    let payload: Value = serde_json::from_str(raw.get()).ok()?;
    let mut caps = payload.get("agentCapabilities")?.as_object()?.clone();
    if !caps.contains_key("mcpCapabilities") {
        if let Some(legacy @ Value::Object(_)) = caps.get("mcp").cloned() {
            caps.insert("mcpCapabilities".to_owned(), legacy);
        }
    }
    Some(caps)
}

#[derive(Deserialize)]
struct SessionRef {
    #[serde(rename = "sessionId", default)]
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalRef {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    terminal_id: String,
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &Option<Box<RawValue>>) -> Result<T> {
    let raw = params.as_deref().map_or("null", RawValue::get);
    serde_json::from_str(raw).map_err(|err| AppError::Rpc(format!("invalid params: {err}")))
}

fn cancelled_outcome(id: Option<Box<RawValue>>) -> Result<RpcResponse> {
    RpcResponse::from_value(id, json!({ "outcome": { "outcome": "cancelled" } }))
}
