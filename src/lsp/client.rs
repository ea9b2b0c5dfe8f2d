// SPDX-License-Identifier: GPL-3.0-or-later

//! Child-process LSP client: spawning, framed JSON-RPC transport, request
//! correlation and the staged cross-platform shutdown.
//!
//! The client owns the server's three pipes and the reader tasks draining
//! stdout/stderr. Requests are correlated through a pending table of
//! oneshot slots keyed by a monotonic numeric id; completions therefore
//! resolve in server order, not client order. Server-initiated requests and
//! notifications are dispatched to registered handlers; an unknown server
//! request is answered with `MethodNotFound` so the server never blocks on
//! us, and an unhandled notification is dropped with a trace log.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BytesMut;
use lsp_types::{
    CodeActionParams, CodeActionResponse, CompletionParams, CompletionResponse,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DocumentDiagnosticParams, DocumentSymbolParams, DocumentSymbolResponse, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverParams, InitializeParams, InitializeResult, Location,
    ReferenceParams, WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::protocol::{
    self, IncomingMessage, NotificationMessage, RequestId, RequestMessage, ResponseError,
    ResponseMessage,
};
use crate::error::{Error, Result};

/// Budget for the polite LSP `shutdown`/`exit` exchange within the staged
/// shutdown.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Handler for a server-initiated notification.
pub type NotificationHandler = Box<dyn Fn(serde_json::Value) + Send + Sync>;

/// Handler for a server-initiated request. The returned value (or error)
/// is sent back as the response.
pub type RequestHandler =
    Box<dyn Fn(serde_json::Value) -> std::result::Result<serde_json::Value, ResponseError> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    notifications: StdMutex<HashMap<String, NotificationHandler>>,
    requests: StdMutex<HashMap<String, RequestHandler>>,
}

type PendingMap = Arc<StdMutex<HashMap<i64, tokio::sync::oneshot::Sender<Result<serde_json::Value>>>>>;
type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// Client side of one language server process.
pub struct LspClient {
    next_id: AtomicI64,
    requests_sent: AtomicU64,
    stdin: SharedStdin,
    pending: PendingMap,
    handlers: Arc<Handlers>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    reader_tasks: StdMutex<Vec<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
    trace_payloads: bool,
}

impl LspClient {
    /// Spawns the language server process with its working directory set to
    /// `cwd` and wires up the reader tasks.
    ///
    /// With `own_process_group` set (Unix), the child is placed in its own
    /// process group so signals aimed at our group do not reach it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] when the process cannot be spawned or
    /// its pipes cannot be captured.
    pub fn spawn(
        program: &str,
        args: &[String],
        cwd: &Path,
        own_process_group: bool,
        trace_payloads: bool,
    ) -> Result<Self> {
        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        if own_process_group {
            std::os::unix::process::CommandExt::process_group(&mut command, 0);
        }
        #[cfg(not(unix))]
        let _ = own_process_group;

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("child stderr not captured".to_string()))?;

        let pid = child.id();
        let stdin: SharedStdin = Arc::new(Mutex::new(Some(stdin)));
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let handlers = Arc::new(Handlers::default());
        let alive = Arc::new(AtomicBool::new(true));

        let stdout_task = tokio::spawn(Self::stdout_task(
            stdout,
            stdin.clone(),
            pending.clone(),
            handlers.clone(),
            alive.clone(),
            trace_payloads,
        ));
        let stderr_task = tokio::spawn(Self::stderr_task(stderr));

        debug!(program, pid, "Spawned language server");

        Ok(Self {
            next_id: AtomicI64::new(1),
            requests_sent: AtomicU64::new(0),
            stdin,
            pending,
            handlers,
            child: Mutex::new(Some(child)),
            pid,
            reader_tasks: StdMutex::new(vec![stdout_task, stderr_task]),
            alive,
            trace_payloads,
        })
    }

    /// Registers a handler for a server-initiated notification method.
    pub fn on_notification(&self, method: &str, handler: NotificationHandler) {
        if let Ok(mut handlers) = self.handlers.notifications.lock() {
            handlers.insert(method.to_string(), handler);
        }
    }

    /// Registers a handler for a server-initiated request method.
    pub fn on_request(&self, method: &str, handler: RequestHandler) {
        if let Ok(mut handlers) = self.handlers.requests.lock() {
            handlers.insert(method.to_string(), handler);
        }
    }

    /// True while the reader side of the connection is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Number of requests written to the server so far. Lets callers
    /// observe that a cached result produced no wire traffic.
    #[must_use]
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::SeqCst)
    }

    /// Background task draining stdout: parses frames, resolves pending
    /// requests, dispatches notifications and answers server requests.
    async fn stdout_task(
        stdout: ChildStdout,
        stdin: SharedStdin,
        pending: PendingMap,
        handlers: Arc<Handlers>,
        alive: Arc<AtomicBool>,
        trace_payloads: bool,
    ) {
        let mut reader = BufReader::new(stdout);
        let mut buffer = BytesMut::with_capacity(8192);
        let mut chunk = [0u8; 4096];

        'outer: loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    debug!("Language server stdout reached EOF");
                    break;
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    error!("Error reading language server stdout: {e}");
                    break;
                }
            }

            loop {
                let message = match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Malformed frame from language server: {e}");
                        break 'outer;
                    }
                };

                if trace_payloads {
                    debug!(payload = %message, "LSP <- server");
                } else {
                    trace!(payload = %message, "LSP <- server");
                }

                match protocol::classify(&message) {
                    Ok(IncomingMessage::Response(response)) => {
                        Self::resolve_pending(&pending, response);
                    }
                    Ok(IncomingMessage::Request(request)) => {
                        Self::answer_server_request(&stdin, &handlers, request).await;
                    }
                    Ok(IncomingMessage::Notification(notification)) => {
                        Self::dispatch_notification(&handlers, notification);
                    }
                    Err(e) => warn!("Dropping unclassifiable message: {e}"),
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        Self::fail_pending(&pending, "language server connection lost");
    }

    /// Background task draining stderr into the log.
    async fn stderr_task(stderr: ChildStderr) {
        use tokio::io::AsyncBufReadExt;
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "unilsp::lsp::stderr", "{line}");
        }
        debug!("Language server stderr reached EOF");
    }

    fn resolve_pending(pending: &PendingMap, response: ResponseMessage) {
        let Some(RequestId::Number(id)) = response.id else {
            warn!(id = ?response.id, "Response with non-numeric or missing id");
            return;
        };
        let sender = pending.lock().ok().and_then(|mut map| map.remove(&id));
        let Some(sender) = sender else {
            warn!(id, "Response for unknown request id");
            return;
        };
        let outcome = match response.error {
            Some(err) => Err(Error::Protocol {
                code: err.code,
                message: err.message,
            }),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    async fn answer_server_request(
        stdin: &SharedStdin,
        handlers: &Arc<Handlers>,
        request: RequestMessage,
    ) {
        debug!(method = %request.method, id = ?request.id, "Server request");
        let handled = handlers
            .requests
            .lock()
            .ok()
            .and_then(|map| map.get(&request.method).map(|h| h(request.params.clone())));

        let response = match handled {
            Some(Ok(result)) => ResponseMessage {
                jsonrpc: "2.0".to_string(),
                id: Some(request.id),
                result: Some(result),
                error: None,
            },
            Some(Err(err)) => ResponseMessage {
                jsonrpc: "2.0".to_string(),
                id: Some(request.id),
                result: None,
                error: Some(err),
            },
            None => ResponseMessage {
                jsonrpc: "2.0".to_string(),
                id: Some(request.id),
                result: None,
                error: Some(ResponseError {
                    code: protocol::METHOD_NOT_FOUND,
                    message: format!("method '{}' not supported by client", request.method),
                    data: None,
                }),
            },
        };

        if let Err(e) = Self::write_message(stdin, &response).await {
            warn!("Failed to answer server request: {e}");
        }
    }

    fn dispatch_notification(handlers: &Arc<Handlers>, notification: NotificationMessage) {
        let dispatched = handlers.notifications.lock().is_ok_and(|map| {
            map.get(&notification.method).is_some_and(|handler| {
                handler(notification.params.clone());
                true
            })
        });
        if !dispatched {
            trace!(method = %notification.method, "Dropping unhandled notification");
        }
    }

    async fn write_message<T: serde::Serialize>(stdin: &SharedStdin, message: &T) -> Result<()> {
        let framed = protocol::encode(message)?;
        let mut guard = stdin.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::Transport("stdin already closed".to_string()));
        };
        writer
            .write_all(&framed)
            .await
            .map_err(|e| Error::Transport(format!("failed to write to server stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("failed to flush server stdin: {e}")))
    }

    /// Sends a request and awaits its response.
    ///
    /// There is no transport-level timeout; wall-clock budgets belong to
    /// the sync facade. Cancelling the returned future leaves the request
    /// id allocated and sends no `$/cancelRequest`.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] for a structured server error,
    /// [`Error::Transport`] when the connection is gone.
    pub async fn request<P: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R> {
        if !self.is_running() {
            return Err(Error::Transport(
                "language server is not running".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = RequestMessage {
            jsonrpc: "2.0".to_string(),
            id: RequestId::Number(id),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        if self.trace_payloads {
            debug!(method, id, "LSP -> server (request)");
        } else {
            trace!(method, id, "LSP -> server (request)");
        }

        if let Err(e) = Self::write_message(&self.stdin, &message).await {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(e);
        }
        self.requests_sent.fetch_add(1, Ordering::SeqCst);

        let value = rx
            .await
            .map_err(|_| Error::Transport("language server closed the connection".to_string()))??;
        serde_json::from_value(value).map_err(Error::from)
    }

    /// Sends a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] when the connection is gone.
    pub async fn notify<P: serde::Serialize>(&self, method: &str, params: P) -> Result<()> {
        let message = NotificationMessage {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };
        if self.trace_payloads {
            debug!(method, "LSP -> server (notification)");
        } else {
            trace!(method, "LSP -> server (notification)");
        }
        Self::write_message(&self.stdin, &message).await
    }

    fn fail_pending(pending: &PendingMap, reason: &str) {
        let Ok(mut map) = pending.lock() else { return };
        for (_, sender) in map.drain() {
            let _ = sender.send(Err(Error::Transport(reason.to_string())));
        }
    }

    async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    async fn wait_for_exit_and_drain(&self, tasks: &mut [JoinHandle<()>]) {
        {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.wait().await;
            }
        }
        for task in tasks.iter_mut() {
            if !task.is_finished() {
                let _ = task.await;
            }
        }
    }

    async fn force_kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            warn!("Graceful termination failed, killing language server");
            if let Err(e) = child.kill().await {
                error!("Error during forceful kill: {e}");
            }
        }
    }

    #[cfg(unix)]
    async fn send_terminate(&self) {
        // Only signal a child we still hold; a reaped pid may have been
        // recycled by the OS.
        if self.child.lock().await.is_none() {
            return;
        }
        // unsafe is forbidden in this crate, so the terminate signal goes
        // through the external kill(1) rather than libc.
        let Some(pid) = self.pid else { return };
        let status = tokio::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
        if let Err(e) = status {
            warn!(pid, "Failed to send SIGTERM: {e}");
        }
    }

    /// Staged shutdown designed to terminate cleanly on every platform,
    /// including those that leak handles or deadlock when pipes are
    /// abandoned implicitly.
    ///
    /// 1. Polite LSP `shutdown`/`exit` under a two-second budget, then
    ///    close stdin.
    /// 2. Terminate signal; concurrently await process exit and reader
    ///    task completion under the remaining budget.
    /// 3. Forceful kill on timeout, reaped by the OS.
    /// 4. Abort lingering reader tasks, close every pipe handle, clear the
    ///    process reference, fail anything still pending.
    ///
    /// On Windows the proactor mishandles pipe teardown, so stages 1–2 are
    /// bypassed in favor of a one-second drain followed by the kill.
    pub async fn shutdown(&self, timeout: Duration) {
        let mut tasks = self
            .reader_tasks
            .lock()
            .map(|mut held| std::mem::take(&mut *held))
            .unwrap_or_default();

        #[cfg(not(windows))]
        {
            if self.is_running() {
                let graceful = async {
                    let _: Result<serde_json::Value> =
                        self.request("shutdown", serde_json::Value::Null).await;
                    let _ = self.notify("exit", serde_json::Value::Null).await;
                };
                if tokio::time::timeout(SHUTDOWN_REQUEST_TIMEOUT, graceful)
                    .await
                    .is_err()
                {
                    debug!("LSP shutdown request timed out");
                }
            }
            self.close_stdin().await;

            #[cfg(unix)]
            self.send_terminate().await;

            let remaining = timeout
                .saturating_sub(SHUTDOWN_REQUEST_TIMEOUT)
                .max(Duration::from_millis(100));
            if tokio::time::timeout(remaining, self.wait_for_exit_and_drain(&mut tasks))
                .await
                .is_err()
            {
                self.force_kill().await;
            }
        }

        #[cfg(windows)]
        {
            let _ = timeout;
            self.close_stdin().await;
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                self.wait_for_exit_and_drain(&mut tasks),
            )
            .await;
            self.force_kill().await;
        }

        // Stage 4: explicit task and handle cleanup.
        for task in &tasks {
            task.abort();
        }
        for mut task in tasks {
            if !task.is_finished() {
                let _ = (&mut task).await;
            }
        }
        self.close_stdin().await;
        self.child.lock().await.take();
        self.alive.store(false, Ordering::SeqCst);
        Self::fail_pending(&self.pending, "language server shut down");
        debug!("Shutdown sequence fully finished");
    }

    // Typed wrappers for the LSP methods the facade consumes.

    /// Performs the `initialize` request.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        self.request("initialize", params).await
    }

    /// Sends the `initialized` notification.
    pub async fn initialized(&self) -> Result<()> {
        self.notify("initialized", serde_json::json!({})).await
    }

    /// Notifies the server that a document was opened.
    pub async fn did_open(&self, params: DidOpenTextDocumentParams) -> Result<()> {
        self.notify("textDocument/didOpen", params).await
    }

    /// Notifies the server that a document changed.
    pub async fn did_change(&self, params: DidChangeTextDocumentParams) -> Result<()> {
        self.notify("textDocument/didChange", params).await
    }

    /// Notifies the server that a document was closed.
    pub async fn did_close(&self, params: DidCloseTextDocumentParams) -> Result<()> {
        self.notify("textDocument/didClose", params).await
    }

    /// Requests the definition of the symbol at a position.
    pub async fn definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        self.request("textDocument/definition", params).await
    }

    /// Requests all references to the symbol at a position.
    pub async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        self.request("textDocument/references", params).await
    }

    /// Requests the symbol outline of a document.
    pub async fn document_symbols(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        self.request("textDocument/documentSymbol", params).await
    }

    /// Requests hover information at a position.
    pub async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        self.request("textDocument/hover", params).await
    }

    /// Requests completions at a position.
    pub async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        self.request("textDocument/completion", params).await
    }

    /// Searches symbols across the workspace.
    pub async fn workspace_symbols(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Result<Option<WorkspaceSymbolResponse>> {
        self.request("workspace/symbol", params).await
    }

    /// Pulls diagnostics for a document. The report shape varies between
    /// servers, so the raw value is returned.
    pub async fn document_diagnostic(
        &self,
        params: DocumentDiagnosticParams,
    ) -> Result<Option<serde_json::Value>> {
        self.request("textDocument/diagnostic", params).await
    }

    /// Requests code actions for a range.
    pub async fn code_actions(&self, params: CodeActionParams) -> Result<Option<CodeActionResponse>> {
        self.request("textDocument/codeAction", params).await
    }
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("pid", &self.pid)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .field("requests_sent", &self.requests_sent.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
