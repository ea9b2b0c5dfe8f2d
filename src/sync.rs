// SPDX-License-Identifier: GPL-3.0-or-later

//! Blocking facade over [`LanguageServer`].
//!
//! The sync facade owns a dedicated single-worker tokio runtime, the
//! background event loop/thread pair. Every call is submitted to that
//! runtime as a task and the caller blocks on its completion, optionally
//! under a per-call wall-clock timeout. A timed-out call abandons the task
//! (it keeps running to completion on the loop) but never cancels the LSP
//! request on the wire. Submissions are serialized: one blocking call at a
//! time enters the loop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lsp_types::{CodeActionResponse, Diagnostic, Hover, Position, Range};
use tracing::{debug, warn};

use crate::config::LspConfig;
use crate::error::{Error, Result};
use crate::language::Language;
use crate::paths::FileLocation;
use crate::server::{CompletionEntry, LanguageServer, LineContext, SymbolOverviewEntry};
use crate::symbols::{ReferenceInSymbol, SymbolNode, SymbolTree};

/// Default budget for the staged shutdown when [`SyncLanguageServer::stop`]
/// is used.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking, thread-safe interface to one language server.
///
/// The runtime itself is only touched by `start` and `stop`; ordinary
/// calls submit through a cloned handle, so a long-running call never
/// blocks shutdown. The single worker thread is the serialization point
/// for everything submitted.
pub struct SyncLanguageServer {
    inner: Arc<LanguageServer>,
    runtime: StdMutex<Option<tokio::runtime::Runtime>>,
    handle: StdMutex<Option<tokio::runtime::Handle>>,
    timeout: Option<Duration>,
    stopped: StdMutex<bool>,
}

/// Scoped handle for an open document. Dropping it releases the reference
/// and closes the document against the server once no scope holds it.
pub struct OpenFileGuard<'a> {
    server: &'a SyncLanguageServer,
    relative_path: String,
}

impl Drop for OpenFileGuard<'_> {
    fn drop(&mut self) {
        self.server.release_file(&self.relative_path);
    }
}

impl SyncLanguageServer {
    /// Creates the facade without starting the server. The per-call
    /// timeout is taken from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository root does not exist.
    pub fn create(config: LspConfig, repository_root: &Path) -> Result<Self> {
        let timeout = config.request_timeout;
        let inner = LanguageServer::new(config, repository_root)?;
        Ok(Self {
            inner,
            runtime: StdMutex::new(None),
            handle: StdMutex::new(None),
            timeout,
            stopped: StdMutex::new(false),
        })
    }

    /// The repository root all relative paths resolve against.
    #[must_use]
    pub fn repository_root(&self) -> &Path {
        self.inner.repository_root()
    }

    /// The configured language.
    #[must_use]
    pub fn language(&self) -> Language {
        self.inner.language()
    }

    /// Starts the background loop, spawns the language server and performs
    /// the initialize handshake. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates spawn and handshake failures; the loop is torn down on
    /// error.
    pub fn start(&self) -> Result<()> {
        let mut guard = self
            .runtime
            .lock()
            .map_err(|_| Error::Transport("runtime lock poisoned".to_string()))?;
        if guard.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("unilsp-loop")
            .enable_all()
            .build()?;

        let inner = self.inner.clone();
        let task = runtime.spawn(async move { inner.start().await });
        let started = match self.timeout {
            Some(limit) => runtime.block_on(async {
                match tokio::time::timeout(limit, task).await {
                    Ok(join) => join
                        .unwrap_or_else(|e| Err(Error::Transport(format!("startup task failed: {e}")))),
                    Err(_) => Err(Error::Timeout(limit)),
                }
            }),
            None => runtime.block_on(async {
                task.await
                    .unwrap_or_else(|e| Err(Error::Transport(format!("startup task failed: {e}"))))
            }),
        };
        started?;
        if let Ok(mut handle) = self.handle.lock() {
            *handle = Some(runtime.handle().clone());
        }
        *guard = Some(runtime);
        Ok(())
    }

    /// Whether the background loop is up and the server started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        let loop_up = self
            .runtime
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        loop_up && self.inner.is_running()
    }

    /// Stops the server and the background loop with the default shutdown
    /// budget. Idempotent: repeated calls return immediately.
    pub fn stop(&self) {
        self.stop_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT);
    }

    /// Stops the server and the background loop.
    ///
    /// Saves the symbol cache, runs the staged child shutdown on the loop,
    /// then tears the runtime down with a bounded wait so that a wedged
    /// worker cannot hang process exit.
    pub fn stop_with_timeout(&self, shutdown_timeout: Duration) {
        {
            let Ok(mut stopped) = self.stopped.lock() else {
                return;
            };
            if *stopped {
                debug!("Already stopped, skipping shutdown");
                return;
            }
            *stopped = true;
        }

        // New submissions fail fast from here on.
        if let Ok(mut handle) = self.handle.lock() {
            handle.take();
        }
        let runtime = self.runtime.lock().ok().and_then(|mut guard| guard.take());
        let Some(runtime) = runtime else {
            // Never started (or already torn down): persist state and leave.
            self.inner.save_cache();
            return;
        };

        let inner = self.inner.clone();
        let shutdown = runtime.spawn(async move { inner.stop(shutdown_timeout).await });
        let budget = shutdown_timeout + Duration::from_secs(2);
        let outcome = runtime.block_on(async { tokio::time::timeout(budget, shutdown).await });
        if outcome.is_err() {
            warn!("Staged shutdown did not finish within its budget");
        }
        runtime.shutdown_timeout(Duration::from_secs(1));
        debug!("Shutdown complete, background loop stopped");
    }

    fn submit<T, F>(&self, future: F) -> Result<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let handle = {
            let guard = self
                .handle
                .lock()
                .map_err(|_| Error::Transport("runtime lock poisoned".to_string()))?;
            guard.clone().ok_or(Error::NotStarted)?
        };
        let task = handle.spawn(future);
        match self.timeout {
            Some(limit) => handle.block_on(async move {
                match tokio::time::timeout(limit, task).await {
                    Ok(join) => join
                        .unwrap_or_else(|e| Err(Error::Transport(format!("task failed: {e}")))),
                    Err(_) => Err(Error::Timeout(limit)),
                }
            }),
            None => handle.block_on(async move {
                task.await
                    .unwrap_or_else(|e| Err(Error::Transport(format!("task failed: {e}"))))
            }),
        }
    }

    /// Opens a document for the lifetime of the returned guard.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before `start` and
    /// [`Error::FileNotFound`] for absent files.
    pub fn open_file(&self, relative_path: &str) -> Result<OpenFileGuard<'_>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.open_file(&rel).await })?;
        Ok(OpenFileGuard {
            server: self,
            relative_path: relative_path.to_string(),
        })
    }

    fn release_file(&self, relative_path: &str) {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        if let Err(e) = self.submit(async move {
            inner.close_file(&rel).await;
            Ok(())
        }) {
            debug!(path = relative_path, "Releasing file after shutdown: {e}");
        }
    }

    /// Inserts text at a position in an open document; returns the
    /// post-edit cursor position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the document is not open.
    pub fn insert_text_at_position(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
        text: &str,
    ) -> Result<Position> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        let text = text.to_string();
        self.submit(async move { inner.insert_text_at_position(&rel, line, column, &text).await })
    }

    /// Deletes the text between two positions in an open document; returns
    /// the deleted text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the document is not open.
    pub fn delete_text_between_positions(
        &self,
        relative_path: &str,
        start: Position,
        end: Position,
    ) -> Result<String> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.delete_text_between_positions(&rel, start, end).await })
    }

    /// Blocking mirror of [`LanguageServer::request_definition`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_definition(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
    ) -> Result<Vec<FileLocation>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.request_definition(&rel, line, column).await })
    }

    /// Blocking mirror of [`LanguageServer::request_references`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_references(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
    ) -> Result<Vec<FileLocation>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.request_references(&rel, line, column).await })
    }

    /// Blocking mirror of [`LanguageServer::request_document_symbols`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_document_symbols(
        &self,
        relative_path: &str,
        include_body: bool,
    ) -> Result<SymbolTree> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.request_document_symbols(&rel, include_body).await })
    }

    /// Blocking mirror of [`LanguageServer::request_full_symbol_tree`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_full_symbol_tree(
        &self,
        within_relative_path: Option<&str>,
        include_body: bool,
    ) -> Result<SymbolTree> {
        let inner = self.inner.clone();
        let within = within_relative_path.map(str::to_string);
        self.submit(async move {
            inner
                .request_full_symbol_tree(within.as_deref(), include_body)
                .await
        })
    }

    /// Blocking mirror of [`LanguageServer::request_containing_symbol`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_containing_symbol(
        &self,
        relative_path: &str,
        line: u32,
        column: Option<u32>,
        strict: bool,
        include_body: bool,
    ) -> Result<Option<SymbolNode>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move {
            inner
                .request_containing_symbol(&rel, line, column, strict, include_body)
                .await
        })
    }

    /// Blocking mirror of [`LanguageServer::request_defining_symbol`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_defining_symbol(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
        include_body: bool,
    ) -> Result<Option<SymbolNode>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move {
            inner
                .request_defining_symbol(&rel, line, column, include_body)
                .await
        })
    }

    /// Blocking mirror of [`LanguageServer::request_referencing_symbols`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    #[allow(
        clippy::fn_params_excessive_bools,
        reason = "Mirrors the flag set of the underlying protocol operation"
    )]
    pub fn request_referencing_symbols(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
        include_imports: bool,
        include_self: bool,
        include_body: bool,
        include_file_symbols: bool,
    ) -> Result<Vec<ReferenceInSymbol>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move {
            inner
                .request_referencing_symbols(
                    &rel,
                    line,
                    column,
                    include_imports,
                    include_self,
                    include_body,
                    include_file_symbols,
                )
                .await
        })
    }

    /// Blocking mirror of [`LanguageServer::request_hover`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_hover(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
    ) -> Result<Option<Hover>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.request_hover(&rel, line, column).await })
    }

    /// Blocking mirror of [`LanguageServer::request_completions`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_completions(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
        allow_incomplete: bool,
    ) -> Result<Vec<CompletionEntry>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move {
            inner
                .request_completions(&rel, line, column, allow_incomplete)
                .await
        })
    }

    /// Blocking mirror of [`LanguageServer::request_workspace_symbol`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_workspace_symbol(&self, query: &str) -> Result<Option<Vec<SymbolNode>>> {
        let inner = self.inner.clone();
        let query = query.to_string();
        self.submit(async move { inner.request_workspace_symbol(&query).await })
    }

    /// Blocking mirror of [`LanguageServer::request_document_diagnostic`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_document_diagnostic(
        &self,
        relative_path: &str,
    ) -> Result<Option<serde_json::Value>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.request_document_diagnostic(&rel).await })
    }

    /// Blocking mirror of [`LanguageServer::request_code_action`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_code_action(
        &self,
        relative_path: &str,
        range: Range,
    ) -> Result<Option<CodeActionResponse>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.request_code_action(&rel, range).await })
    }

    /// Blocking mirror of [`LanguageServer::request_document_overview`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_document_overview(
        &self,
        relative_path: &str,
    ) -> Result<Vec<SymbolOverviewEntry>> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.request_document_overview(&rel).await })
    }

    /// Blocking mirror of [`LanguageServer::request_dir_overview`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_dir_overview(
        &self,
        relative_dir_path: &str,
    ) -> Result<HashMap<String, Vec<SymbolOverviewEntry>>> {
        let inner = self.inner.clone();
        let rel = relative_dir_path.to_string();
        self.submit(async move { inner.request_dir_overview(&rel).await })
    }

    /// Blocking mirror of [`LanguageServer::request_overview`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_overview(
        &self,
        within_relative_path: &str,
    ) -> Result<HashMap<String, Vec<SymbolOverviewEntry>>> {
        let inner = self.inner.clone();
        let rel = within_relative_path.to_string();
        self.submit(async move { inner.request_overview(&rel).await })
    }

    /// Blocking mirror of [`LanguageServer::request_parsed_files`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn request_parsed_files(&self) -> Result<Vec<String>> {
        let inner = self.inner.clone();
        self.submit(async move { inner.request_parsed_files().await })
    }

    /// Blocking mirror of [`LanguageServer::retrieve_full_file_content`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn retrieve_full_file_content(&self, relative_path: &str) -> Result<String> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move { inner.retrieve_full_file_content(&rel).await })
    }

    /// Blocking mirror of [`LanguageServer::retrieve_content_around_line`].
    ///
    /// # Errors
    ///
    /// Propagates facade errors plus [`Error::Timeout`].
    pub fn retrieve_content_around_line(
        &self,
        relative_path: &str,
        line: u32,
        context_lines_before: u32,
        context_lines_after: u32,
    ) -> Result<LineContext> {
        let inner = self.inner.clone();
        let rel = relative_path.to_string();
        self.submit(async move {
            inner
                .retrieve_content_around_line(&rel, line, context_lines_before, context_lines_after)
                .await
        })
    }

    /// Stored push diagnostics for a file.
    #[must_use]
    pub fn diagnostics_for_file(&self, relative_path: &str) -> Vec<Diagnostic> {
        self.inner.diagnostics_for_file(relative_path)
    }

    /// Stored diagnostics filtered by severity integers.
    #[must_use]
    pub fn diagnostics_by_severity(
        &self,
        relative_path: &str,
        severity_levels: Option<&[i32]>,
    ) -> Vec<Diagnostic> {
        self.inner.diagnostics_by_severity(relative_path, severity_levels)
    }

    /// Whether a repository-relative path is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the path does not exist.
    pub fn is_ignored_path(&self, relative_path: &str, ignore_unsupported: bool) -> Result<bool> {
        self.inner.is_ignored_path(relative_path, ignore_unsupported)
    }

    /// Persists the symbol cache if it changed.
    pub fn save_cache(&self) {
        self.inner.save_cache();
    }

    /// Total number of requests written to the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before `start`.
    pub fn lsp_requests_sent(&self) -> Result<u64> {
        self.inner.lsp_requests_sent()
    }
}

impl Drop for SyncLanguageServer {
    fn drop(&mut self) {
        self.stop();
    }
}
