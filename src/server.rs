// SPDX-License-Identifier: GPL-3.0-or-later

//! The asynchronous language server facade.
//!
//! [`LanguageServer`] owns one child language server process and exposes
//! repository-relative, ignore-aware operations on top of it: definitions,
//! references, document and workspace symbols, the full symbol tree,
//! containment queries, hover, completions, diagnostics and text edits.
//! Files are opened against the server for the duration of each request
//! through the reference-counted document store, and per-file symbol
//! results are cached by content hash.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use lsp_types::{
    ClientCapabilities, CodeActionContext, CodeActionParams, CodeActionResponse, CompletionContext,
    CompletionItem, CompletionItemKind, CompletionParams, CompletionResponse,
    CompletionTriggerKind, Diagnostic, DiagnosticSeverity, DocumentDiagnosticParams,
    DocumentSymbol, DocumentSymbolParams, DocumentSymbolResponse, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverParams, Location, PartialResultParams, Position,
    PositionEncodingKind, PublishDiagnosticsParams, Range, ReferenceContext, ReferenceParams,
    SymbolInformation, SymbolKind, TextDocumentIdentifier, TextDocumentPositionParams, Uri,
    WorkDoneProgressParams, WorkspaceFolder, WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::SymbolCache;
use crate::config::LspConfig;
use crate::documents::{DocumentStore, OpenOutcome};
use crate::error::{Error, Result};
use crate::ignore_rules::IgnoreSpec;
use crate::language::Language;
use crate::lsp::LspClient;
use crate::lsp::protocol::INTERNAL_ERROR;
use crate::paths::{self, FileLocation, UriPathMapper};
use crate::symbols::{
    self, ReferenceInSymbol, SymbolId, SymbolNode, SymbolTree, select_containing,
};

/// Maximum number of `isIncomplete` completion polls.
const COMPLETION_RETRIES: usize = 30;

/// A normalized completion suggestion.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompletionEntry {
    /// Text of the completion (label, falling back to insert text).
    #[serde(rename = "completionText")]
    pub completion_text: String,
    /// LSP completion item kind.
    pub kind: Option<CompletionItemKind>,
    /// Extra detail provided by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `(name, kind, line, column)` of a top-level symbol, as produced by the
/// overview operations.
pub type SymbolOverviewEntry = (String, SymbolKind, u32, u32);

/// Consecutive lines of a file around a requested line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineContext {
    /// First line included (zero-based).
    pub start_line: u32,
    /// Last line included (zero-based, inclusive).
    pub end_line: u32,
    /// The lines joined with `\n`.
    pub text: String,
}

#[derive(Debug, Clone)]
struct FileSnapshot {
    uri: String,
    contents: String,
    content_hash: String,
}

/// Asynchronous facade over one language server process.
///
/// The instance moves through two phases: *not started* (every operation
/// fails fast with [`Error::NotStarted`]) and *started* (after
/// [`LanguageServer::start`]). The transition is one-way; a stopped
/// instance is not restarted.
pub struct LanguageServer {
    config: LspConfig,
    root: PathBuf,
    mapper: UriPathMapper,
    ignore: IgnoreSpec,
    documents: StdMutex<DocumentStore>,
    cache: SymbolCache,
    diagnostics: Arc<StdMutex<HashMap<String, Vec<Diagnostic>>>>,
    client: OnceLock<LspClient>,
    started: AtomicBool,
    completions_ready: watch::Sender<bool>,
}

impl LanguageServer {
    /// Creates a facade for `repository_root` without starting the server.
    /// Loads the persisted symbol cache and compiles the ignore rules.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository root does not exist.
    pub fn new(config: LspConfig, repository_root: &Path) -> Result<Arc<Self>> {
        let root = repository_root
            .canonicalize()
            .map_err(|_| Error::FileNotFound(repository_root.to_path_buf()))?;
        let ignore = IgnoreSpec::new(
            &root,
            config.code_language,
            &config.ignored_paths,
            config.gitignore_file_content.as_deref(),
        );
        let cache = SymbolCache::load(&root);
        let mapper = UriPathMapper::new(root.clone());
        let (completions_ready, _) = watch::channel(false);
        info!(
            root = %root.display(),
            language = %config.code_language,
            "Created language server facade"
        );
        Ok(Arc::new(Self {
            config,
            root,
            mapper,
            ignore,
            documents: StdMutex::new(DocumentStore::new()),
            cache,
            diagnostics: Arc::new(StdMutex::new(HashMap::new())),
            client: OnceLock::new(),
            started: AtomicBool::new(false),
            completions_ready,
        }))
    }

    /// The repository root all relative paths resolve against.
    #[must_use]
    pub fn repository_root(&self) -> &Path {
        &self.root
    }

    /// The configured language.
    #[must_use]
    pub const fn language(&self) -> Language {
        self.config.code_language
    }

    /// The per-call timeout the sync facade should apply.
    #[must_use]
    pub const fn request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }

    /// Whether the server has been started and not yet stopped.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawns the language server child, wires up notification handling and
    /// performs the `initialize`/`initialized` handshake.
    ///
    /// # Errors
    ///
    /// Fails when the process cannot be spawned, the handshake fails, or
    /// the server does not advertise the document-sync, completion and
    /// definition capabilities the facade relies on.
    pub async fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }

        let (program, args) = self.config.server_command();
        info!(program, ?args, "Starting language server");
        let client = LspClient::spawn(
            &program,
            &args,
            &self.root,
            self.config.start_independent_lsp_process,
            self.config.trace_lsp_communication,
        )?;

        self.register_default_handlers(&client);

        let init = client.initialize(self.initialize_params()).await?;
        if init.capabilities.text_document_sync.is_none() {
            return Err(Error::MissingCapability("textDocumentSync"));
        }
        if init.capabilities.completion_provider.is_none() {
            return Err(Error::MissingCapability("completionProvider"));
        }
        if init.capabilities.definition_provider.is_none() {
            return Err(Error::MissingCapability("definitionProvider"));
        }
        client.initialized().await?;

        self.client
            .set(client)
            .map_err(|_| Error::Transport("language server already started".to_string()))?;
        let _ = self.completions_ready.send(true);
        self.started.store(true, Ordering::SeqCst);
        info!("Language server initialized");
        Ok(())
    }

    /// Saves the symbol cache and shuts the child down through the staged
    /// sequence. Safe to call more than once.
    pub async fn stop(&self, timeout: Duration) {
        self.save_cache();
        self.started.store(false, Ordering::SeqCst);
        if let Some(client) = self.client.get() {
            client.shutdown(timeout).await;
        }
    }

    /// Persists the symbol cache if it changed.
    pub fn save_cache(&self) {
        self.cache.save();
    }

    /// Whether the child process connection is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.client.get().is_some_and(LspClient::is_running)
    }

    /// Total number of requests written to the server. Observability hook
    /// for cache behavior.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before `start`.
    pub fn lsp_requests_sent(&self) -> Result<u64> {
        Ok(self.client()?.requests_sent())
    }

    /// Whether a repository-relative path is ignored (see the crate-level
    /// ignore rules).
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the path does not exist.
    pub fn is_ignored_path(&self, relative_path: &str, ignore_unsupported: bool) -> Result<bool> {
        self.ignore.is_ignored(relative_path, ignore_unsupported)
    }

    fn client(&self) -> Result<&LspClient> {
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        self.client.get().ok_or(Error::NotStarted)
    }

    fn register_default_handlers(&self, client: &LspClient) {
        let diagnostics = self.diagnostics.clone();
        let root = self.root.clone();
        client.on_notification(
            "textDocument/publishDiagnostics",
            Box::new(move |params| {
                let parsed: PublishDiagnosticsParams = match serde_json::from_value(params) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("Failed to parse publishDiagnostics params: {e}");
                        return;
                    }
                };
                let absolute = paths::uri_to_path(parsed.uri.as_str());
                let Ok(relative) = absolute.strip_prefix(&root) else {
                    debug!(uri = parsed.uri.as_str(), "Diagnostics for path outside repository");
                    return;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                debug!(
                    path = %relative,
                    count = parsed.diagnostics.len(),
                    "Stored diagnostics"
                );
                if let Ok(mut store) = diagnostics.lock() {
                    store.insert(relative, parsed.diagnostics);
                }
            }),
        );

        client.on_notification(
            "window/logMessage",
            Box::new(|params| {
                if let Some(message) = params.get("message").and_then(|m| m.as_str()) {
                    debug!(target: "unilsp::lsp::server_log", "{message}");
                }
            }),
        );

        client.on_notification("$/progress", Box::new(|_| {}));

        client.on_request(
            "client/registerCapability",
            Box::new(|_| Ok(serde_json::Value::Null)),
        );
    }

    fn initialize_params(&self) -> lsp_types::InitializeParams {
        let root_uri: Option<Uri> = paths::path_to_uri(&self.root).parse().ok();
        let name = self
            .root
            .file_name()
            .map_or_else(|| "workspace".to_string(), |n| n.to_string_lossy().to_string());
        lsp_types::InitializeParams {
            process_id: Some(std::process::id()),
            capabilities: ClientCapabilities {
                general: Some(lsp_types::GeneralClientCapabilities {
                    position_encodings: Some(vec![
                        PositionEncodingKind::UTF8,
                        PositionEncodingKind::UTF16,
                    ]),
                    ..Default::default()
                }),
                text_document: Some(lsp_types::TextDocumentClientCapabilities {
                    document_symbol: Some(lsp_types::DocumentSymbolClientCapabilities {
                        hierarchical_document_symbol_support: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            workspace_folders: root_uri.map(|uri| vec![WorkspaceFolder { uri, name }]),
            initialization_options: self.config.initialization_options(),
            ..Default::default()
        }
    }

    fn absolute(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }

    fn uri_for(&self, relative_path: &str) -> String {
        paths::path_to_uri(&self.absolute(relative_path))
    }

    fn document_identifier(&self, relative_path: &str) -> Result<TextDocumentIdentifier> {
        let uri: Uri = self
            .uri_for(relative_path)
            .parse()
            .map_err(|e| Error::Transport(format!("invalid uri for {relative_path}: {e}")))?;
        Ok(TextDocumentIdentifier { uri })
    }

    fn position_params(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
    ) -> Result<TextDocumentPositionParams> {
        Ok(TextDocumentPositionParams {
            text_document: self.document_identifier(relative_path)?,
            position: Position::new(line, column),
        })
    }

    /// Opens a document against the server, incrementing its refcount.
    /// Every `open_file` must be paired with a [`LanguageServer::close_file`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before `start` and
    /// [`Error::FileNotFound`] for absent files.
    pub async fn open_file(&self, relative_path: &str) -> Result<()> {
        self.open_snapshot(relative_path).await.map(|_| ())
    }

    async fn open_snapshot(&self, relative_path: &str) -> Result<FileSnapshot> {
        let client = self.client()?;
        let uri = self.uri_for(relative_path);
        let absolute = self.absolute(relative_path);
        let language_id = self.config.code_language.language_id();

        let (outcome, snapshot) = {
            let mut documents = self
                .documents
                .lock()
                .map_err(|_| Error::Transport("document store poisoned".to_string()))?;
            let outcome = documents.open(&uri, &absolute, language_id)?;
            let snapshot = documents.get(&uri).map(|buffer| FileSnapshot {
                uri: uri.clone(),
                contents: buffer.contents.clone(),
                content_hash: buffer.content_hash.clone(),
            });
            (outcome, snapshot)
        };

        if let OpenOutcome::Opened(params) = outcome {
            client.did_open(params).await?;
        }
        snapshot.ok_or_else(|| Error::FileNotFound(absolute))
    }

    /// Releases one reference to a document, closing it against the server
    /// when the count reaches zero.
    pub async fn close_file(&self, relative_path: &str) {
        let uri = self.uri_for(relative_path);
        let params = self
            .documents
            .lock()
            .ok()
            .and_then(|mut documents| documents.release(&uri));
        if let Some(params) = params
            && let Ok(client) = self.client()
            && let Err(e) = client.did_close(params).await
        {
            warn!(path = relative_path, "Failed to send didClose: {e}");
        }
    }

    /// Inserts text at a position in an **open** document and returns the
    /// cursor position just past the inserted text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the document is not open.
    pub async fn insert_text_at_position(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
        text: &str,
    ) -> Result<Position> {
        let client = self.client()?;
        let uri = self.uri_for(relative_path);
        let (position, params) = {
            let mut documents = self
                .documents
                .lock()
                .map_err(|_| Error::Transport("document store poisoned".to_string()))?;
            documents.insert_at(&uri, line, column, text)?
        };
        client.did_change(params).await?;
        Ok(position)
    }

    /// Deletes the text between two positions in an **open** document and
    /// returns the deleted text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the document is not open.
    pub async fn delete_text_between_positions(
        &self,
        relative_path: &str,
        start: Position,
        end: Position,
    ) -> Result<String> {
        let client = self.client()?;
        let uri = self.uri_for(relative_path);
        let (deleted, params) = {
            let mut documents = self
                .documents
                .lock()
                .map_err(|_| Error::Transport("document store poisoned".to_string()))?;
            documents.delete_between(&uri, start, end)?
        };
        client.did_change(params).await?;
        Ok(deleted)
    }

    /// Full contents of a file, served from the buffer mirror.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for absent files.
    pub async fn retrieve_full_file_content(&self, relative_path: &str) -> Result<String> {
        let snapshot = self.open_snapshot(relative_path).await?;
        self.close_file(relative_path).await;
        Ok(snapshot.contents)
    }

    /// The line at `line` plus the requested context lines around it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for absent files.
    pub async fn retrieve_content_around_line(
        &self,
        relative_path: &str,
        line: u32,
        context_lines_before: u32,
        context_lines_after: u32,
    ) -> Result<LineContext> {
        let contents = self.retrieve_full_file_content(relative_path).await?;
        let lines: Vec<&str> = contents.split('\n').collect();
        let last = u32::try_from(lines.len().saturating_sub(1)).unwrap_or(u32::MAX);
        let start_line = line.saturating_sub(context_lines_before);
        let end_line = line.saturating_add(context_lines_after).min(last);
        let text = lines
            .get(start_line as usize..=(end_line as usize).min(lines.len() - 1))
            .unwrap_or_default()
            .join("\n");
        Ok(LineContext {
            start_line,
            end_line,
            text,
        })
    }

    /// Requests the definition of the symbol at the given position.
    ///
    /// Accepts every response shape the protocol allows (single location,
    /// location array, location links, null) and returns enriched
    /// locations within the repository.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_definition(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
    ) -> Result<Vec<FileLocation>> {
        let client = self.client()?;
        self.open_snapshot(relative_path).await?;
        let params = GotoDefinitionParams {
            text_document_position_params: self.position_params(relative_path, line, column)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let response = client.definition(params).await;
        self.close_file(relative_path).await;

        let locations = match response? {
            None => {
                warn!(
                    path = relative_path,
                    line, column, "Server returned null for definition request"
                );
                Vec::new()
            }
            Some(GotoDefinitionResponse::Scalar(location)) => vec![self.enrich(&location)],
            Some(GotoDefinitionResponse::Array(locations)) => {
                locations.iter().map(|l| self.enrich(l)).collect()
            }
            Some(GotoDefinitionResponse::Link(links)) => links
                .iter()
                .map(|link| {
                    self.mapper
                        .location(link.target_uri.as_str(), link.target_selection_range)
                })
                .collect(),
        };
        Ok(locations
            .into_iter()
            .filter(|l| l.relative_path.is_some())
            .collect())
    }

    /// Requests all references to the symbol at the given position,
    /// excluding the declaration, locations outside the repository and
    /// locations on ignored paths.
    ///
    /// # Errors
    ///
    /// An LSP internal error (`-32603`) is wrapped as
    /// [`Error::ReferencesInternal`] with the originating location.
    pub async fn request_references(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
    ) -> Result<Vec<FileLocation>> {
        let client = self.client()?;
        self.open_snapshot(relative_path).await?;
        let params = ReferenceParams {
            text_document_position: self.position_params(relative_path, line, column)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration: false,
            },
        };
        let response = client.references(params).await;
        self.close_file(relative_path).await;

        let response = match response {
            Err(Error::Protocol { code, message }) if code == INTERNAL_ERROR => {
                return Err(Error::ReferencesInternal {
                    path: relative_path.to_string(),
                    line,
                    column,
                    message,
                });
            }
            other => other?,
        };

        let mut references = Vec::new();
        for location in response.unwrap_or_default() {
            let enriched = self.enrich(&location);
            let Some(relative) = enriched.relative_path.clone() else {
                continue;
            };
            if matches!(self.ignore.is_ignored(&relative, true), Ok(true)) {
                debug!(path = %relative, "Dropping reference on ignored path");
                continue;
            }
            references.push(enriched);
        }
        Ok(references)
    }

    fn enrich(&self, location: &Location) -> FileLocation {
        self.mapper
            .location(location.uri.as_str(), location.range)
    }

    /// Requests the symbol outline of a file, serving it from the cache
    /// when the content hash still matches.
    ///
    /// The returned tree's pre-order traversal is the flat symbol list;
    /// its roots are the file's top-level symbols.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_document_symbols(
        &self,
        relative_path: &str,
        include_body: bool,
    ) -> Result<SymbolTree> {
        let client = self.client()?;
        let snapshot = self.open_snapshot(relative_path).await?;

        if let Some(tree) = self
            .cache
            .lookup(relative_path, include_body, &snapshot.content_hash)
        {
            self.close_file(relative_path).await;
            return Ok(tree);
        }

        debug!(path = relative_path, "Requesting document symbols");
        let params = DocumentSymbolParams {
            text_document: self.document_identifier(relative_path)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let response = client.document_symbols(params).await;
        self.close_file(relative_path).await;

        let Some(response) = response? else {
            warn!(path = relative_path, "Server returned null for document symbols");
            return Ok(SymbolTree::new());
        };

        let mut tree = SymbolTree::new();
        match response {
            DocumentSymbolResponse::Nested(nested) => {
                for symbol in &nested {
                    let id = self.convert_nested(&mut tree, symbol, relative_path, None);
                    tree.add_root(id);
                }
            }
            DocumentSymbolResponse::Flat(flat) => {
                for info in &flat {
                    let id = self.convert_flat(&mut tree, info);
                    tree.add_root(id);
                }
            }
        }

        if include_body {
            for id in tree.flat() {
                if let Some(node) = tree.get_mut(id) {
                    node.body = Some(symbols::extract_body(&snapshot.contents, &node.range));
                }
            }
        }

        self.cache.insert(
            relative_path,
            include_body,
            snapshot.content_hash,
            tree.clone(),
        );
        Ok(tree)
    }

    fn convert_nested(
        &self,
        tree: &mut SymbolTree,
        symbol: &DocumentSymbol,
        relative_path: &str,
        parent: Option<SymbolId>,
    ) -> SymbolId {
        let location = self
            .mapper
            .location_for_relative(relative_path, symbol.range);
        let id = tree.push(SymbolNode {
            name: symbol.name.clone(),
            kind: symbol.kind,
            range: symbol.range,
            selection_range: symbol.selection_range,
            location,
            body: None,
            children: Vec::new(),
            parent,
        });
        if let Some(children) = &symbol.children {
            for child in children {
                let child_id = self.convert_nested(tree, child, relative_path, Some(id));
                if let Some(node) = tree.get_mut(id) {
                    node.children.push(child_id);
                }
            }
        }
        id
    }

    fn convert_flat(&self, tree: &mut SymbolTree, info: &SymbolInformation) -> SymbolId {
        let location = self
            .mapper
            .location(info.location.uri.as_str(), info.location.range);
        tree.push(SymbolNode {
            name: info.name.clone(),
            kind: info.kind,
            range: info.location.range,
            selection_range: info.location.range,
            location,
            body: None,
            children: Vec::new(),
            parent: None,
        })
    }

    /// Builds the full symbol tree of the repository (or of a sub-path):
    /// synthetic Package nodes for directories, File nodes wrapping each
    /// file's symbols, ignored paths skipped throughout.
    ///
    /// Passing an ignored file explicitly yields an empty tree and an
    /// error-level log. The walk visits entries in sorted order, so the
    /// result is deterministic for a given file system state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the path does not exist.
    pub async fn request_full_symbol_tree(
        &self,
        within_relative_path: Option<&str>,
        include_body: bool,
    ) -> Result<SymbolTree> {
        self.client()?;
        let start_rel = within_relative_path.unwrap_or(".");
        let absolute = if start_rel == "." {
            self.root.clone()
        } else {
            self.absolute(start_rel)
        };
        if !absolute.exists() {
            return Err(Error::FileNotFound(absolute));
        }

        if absolute.is_file() {
            if self.ignore.is_ignored(start_rel, true)? {
                error!(
                    path = start_rel,
                    "Explicitly passed file is ignored; returning empty symbol tree"
                );
                return Ok(SymbolTree::new());
            }
            return self.request_document_symbols(start_rel, include_body).await;
        }

        if start_rel != "." && self.ignore.is_ignored(start_rel, true)? {
            error!(
                path = start_rel,
                "Explicitly passed directory is ignored; returning empty symbol tree"
            );
            return Ok(SymbolTree::new());
        }

        let listing = self.collect_directory(start_rel)?;
        let mut tree = SymbolTree::new();
        let root_id = self.build_directory(&listing, include_body, &mut tree).await?;
        tree.add_root(root_id);
        Ok(tree)
    }

    fn collect_directory(&self, rel_dir: &str) -> Result<DirListing> {
        let absolute = if rel_dir == "." {
            self.root.clone()
        } else {
            self.absolute(rel_dir)
        };
        let name = absolute
            .file_name()
            .map_or_else(|| rel_dir.to_string(), |n| n.to_string_lossy().to_string());
        let mut listing = DirListing {
            relative: rel_dir.to_string(),
            name,
            subdirs: Vec::new(),
            files: Vec::new(),
        };

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&absolute)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .collect();
        entries.sort();

        for path in entries {
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            let child_rel = if rel_dir == "." {
                file_name
            } else {
                format!("{rel_dir}/{file_name}")
            };
            match self.ignore.is_ignored(&child_rel, true) {
                Ok(true) => {
                    debug!(path = %child_rel, "Skipping ignored path");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(path = %child_rel, "Skipping unreadable path: {e}");
                    continue;
                }
            }
            if path.is_dir() {
                listing.subdirs.push(self.collect_directory(&child_rel)?);
            } else if path.is_file() {
                listing.files.push(child_rel);
            }
        }
        Ok(listing)
    }

    fn build_directory<'a>(
        &'a self,
        listing: &'a DirListing,
        include_body: bool,
        tree: &'a mut SymbolTree,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<SymbolId>> + Send + 'a>> {
        Box::pin(async move {
            let dir_range = Range::new(Position::new(0, 0), Position::new(0, 0));
            let package_id = tree.push(SymbolNode {
                name: listing.name.clone(),
                kind: SymbolKind::PACKAGE,
                range: dir_range,
                selection_range: dir_range,
                location: self.mapper.location_for_relative(&listing.relative, dir_range),
                body: None,
                children: Vec::new(),
                parent: None,
            });

            for subdir in &listing.subdirs {
                let child_id = self.build_directory(subdir, include_body, tree).await?;
                if let Some(child) = tree.get_mut(child_id) {
                    child.parent = Some(package_id);
                }
                if let Some(package) = tree.get_mut(package_id) {
                    package.children.push(child_id);
                }
            }

            for file_rel in &listing.files {
                let file_tree = self
                    .request_document_symbols(file_rel, include_body)
                    .await?;
                let snapshot = self.open_snapshot(file_rel).await?;
                self.close_file(file_rel).await;
                let file_range = symbols::full_file_range(&snapshot.contents);

                let stem = Path::new(file_rel)
                    .file_stem()
                    .map_or_else(|| file_rel.clone(), |s| s.to_string_lossy().to_string());
                let file_id = tree.push(SymbolNode {
                    name: stem,
                    kind: SymbolKind::FILE,
                    range: file_range,
                    selection_range: file_range,
                    location: self.mapper.location_for_relative(file_rel, file_range),
                    body: include_body.then(|| snapshot.contents.clone()),
                    children: Vec::new(),
                    parent: Some(package_id),
                });
                if let Some(package) = tree.get_mut(package_id) {
                    package.children.push(file_id);
                }
                tree.graft(&file_tree, Some(file_id));
            }

            Ok(package_id)
        })
    }

    /// Finds the innermost symbol containing the given position.
    ///
    /// Only multi-line Method/Function/Class/Variable symbols are
    /// considered; in strict mode a symbol does not contain its own start
    /// position, which makes the query return the enclosing parent when
    /// probed at a symbol's header. An empty target line yields `None`.
    ///
    /// # Errors
    ///
    /// Propagates transport, protocol and file errors.
    pub async fn request_containing_symbol(
        &self,
        relative_path: &str,
        line: u32,
        column: Option<u32>,
        strict: bool,
        include_body: bool,
    ) -> Result<Option<SymbolNode>> {
        let snapshot = self.open_snapshot(relative_path).await?;
        self.close_file(relative_path).await;
        let target_line = snapshot.contents.split('\n').nth(line as usize);
        match target_line {
            None => {
                error!(
                    path = relative_path,
                    line, "Containing-symbol lookup past end of file"
                );
                return Ok(None);
            }
            Some(text) if text.trim().is_empty() => {
                error!(
                    path = relative_path,
                    line, "Containing-symbol lookup on an empty line is not supported"
                );
                return Ok(None);
            }
            Some(_) => {}
        }

        let tree = self.request_document_symbols(relative_path, false).await?;
        let flat = tree.flat_symbols();
        let Some(found) = select_containing(&flat, line, column, strict) else {
            return Ok(None);
        };
        let mut result = found.clone();
        if include_body {
            result.body = Some(symbols::extract_body(&snapshot.contents, &result.range));
        }
        Ok(Some(result))
    }

    /// Finds the symbol that defines the symbol at the given position:
    /// the definition is resolved first, then the symbol containing the
    /// definition's start.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_defining_symbol(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
        include_body: bool,
    ) -> Result<Option<SymbolNode>> {
        let definitions = self.request_definition(relative_path, line, column).await?;
        let Some(definition) = definitions.first() else {
            return Ok(None);
        };
        let Some(def_path) = definition.relative_path.clone() else {
            return Ok(None);
        };
        self.request_containing_symbol(
            &def_path,
            definition.range.start.line,
            Some(definition.range.start.character),
            false,
            include_body,
        )
        .await
    }

    /// Finds all symbols that reference the symbol at the given position,
    /// together with the location of each reference.
    ///
    /// When no containing symbol is found for a member-write reference
    /// like `instance.status = …` (a Python pattern its servers cannot
    /// attribute), a same-file top-level Variable named like the receiver
    /// is substituted; this fallback is gated on the configured language.
    /// When a reference resolves to no symbol at all, a File symbol is
    /// synthesized if `include_file_symbols` allows it.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    #[allow(
        clippy::fn_params_excessive_bools,
        reason = "Mirrors the flag set of the underlying protocol operation"
    )]
    pub async fn request_referencing_symbols(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
        include_imports: bool,
        include_self: bool,
        include_body: bool,
        include_file_symbols: bool,
    ) -> Result<Vec<ReferenceInSymbol>> {
        let references = self.request_references(relative_path, line, column).await?;
        if references.is_empty() {
            return Ok(Vec::new());
        }

        let mut result = Vec::new();
        let mut incoming_symbol: Option<SymbolNode> = None;

        for reference in &references {
            let Some(ref_path) = reference.relative_path.clone() else {
                continue;
            };
            let ref_line = reference.range.start.line;
            let ref_col = reference.range.start.character;

            let snapshot = self.open_snapshot(&ref_path).await?;
            let mut containing = self
                .request_containing_symbol(&ref_path, ref_line, Some(ref_col), false, include_body)
                .await?;

            if containing.is_none() && self.config.code_language == Language::Python {
                containing = self
                    .member_write_fallback(&snapshot, &ref_path, reference)
                    .await?;
            }

            if containing.is_none() && include_file_symbols {
                warn!(
                    path = %ref_path,
                    line = ref_line,
                    column = ref_col,
                    "No containing symbol found; synthesizing file symbol"
                );
                containing = Some(self.file_symbol(&ref_path, &snapshot, include_body));
            }
            self.close_file(&ref_path).await;

            let Some(symbol) = containing else { continue };
            if !include_file_symbols && symbol.kind == SymbolKind::FILE {
                continue;
            }

            let is_self_reference = symbol.location.relative_path.as_deref()
                == Some(relative_path)
                && symbol.selection_range.start.line == ref_line
                && symbol.selection_range.start.character == ref_col;
            if is_self_reference {
                incoming_symbol = Some(symbol.clone());
                if include_self {
                    result.push(ReferenceInSymbol {
                        symbol,
                        line: ref_line,
                        character: ref_col,
                    });
                } else {
                    debug!(name = %symbol.name, "Skipping self-reference");
                }
                continue;
            }

            // Imports are not a symbol kind of their own; a reference whose
            // container shares name and kind with the input symbol is the
            // closest observable signature of one.
            if !include_imports
                && incoming_symbol.as_ref().is_some_and(|incoming| {
                    incoming.name == symbol.name && incoming.kind == symbol.kind
                })
            {
                debug!(name = %symbol.name, "Skipping import-like reference");
                continue;
            }

            result.push(ReferenceInSymbol {
                symbol,
                line: ref_line,
                character: ref_col,
            });
        }

        Ok(result)
    }

    async fn member_write_fallback(
        &self,
        snapshot: &FileSnapshot,
        ref_path: &str,
        reference: &FileLocation,
    ) -> Result<Option<SymbolNode>> {
        let ref_line = reference.range.start.line;
        let Some(line_text) = snapshot.contents.split('\n').nth(ref_line as usize) else {
            return Ok(None);
        };
        let Some((receiver, _)) = line_text.split_once('.') else {
            return Ok(None);
        };
        let receiver = receiver.trim();
        if receiver.is_empty() {
            return Ok(None);
        }

        let tree = self.request_document_symbols(ref_path, false).await?;
        for node in tree.flat_symbols() {
            if node.kind == SymbolKind::VARIABLE && node.name == receiver {
                let mut substituted = node.clone();
                substituted.location = reference.clone();
                substituted.range = reference.range;
                return Ok(Some(substituted));
            }
        }
        Ok(None)
    }

    fn file_symbol(
        &self,
        relative_path: &str,
        snapshot: &FileSnapshot,
        include_body: bool,
    ) -> SymbolNode {
        let file_range = symbols::full_file_range(&snapshot.contents);
        let name = Path::new(relative_path)
            .file_stem()
            .map_or_else(|| relative_path.to_string(), |s| s.to_string_lossy().to_string());
        SymbolNode {
            name,
            kind: SymbolKind::FILE,
            range: file_range,
            selection_range: file_range,
            location: self.mapper.location_for_relative(relative_path, file_range),
            body: include_body.then(|| snapshot.contents.clone()),
            children: Vec::new(),
            parent: None,
        }
    }

    /// Requests hover information at the given position.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_hover(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
    ) -> Result<Option<Hover>> {
        let client = self.client()?;
        self.open_snapshot(relative_path).await?;
        let params = HoverParams {
            text_document_position_params: self.position_params(relative_path, line, column)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        let response = client.hover(params).await;
        self.close_file(relative_path).await;
        response
    }

    /// Requests completions at the given position.
    ///
    /// Polls while the server reports `isIncomplete` (bounded), waits for
    /// the completions-ready signal between polls, discards keyword items
    /// and deduplicates by canonical JSON.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_completions(
        &self,
        relative_path: &str,
        line: u32,
        column: u32,
        allow_incomplete: bool,
    ) -> Result<Vec<CompletionEntry>> {
        let client = self.client()?;
        self.open_snapshot(relative_path).await?;
        let params = CompletionParams {
            text_document_position: self.position_params(relative_path, line, column)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: Some(CompletionContext {
                trigger_kind: CompletionTriggerKind::INVOKED,
                trigger_character: None,
            }),
        };

        let mut ready = self.completions_ready.subscribe();
        eprintln!("DEBUG: initial ready value = {}", *ready.borrow());
        let mut is_incomplete;
        let mut items: Vec<CompletionItem>;
        let mut retries = 0;
        loop {
            eprintln!("DEBUG: before wait_for");
            if ready.wait_for(|signaled| *signaled).await.is_err() {
                return Err(Error::Transport("completion signal dropped".to_string()));
            }
            eprintln!("DEBUG: after wait_for, calling completion");
            let response = client.completion(params.clone()).await;
            eprintln!("DEBUG: completion response received");
            (is_incomplete, items) = match response {
                Ok(Some(CompletionResponse::Array(items))) => (false, items),
                Ok(Some(CompletionResponse::List(list))) => (list.is_incomplete, list.items),
                Ok(None) => (true, Vec::new()),
                Err(e) => {
                    self.close_file(relative_path).await;
                    return Err(e);
                }
            };
            retries += 1;
            if !is_incomplete || retries >= COMPLETION_RETRIES {
                break;
            }
        }
        self.close_file(relative_path).await;

        if is_incomplete && !allow_incomplete {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for item in items {
            if item.kind == Some(CompletionItemKind::KEYWORD) {
                continue;
            }
            let entry = CompletionEntry {
                completion_text: completion_text(&item),
                kind: item.kind,
                detail: item.detail,
            };
            let canonical = serde_json::to_string(&entry)?;
            if seen.insert(canonical) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Searches symbols across the workspace. Returns `None` when the
    /// server answers null.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_workspace_symbol(&self, query: &str) -> Result<Option<Vec<SymbolNode>>> {
        let client = self.client()?;
        let params = WorkspaceSymbolParams {
            query: query.to_string(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let Some(response) = client.workspace_symbols(params).await? else {
            return Ok(None);
        };

        let nodes = match response {
            WorkspaceSymbolResponse::Flat(flat) => flat
                .iter()
                .map(|info| {
                    let location = self
                        .mapper
                        .location(info.location.uri.as_str(), info.location.range);
                    SymbolNode {
                        name: info.name.clone(),
                        kind: info.kind,
                        range: info.location.range,
                        selection_range: info.location.range,
                        location,
                        body: None,
                        children: Vec::new(),
                        parent: None,
                    }
                })
                .collect(),
            WorkspaceSymbolResponse::Nested(nested) => nested
                .iter()
                .map(|symbol| {
                    let (uri, range) = match &symbol.location {
                        lsp_types::OneOf::Left(location) => {
                            (location.uri.as_str().to_string(), location.range)
                        }
                        lsp_types::OneOf::Right(workspace_location) => (
                            workspace_location.uri.as_str().to_string(),
                            Range::default(),
                        ),
                    };
                    let location = self.mapper.location(&uri, range);
                    SymbolNode {
                        name: symbol.name.clone(),
                        kind: symbol.kind,
                        range,
                        selection_range: range,
                        location,
                        body: None,
                        children: Vec::new(),
                        parent: None,
                    }
                })
                .collect(),
        };
        Ok(Some(nodes))
    }

    /// Pulls diagnostics for a document (`textDocument/diagnostic`).
    /// The raw report is returned because its shape varies across servers.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_document_diagnostic(
        &self,
        relative_path: &str,
    ) -> Result<Option<serde_json::Value>> {
        let client = self.client()?;
        self.open_snapshot(relative_path).await?;
        let params = DocumentDiagnosticParams {
            text_document: self.document_identifier(relative_path)?,
            identifier: None,
            previous_result_id: None,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let response = client.document_diagnostic(params).await;
        self.close_file(relative_path).await;
        response
    }

    /// Requests code actions for the given range with an empty diagnostic
    /// context.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_code_action(
        &self,
        relative_path: &str,
        range: Range,
    ) -> Result<Option<CodeActionResponse>> {
        let client = self.client()?;
        self.open_snapshot(relative_path).await?;
        let params = CodeActionParams {
            text_document: self.document_identifier(relative_path)?,
            range,
            context: CodeActionContext::default(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let response = client.code_actions(params).await;
        self.close_file(relative_path).await;
        response
    }

    /// Stored push diagnostics for a file, as last published by the server.
    #[must_use]
    pub fn diagnostics_for_file(&self, relative_path: &str) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .ok()
            .and_then(|store| store.get(relative_path).cloned())
            .unwrap_or_default()
    }

    /// Stored diagnostics filtered by the standard LSP severity integers
    /// (1=Error, 2=Warning, 3=Info, 4=Hint). `None` returns everything.
    #[must_use]
    pub fn diagnostics_by_severity(
        &self,
        relative_path: &str,
        severity_levels: Option<&[i32]>,
    ) -> Vec<Diagnostic> {
        let all = self.diagnostics_for_file(relative_path);
        let Some(levels) = severity_levels else {
            return all;
        };
        all.into_iter()
            .filter(|diagnostic| {
                diagnostic
                    .severity
                    .as_ref()
                    .is_some_and(|severity| levels.iter().any(|l| severity_matches(severity, *l)))
            })
            .collect()
    }

    /// Overview of a file: `(name, kind, line, column)` of each top-level
    /// symbol, positions taken from the selection range.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_document_overview(
        &self,
        relative_path: &str,
    ) -> Result<Vec<SymbolOverviewEntry>> {
        let tree = self.request_document_symbols(relative_path, false).await?;
        Ok(tree
            .roots()
            .map(|root| {
                (
                    root.name.clone(),
                    root.kind,
                    root.selection_range.start.line,
                    root.selection_range.start.character,
                )
            })
            .collect())
    }

    /// Overview of a directory: maps each contained file's relative path
    /// to its top-level symbol overview.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn request_dir_overview(
        &self,
        relative_dir_path: &str,
    ) -> Result<HashMap<String, Vec<SymbolOverviewEntry>>> {
        let tree = self
            .request_full_symbol_tree(Some(relative_dir_path), false)
            .await?;
        let mut result: HashMap<String, Vec<SymbolOverviewEntry>> = HashMap::new();
        for id in tree.flat() {
            let Some(node) = tree.get(id) else { continue };
            if node.kind != SymbolKind::FILE {
                continue;
            }
            let Some(file_rel) = node.location.relative_path.clone() else {
                continue;
            };
            let entries = result.entry(file_rel).or_default();
            for child in tree.children(id) {
                entries.push((
                    child.name.clone(),
                    child.kind,
                    child.selection_range.start.line,
                    child.selection_range.start.character,
                ));
            }
        }
        Ok(result)
    }

    /// Overview of a file or directory, dispatching on the path kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the path does not exist.
    pub async fn request_overview(
        &self,
        within_relative_path: &str,
    ) -> Result<HashMap<String, Vec<SymbolOverviewEntry>>> {
        let absolute = self.absolute(within_relative_path);
        if !absolute.exists() {
            return Err(Error::FileNotFound(absolute));
        }
        if absolute.is_file() {
            let overview = self.request_document_overview(within_relative_path).await?;
            Ok(HashMap::from([(within_relative_path.to_string(), overview)]))
        } else {
            self.request_dir_overview(within_relative_path).await
        }
    }

    /// Relative paths of every non-ignored regular file in the repository,
    /// in sorted order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before `start`.
    pub async fn request_parsed_files(&self) -> Result<Vec<String>> {
        self.client()?;
        let listing = self.collect_directory(".")?;
        let mut files = Vec::new();
        collect_files(&listing, &mut files);
        files.sort();
        Ok(files)
    }
}

#[derive(Debug)]
struct DirListing {
    relative: String,
    name: String,
    subdirs: Vec<DirListing>,
    files: Vec<String>,
}

fn collect_files(listing: &DirListing, out: &mut Vec<String>) {
    out.extend(listing.files.iter().cloned());
    for subdir in &listing.subdirs {
        collect_files(subdir, out);
    }
}

/// Chooses the display text of a completion item: label, then insert text,
/// then the text edit's new text.
fn completion_text(item: &CompletionItem) -> String {
    if !item.label.is_empty() {
        return item.label.clone();
    }
    if let Some(insert_text) = &item.insert_text {
        return insert_text.clone();
    }
    match &item.text_edit {
        Some(lsp_types::CompletionTextEdit::Edit(edit)) => edit.new_text.clone(),
        Some(lsp_types::CompletionTextEdit::InsertAndReplace(edit)) => edit.new_text.clone(),
        None => String::new(),
    }
}

fn severity_matches(severity: &DiagnosticSeverity, level: i32) -> bool {
    serde_json::to_value(severity)
        .ok()
        .and_then(|v| v.as_i64())
        .is_some_and(|v| v == i64::from(level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_text_preference_order() {
        let mut item = CompletionItem::new_simple("label_text".to_string(), "detail".to_string());
        assert_eq!(completion_text(&item), "label_text");

        item.label = String::new();
        item.insert_text = Some("insert_me".to_string());
        assert_eq!(completion_text(&item), "insert_me");

        item.insert_text = None;
        item.text_edit = Some(lsp_types::CompletionTextEdit::Edit(lsp_types::TextEdit {
            range: Range::default(),
            new_text: "edited".to_string(),
        }));
        assert_eq!(completion_text(&item), "edited");
    }

    #[test]
    fn severity_integer_mapping() {
        assert!(severity_matches(&DiagnosticSeverity::ERROR, 1));
        assert!(severity_matches(&DiagnosticSeverity::WARNING, 2));
        assert!(severity_matches(&DiagnosticSeverity::INFORMATION, 3));
        assert!(severity_matches(&DiagnosticSeverity::HINT, 4));
        assert!(!severity_matches(&DiagnosticSeverity::ERROR, 2));
    }
}
