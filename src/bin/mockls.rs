// SPDX-License-Identifier: GPL-3.0-or-later

//! A configurable mock LSP server for testing.
//!
//! Speaks the LSP protocol over stdin/stdout using Content-Length framed
//! JSON-RPC. CLI flags control timing and failure modes. The server is
//! workspace-aware: definitions, references and workspace symbols are
//! resolved across every source file under the root given at `initialize`,
//! and document symbols are nested by indentation, so class bodies contain
//! their methods. No tokio; deferred notifications use `std::thread`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mock LSP server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockls")]
struct Args {
    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Delay before publishing diagnostics (milliseconds).
    #[arg(long, default_value_t = 0)]
    diagnostics_delay: u64,

    /// Never publish diagnostics.
    #[arg(long)]
    no_diagnostics: bool,

    /// Close after n responses (simulate crash).
    #[arg(long)]
    drop_after: Option<u64>,

    /// Never respond to this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Mark the first n completion responses as incomplete.
    #[arg(long, default_value_t = 0)]
    incomplete_completions: u64,

    /// Send workspace/configuration request after initialize.
    #[arg(long)]
    send_configuration_request: bool,
}

/// A JSON-RPC request.
#[derive(Debug, Deserialize)]
struct Request {
    #[allow(dead_code, reason = "Required by JSON-RPC protocol")]
    jsonrpc: String,
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// A JSON-RPC response.
#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Thread-safe writer handle. Wraps `std::io::Stdout` for production, or a
/// shared `Vec<u8>` for tests.
type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

fn stdout_writer() -> Writer {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[cfg(test)]
fn buffer_writer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer: Box<dyn Write + Send> = Box::new(SharedVecWriter(buf.clone()));
    (Arc::new(Mutex::new(writer)), buf)
}

#[cfg(test)]
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A symbol parsed out of a source file.
#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    kind: u32,
    line: usize,
    indent: usize,
    name_col: usize,
    end_line: usize,
    end_col: usize,
    children: Vec<Symbol>,
}

/// Shared state for the mock server.
struct MockServer {
    args: Args,
    root: Option<PathBuf>,
    documents: HashMap<String, String>,
    response_count: u64,
    completion_count: u64,
    writer: Writer,
    shutdown_flag: Arc<AtomicBool>,
}

impl MockServer {
    fn new(args: Args, writer: Writer) -> Self {
        Self {
            args,
            root: None,
            documents: HashMap::new(),
            response_count: 0,
            completion_count: 0,
            writer,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn run(&mut self, reader: &mut dyn Read) {
        let mut buffer = Vec::new();
        let mut temp = [0u8; 4096];

        loop {
            if self.shutdown_flag.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }

            match reader.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
            }

            while let Some((message, consumed)) = try_parse_message(&buffer) {
                buffer.drain(..consumed);

                let Ok(request) = serde_json::from_str::<Request>(&message) else {
                    continue;
                };

                self.handle_message(request);
            }
        }
    }

    fn handle_message(&mut self, request: Request) {
        let Some(method) = request.method.clone() else {
            return;
        };

        if request.id.is_some() {
            self.handle_request(&method, request);
        } else {
            self.handle_notification(&method, &request.params);
        }
    }

    fn handle_request(&mut self, method: &str, request: Request) {
        let Some(id) = request.id else { return };

        if self.args.hang_on.iter().any(|m| m == method) {
            return;
        }

        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        if self.args.fail_on.iter().any(|m| m == method) {
            self.send_response(&Response {
                jsonrpc: "2.0".to_string(),
                id,
                result: None,
                error: Some(RpcError {
                    code: -32603,
                    message: format!("mockls: configured to fail on {method}"),
                }),
            });
            return;
        }

        let result = match method {
            "initialize" => Some(self.handle_initialize(&request.params)),
            "shutdown" => Some(Value::Null),
            "textDocument/hover" => self.handle_hover(&request.params),
            "textDocument/definition" => self.handle_definition(&request.params),
            "textDocument/references" => self.handle_references(&request.params),
            "textDocument/documentSymbol" => self.handle_document_symbols(&request.params),
            "textDocument/completion" => Some(self.handle_completion(&request.params)),
            "workspace/symbol" => Some(self.handle_workspace_symbols(&request.params)),
            "textDocument/diagnostic" => Some(serde_json::json!({
                "kind": "full",
                "items": []
            })),
            "textDocument/codeAction" => Some(Value::Array(Vec::new())),
            _ => {
                self.send_response(&Response {
                    jsonrpc: "2.0".to_string(),
                    id,
                    result: None,
                    error: Some(RpcError {
                        code: -32601,
                        message: format!("mockls: method not found: {method}"),
                    }),
                });
                return;
            }
        };

        self.send_response(&Response {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error: None,
        });

        if method == "initialize" && self.args.send_configuration_request {
            send_message(
                &self.writer,
                &serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 9001,
                    "method": "workspace/configuration",
                    "params": { "items": [{ "section": "mockls" }] }
                }),
            );
        }
    }

    fn handle_notification(&mut self, method: &str, params: &Value) {
        match method {
            "textDocument/didOpen" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    let text = td.get("text").and_then(Value::as_str).unwrap_or_default();
                    self.documents.insert(uri.to_string(), text.to_string());

                    if !self.args.no_diagnostics {
                        self.publish_diagnostics(uri);
                    }
                }
            }
            "textDocument/didChange" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    if let Some(text) = params
                        .get("contentChanges")
                        .and_then(Value::as_array)
                        .and_then(|arr| arr.last())
                        .and_then(|c| c.get("text"))
                        .and_then(Value::as_str)
                        .filter(|_| {
                            params["contentChanges"][0].get("range").is_none()
                        })
                    {
                        self.documents.insert(uri.to_string(), text.to_string());
                    } else if let Some(change) =
                        params.get("contentChanges").and_then(Value::as_array).and_then(|a| a.first())
                    {
                        self.apply_range_change(uri, change);
                    }

                    if !self.args.no_diagnostics {
                        self.publish_diagnostics(uri);
                    }
                }
            }
            "textDocument/didClose" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    self.documents.remove(uri);
                }
            }
            "exit" => {
                self.shutdown_flag
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                std::process::exit(0);
            }
            _ => {}
        }
    }

    fn apply_range_change(&mut self, uri: &str, change: &Value) {
        let Some(existing) = self.documents.get(uri) else {
            return;
        };
        let Some(range) = change.get("range") else {
            return;
        };
        let new_text = change.get("text").and_then(Value::as_str).unwrap_or("");
        let start = position_offset(existing, &range["start"]);
        let end = position_offset(existing, &range["end"]);
        if let (Some(start), Some(end)) = (start, end)
            && start <= end
            && end <= existing.len()
        {
            let mut updated = String::with_capacity(existing.len() + new_text.len());
            updated.push_str(&existing[..start]);
            updated.push_str(new_text);
            updated.push_str(&existing[end..]);
            self.documents.insert(uri.to_string(), updated);
        }
    }

    fn handle_initialize(&mut self, params: &Value) -> Value {
        let root_uri = params
            .get("rootUri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                params
                    .get("workspaceFolders")
                    .and_then(Value::as_array)
                    .and_then(|folders| folders.first())
                    .and_then(|f| f.get("uri"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        self.root = root_uri.as_deref().map(uri_to_path);

        serde_json::json!({
            "capabilities": {
                "hoverProvider": true,
                "definitionProvider": true,
                "referencesProvider": true,
                "documentSymbolProvider": true,
                "workspaceSymbolProvider": true,
                "completionProvider": { "triggerCharacters": ["."] },
                "diagnosticProvider": { "interFileDependencies": false, "workspaceDiagnostics": false },
                "textDocumentSync": {
                    "openClose": true,
                    "change": 2
                }
            }
        })
    }

    /// Content of a workspace file, preferring the open-document mirror.
    fn file_content(&self, path: &Path) -> Option<String> {
        let uri = format!("file://{}", path.display());
        if let Some(open) = self.documents.get(&uri) {
            return Some(open.clone());
        }
        std::fs::read_to_string(path).ok()
    }

    /// Every source file under the workspace root, hidden dirs skipped.
    fn workspace_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Some(root) = &self.root {
            collect_source_files(root, &mut files);
        }
        files.sort();
        files
    }

    fn handle_hover(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let content = self.documents.get(uri)?;
        let word = extract_word(content, line, col)?;

        Some(serde_json::json!({
            "contents": {
                "kind": "markdown",
                "value": format!("```\n{word}\n```")
            }
        }))
    }

    fn handle_definition(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let content = self.documents.get(uri)?;
        let word = extract_word(content, line, col)?;

        // Current document first, then the rest of the workspace.
        if let Some(location) = find_definition_in(&word, uri, content) {
            return Some(location);
        }
        for path in self.workspace_files() {
            let file_uri = format!("file://{}", path.display());
            if file_uri == uri {
                continue;
            }
            let Some(file_content) = self.file_content(&path) else {
                continue;
            };
            if let Some(location) = find_definition_in(&word, &file_uri, &file_content) {
                return Some(location);
            }
        }
        None
    }

    fn handle_references(&self, params: &Value) -> Option<Value> {
        let (uri, line, col) = extract_position(params)?;
        let include_declaration = params
            .get("context")
            .and_then(|c| c.get("includeDeclaration"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = self.documents.get(uri)?;
        let word = extract_word(content, line, col)?;

        let mut locations = Vec::new();
        let mut seen_uris = std::collections::HashSet::new();
        collect_references(&word, uri, content, include_declaration, &mut locations);
        seen_uris.insert(uri.to_string());

        for path in self.workspace_files() {
            let file_uri = format!("file://{}", path.display());
            if !seen_uris.insert(file_uri.clone()) {
                continue;
            }
            if let Some(file_content) = self.file_content(&path) {
                collect_references(
                    &word,
                    &file_uri,
                    &file_content,
                    include_declaration,
                    &mut locations,
                );
            }
        }

        Some(Value::Array(locations))
    }

    fn handle_document_symbols(&self, params: &Value) -> Option<Value> {
        let uri = params
            .get("textDocument")
            .and_then(|td| td.get("uri"))
            .and_then(Value::as_str)?;
        let content = self.documents.get(uri).cloned().or_else(|| {
            self.root.as_ref()?;
            std::fs::read_to_string(uri_to_path(uri)).ok()
        })?;
        let symbols = parse_symbols(&content);
        Some(Value::Array(
            symbols.iter().map(symbol_to_json).collect(),
        ))
    }

    fn handle_completion(&mut self, params: &Value) -> Value {
        self.completion_count += 1;
        let is_incomplete = self.completion_count <= self.args.incomplete_completions;

        let mut items = Vec::new();
        if let Some((uri, _, _)) = extract_position(params)
            && let Some(content) = self.documents.get(uri)
        {
            for symbol in flatten(&parse_symbols(content)) {
                items.push(serde_json::json!({
                    "label": symbol.name,
                    "kind": if symbol.kind == 5 { 7 } else { 3 }
                }));
            }
        }
        // One keyword item; well-behaved clients discard these.
        items.push(serde_json::json!({ "label": "import", "kind": 14 }));

        serde_json::json!({
            "isIncomplete": is_incomplete,
            "items": items
        })
    }

    fn handle_workspace_symbols(&self, params: &Value) -> Value {
        let query = params.get("query").and_then(Value::as_str).unwrap_or("");

        let mut all_symbols = Vec::new();
        for path in self.workspace_files() {
            let file_uri = format!("file://{}", path.display());
            let Some(content) = self.file_content(&path) else {
                continue;
            };
            for symbol in flatten(&parse_symbols(&content)) {
                if !query.is_empty() && !symbol.name.contains(query) {
                    continue;
                }
                all_symbols.push(serde_json::json!({
                    "name": symbol.name,
                    "kind": symbol.kind,
                    "location": {
                        "uri": file_uri,
                        "range": {
                            "start": { "line": symbol.line, "character": symbol.indent },
                            "end": { "line": symbol.end_line, "character": symbol.end_col }
                        }
                    }
                }));
            }
        }

        Value::Array(all_symbols)
    }

    fn publish_diagnostics(&self, uri: &str) {
        let delay = self.args.diagnostics_delay;
        let uri_owned = uri.to_string();
        let writer = self.writer.clone();

        if delay > 0 {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(delay));
                send_diagnostics_notification(&writer, &uri_owned);
            });
        } else {
            send_diagnostics_notification(&self.writer, &uri_owned);
        }
    }

    fn send_response(&mut self, response: &Response) {
        let Ok(json) = serde_json::to_string(response) else {
            return;
        };

        write_framed(&self.writer, &json);

        self.response_count += 1;

        if let Some(max) = self.args.drop_after
            && self.response_count >= max
        {
            std::process::exit(1);
        }
    }
}

/// Extract `(uri, line, col)` from a `textDocument/position` params object.
fn extract_position(params: &Value) -> Option<(&str, usize, usize)> {
    let uri = params
        .get("textDocument")
        .and_then(|td| td.get("uri"))
        .and_then(Value::as_str)?;
    let line = usize::try_from(
        params
            .get("position")
            .and_then(|p| p.get("line"))
            .and_then(Value::as_u64)?,
    )
    .ok()?;
    let col = usize::try_from(
        params
            .get("position")
            .and_then(|p| p.get("character"))
            .and_then(Value::as_u64)?,
    )
    .ok()?;
    Some((uri, line, col))
}

/// Byte offset of a `{line, character}` position object.
fn position_offset(content: &str, position: &Value) -> Option<usize> {
    let line = usize::try_from(position.get("line").and_then(Value::as_u64)?).ok()?;
    let character = usize::try_from(position.get("character").and_then(Value::as_u64)?).ok()?;
    let mut offset = 0;
    for (index, text) in content.split('\n').enumerate() {
        if index == line {
            return Some(offset + character.min(text.len()));
        }
        offset += text.len() + 1;
    }
    None
}

/// Build a JSON `Location` object.
fn location_json(uri: &str, line: usize, start: usize, end: usize) -> Value {
    serde_json::json!({
        "uri": uri,
        "range": {
            "start": { "line": line, "character": start },
            "end": { "line": line, "character": end }
        }
    })
}

fn uri_to_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

fn collect_source_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_source_files(&path, out);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("py" | "rs" | "js" | "ts" | "go" | "sh")
        ) {
            out.push(path);
        }
    }
}

/// Definition-introducing keywords, mapped to the produced symbol kind.
const DEF_KEYWORDS: [(&str, u32); 7] = [
    ("class ", 5),
    ("def ", 12),
    ("fn ", 12),
    ("function ", 12),
    ("let ", 13),
    ("var ", 13),
    ("const ", 14),
];

/// Find the definition of `word` in one file: a keyword line introducing
/// it, or a top-level assignment. Returns the location of the *name*.
fn find_definition_in(word: &str, uri: &str, content: &str) -> Option<Value> {
    for (line_idx, line_text) in content.lines().enumerate() {
        let trimmed = line_text.trim_start();
        let indent = line_text.len() - trimmed.len();
        for (keyword, _) in DEF_KEYWORDS {
            if let Some(rest) = trimmed.strip_prefix(keyword) {
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if name == word {
                    let name_col = indent + keyword.len();
                    return Some(location_json(
                        uri,
                        line_idx,
                        name_col,
                        name_col + word.len(),
                    ));
                }
            }
        }
        if is_assignment_of(trimmed, word) {
            return Some(location_json(uri, line_idx, indent, indent + word.len()));
        }
    }
    None
}

fn is_assignment_of(trimmed: &str, word: &str) -> bool {
    trimmed
        .strip_prefix(word)
        .is_some_and(|rest| rest.trim_start().starts_with('=') && !rest.trim_start().starts_with("=="))
}

/// Collect word-boundary occurrences of `word` in one file. Declaration
/// sites (keyword-introduced or top-of-line assignments) are skipped
/// unless requested.
fn collect_references(
    word: &str,
    uri: &str,
    content: &str,
    include_declaration: bool,
    out: &mut Vec<Value>,
) {
    for (line_idx, line_text) in content.lines().enumerate() {
        let bytes = line_text.as_bytes();
        let mut start = 0;
        while let Some(pos) = line_text[start..].find(word) {
            let col = start + pos;
            let end = col + word.len();
            let boundary_before = col == 0 || !is_word_char(bytes[col - 1]);
            let boundary_after = end >= bytes.len() || !is_word_char(bytes[end]);
            if boundary_before && boundary_after {
                let declaration = is_declaration_site(line_text, col, word);
                if include_declaration || !declaration {
                    out.push(location_json(uri, line_idx, col, end));
                }
            }
            start = end;
        }
    }
}

fn is_declaration_site(line_text: &str, col: usize, word: &str) -> bool {
    let before = &line_text[..col];
    let trimmed_before = before.trim_start();
    if DEF_KEYWORDS.iter().any(|(keyword, _)| trimmed_before == *keyword) {
        return true;
    }
    // Assignment introducing the name at the start of the line.
    before.chars().all(char::is_whitespace) && is_assignment_of(line_text.trim_start(), word)
}

const fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Parse nested symbols out of file content, nesting by indentation.
fn parse_symbols(content: &str) -> Vec<Symbol> {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut roots: Vec<Symbol> = Vec::new();
    // Stack of (indent, path of child indices into `roots`).
    let mut stack: Vec<(usize, Vec<usize>)> = Vec::new();

    for (line_idx, line_text) in lines.iter().enumerate() {
        let trimmed = line_text.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        let indent = line_text.len() - trimmed.len();

        let parsed = DEF_KEYWORDS.iter().find_map(|(keyword, kind)| {
            trimmed.strip_prefix(keyword).map(|rest| {
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                (name, *kind, indent + keyword.len())
            })
        });
        let parsed = parsed.or_else(|| {
            // Top-level assignment: `name = …`
            let name: String = trimmed
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() && indent == 0 && is_assignment_of(trimmed, &name) {
                Some((name, 13, 0))
            } else {
                None
            }
        });
        let Some((name, kind, name_col)) = parsed else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let (end_line, end_col) = symbol_extent(&lines, line_idx, indent);
        let symbol = Symbol {
            name,
            kind,
            line: line_idx,
            indent,
            name_col,
            end_line,
            end_col,
            children: Vec::new(),
        };

        while let Some((parent_indent, _)) = stack.last() {
            if *parent_indent >= indent {
                stack.pop();
            } else {
                break;
            }
        }

        let path = if let Some((_, parent_path)) = stack.last() {
            let parent = symbol_at_path_mut(&mut roots, parent_path);
            parent.children.push(symbol);
            let mut path = parent_path.clone();
            path.push(parent.children.len() - 1);
            path
        } else {
            roots.push(symbol);
            vec![roots.len() - 1]
        };
        stack.push((indent, path));
    }

    roots
}

fn symbol_at_path_mut<'a>(roots: &'a mut Vec<Symbol>, path: &[usize]) -> &'a mut Symbol {
    let mut iter = path.iter();
    let first = iter.next().copied().unwrap_or(0);
    let mut current = &mut roots[first];
    for &index in iter {
        current = &mut current.children[index];
    }
    current
}

/// The extent of a symbol starting at `line`: the last following
/// non-empty line indented deeper than the symbol itself.
fn symbol_extent(lines: &[&str], line: usize, indent: usize) -> (usize, usize) {
    let mut end_line = line;
    for (offset, text) in lines.iter().enumerate().skip(line + 1) {
        let trimmed = text.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        let line_indent = text.len() - trimmed.len();
        if line_indent <= indent {
            break;
        }
        end_line = offset;
    }
    (end_line, lines.get(end_line).map_or(0, |l| l.len()))
}

fn flatten(symbols: &[Symbol]) -> Vec<Symbol> {
    let mut out = Vec::new();
    for symbol in symbols {
        out.push(symbol.clone());
        out.extend(flatten(&symbol.children));
    }
    out
}

fn symbol_to_json(symbol: &Symbol) -> Value {
    serde_json::json!({
        "name": symbol.name,
        "kind": symbol.kind,
        "range": {
            "start": { "line": symbol.line, "character": symbol.indent },
            "end": { "line": symbol.end_line, "character": symbol.end_col }
        },
        "selectionRange": {
            "start": { "line": symbol.line, "character": symbol.name_col },
            "end": { "line": symbol.line, "character": symbol.name_col + symbol.name.len() }
        },
        "children": symbol.children.iter().map(symbol_to_json).collect::<Vec<_>>()
    })
}

/// Write a Content-Length framed JSON string.
fn write_framed(writer: &Writer, json: &str) {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());
    let Ok(mut w) = writer.lock() else { return };
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(json.as_bytes());
    let _ = w.flush();
}

/// Send a JSON-RPC message to the client.
fn send_message(writer: &Writer, value: &Value) {
    let Ok(json) = serde_json::to_string(value) else {
        return;
    };
    write_framed(writer, &json);
}

/// Send a `publishDiagnostics` notification.
fn send_diagnostics_notification(writer: &Writer, uri: &str) {
    send_message(
        writer,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri,
                "diagnostics": [{
                    "range": {
                        "start": { "line": 0, "character": 0 },
                        "end": { "line": 0, "character": 1 }
                    },
                    "severity": 2,
                    "source": "mockls",
                    "message": "mockls: mock diagnostic"
                }]
            }
        }),
    );
}

/// Parse a Content-Length framed message from a buffer.
/// Returns the message string and the number of bytes consumed.
fn try_parse_message(buffer: &[u8]) -> Option<(String, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = std::str::from_utf8(&buffer[..header_end]).ok()?;

    let mut content_length: Option<usize> = None;
    for line in headers.lines() {
        if line.to_ascii_lowercase().starts_with("content-length:") {
            content_length = line
                .split_once(':')
                .and_then(|(_, v)| v.trim().parse().ok());
        }
    }

    let content_length = content_length?;
    let total = header_end + 4 + content_length;

    if buffer.len() < total {
        return None;
    }

    let body = std::str::from_utf8(&buffer[header_end + 4..total]).ok()?;
    Some((body.to_string(), total))
}

/// Extract the word at a given line and column from content.
fn extract_word(content: &str, line: usize, col: usize) -> Option<String> {
    let line_text = content.lines().nth(line)?;

    if col >= line_text.len() {
        return None;
    }

    let bytes = line_text.as_bytes();

    let start = (0..=col)
        .rev()
        .find(|&i| !is_word_char(bytes[i]))
        .map_or(0, |i| i + 1);

    let end = (col..bytes.len())
        .find(|&i| !is_word_char(bytes[i]))
        .unwrap_or(bytes.len());

    if start >= end {
        return None;
    }

    Some(line_text[start..end].to_string())
}

fn main() {
    let args = Args::parse();
    let writer = stdout_writer();
    let mut server = MockServer::new(args, writer);
    let mut stdin = std::io::stdin().lock();
    server.run(&mut stdin);
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_args() -> Args {
        Args {
            response_delay: 0,
            diagnostics_delay: 0,
            no_diagnostics: false,
            drop_after: None,
            hang_on: vec![],
            fail_on: vec![],
            incomplete_completions: 0,
            send_configuration_request: false,
        }
    }

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn extract_messages(data: &[u8]) -> Vec<Value> {
        let mut messages = Vec::new();
        let mut buf = data.to_vec();
        while let Some((msg, consumed)) = try_parse_message(&buf) {
            if let Ok(v) = serde_json::from_str::<Value>(&msg) {
                messages.push(v);
            }
            buf.drain(..consumed);
        }
        messages
    }

    fn run_server_with(args: Args, input: &[u8]) -> Vec<Value> {
        let (writer, buf) = buffer_writer();
        let mut server = MockServer::new(args, writer);
        let mut reader = Cursor::new(input.to_vec());
        server.run(&mut reader);
        let data = buf
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        extract_messages(&data)
    }

    fn initialize_request(id: u64) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "processId": null,
                "capabilities": {},
                "rootUri": "file:///tmp/mockls-test"
            }
        })
        .to_string()
    }

    fn did_open_notification(uri: &str, text: &str) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {
                "textDocument": {
                    "uri": uri,
                    "languageId": "python",
                    "version": 0,
                    "text": text
                }
            }
        })
        .to_string()
    }

    #[test]
    fn initialize_advertises_required_capabilities() {
        let input = frame(&initialize_request(1));
        let messages = run_server_with(default_args(), &input);

        let caps = &messages[0]["result"]["capabilities"];
        assert_eq!(caps["definitionProvider"], true);
        assert_eq!(caps["referencesProvider"], true);
        assert_eq!(caps["documentSymbolProvider"], true);
        assert!(caps["completionProvider"].is_object());
        assert!(caps["textDocumentSync"].is_object());
    }

    #[test]
    fn nested_symbols_by_indentation() {
        let content = "class C:\n    def m(self):\n        pass\n\ndef f():\n    pass\n";
        let symbols = parse_symbols(content);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name, "C");
        assert_eq!(symbols[0].kind, 5);
        assert_eq!(symbols[0].children.len(), 1);
        assert_eq!(symbols[0].children[0].name, "m");
        assert_eq!(symbols[0].end_line, 2);
        assert_eq!(symbols[1].name, "f");
        assert_eq!(symbols[1].line, 4);
        assert_eq!(symbols[1].end_line, 5);
    }

    #[test]
    fn top_level_assignment_is_a_variable() {
        let symbols = parse_symbols("x = 1\ny == x\n");
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "x");
        assert_eq!(symbols[0].kind, 13);
    }

    #[test]
    fn definition_returns_name_position() {
        let location = find_definition_in("f", "file:///t.py", "def f():\n    pass\n")
            .expect("definition found");
        assert_eq!(location["range"]["start"]["line"], 0);
        assert_eq!(location["range"]["start"]["character"], 4);
    }

    #[test]
    fn references_skip_declarations_by_default() {
        let mut out = Vec::new();
        collect_references("f", "file:///t.py", "def f():\n    pass\nf()\nfrom x import f\n", false, &mut out);
        assert_eq!(out.len(), 2, "declaration must be skipped: {out:?}");
        assert_eq!(out[0]["range"]["start"]["line"], 2);
    }

    #[test]
    fn references_respect_word_boundaries() {
        let mut out = Vec::new();
        collect_references("f", "file:///t.py", "final = 1\noff = f\n", false, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["range"]["start"]["line"], 1);
        assert_eq!(out[0]["range"]["start"]["character"], 6);
    }

    #[test]
    fn completion_marks_first_responses_incomplete() {
        let mut args = default_args();
        args.incomplete_completions = 1;
        args.no_diagnostics = true;

        let uri = "file:///tmp/t.py";
        let completion = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "textDocument/completion",
            "params": {
                "textDocument": { "uri": uri },
                "position": { "line": 0, "character": 0 }
            }
        })
        .to_string();

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open_notification(uri, "def f():\n    pass\n")));
        input.extend(frame(&completion));
        input.extend(frame(&completion.replace("\"id\":2", "\"id\":3")));

        let messages = run_server_with(args, &input);
        let first = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(2))
            .expect("first completion");
        let second = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(3))
            .expect("second completion");
        assert_eq!(first["result"]["isIncomplete"], true);
        assert_eq!(second["result"]["isIncomplete"], false);
        let labels: Vec<&str> = second["result"]["items"]
            .as_array()
            .expect("items")
            .iter()
            .filter_map(|i| i["label"].as_str())
            .collect();
        assert!(labels.contains(&"f"));
        assert!(labels.contains(&"import"));
    }

    #[test]
    fn fail_on_returns_internal_error() {
        let mut args = default_args();
        args.fail_on = vec!["textDocument/references".to_string()];
        args.no_diagnostics = true;

        let uri = "file:///tmp/t.py";
        let references = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "textDocument/references",
            "params": {
                "textDocument": { "uri": uri },
                "position": { "line": 0, "character": 4 },
                "context": { "includeDeclaration": false }
            }
        })
        .to_string();

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open_notification(uri, "def f():\n    pass\n")));
        input.extend(frame(&references));

        let messages = run_server_with(args, &input);
        let response = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(2))
            .expect("references response");
        assert_eq!(response["error"]["code"], -32603);
    }
}
