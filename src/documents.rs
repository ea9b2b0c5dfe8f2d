// SPDX-License-Identifier: GPL-3.0-or-later

//! Reference-counted mirror of documents opened against the server.
//!
//! The store is the authoritative client-side copy: edits are applied here
//! first, then reported to the server, and content hashes computed from it
//! key the symbol cache. The store itself performs no I/O towards the
//! server; every mutation returns the notification payload the caller must
//! send, so that the server's view equals `contents` once that send
//! returns.

use std::collections::HashMap;
use std::path::Path;

use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams, Position,
    Range, TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem, Uri,
    VersionedTextDocumentIdentifier,
};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// In-memory mirror of one open document.
#[derive(Debug, Clone)]
pub struct FileBuffer {
    /// The document's `file://` URI.
    pub uri: String,
    /// Current contents, matching the server's view after the last
    /// notification was flushed.
    pub contents: String,
    /// Document version, bumped on every edit.
    pub version: i32,
    /// LSP language id.
    pub language_id: String,
    /// Number of open scopes holding this buffer.
    pub ref_count: usize,
    /// MD5 hash of `contents`, recomputed on every mutation.
    pub content_hash: String,
}

/// Hex MD5 digest of document text.
#[must_use]
pub fn content_hash(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

/// Outcome of [`DocumentStore::open`].
pub enum OpenOutcome {
    /// The buffer already existed; its refcount was incremented.
    AlreadyOpen,
    /// A buffer was created; send this notification to the server.
    Opened(DidOpenTextDocumentParams),
}

/// Registry of open file buffers, keyed by URI.
#[derive(Debug, Default)]
pub struct DocumentStore {
    buffers: HashMap<String, FileBuffer>,
}

impl DocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or re-opens) the document at `uri`, reading `absolute_path`
    /// from disk on first open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the file does not exist, or an
    /// I/O error when it cannot be read.
    pub fn open(
        &mut self,
        uri: &str,
        absolute_path: &Path,
        language_id: &str,
    ) -> Result<OpenOutcome> {
        if let Some(buffer) = self.buffers.get_mut(uri) {
            buffer.ref_count += 1;
            trace!(uri, ref_count = buffer.ref_count, "Document already open");
            return Ok(OpenOutcome::AlreadyOpen);
        }

        if !absolute_path.exists() {
            return Err(Error::FileNotFound(absolute_path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(absolute_path)?;
        let hash = content_hash(&contents);
        let parsed_uri: Uri = uri
            .parse()
            .map_err(|e| Error::Transport(format!("invalid document uri {uri}: {e}")))?;

        self.buffers.insert(
            uri.to_string(),
            FileBuffer {
                uri: uri.to_string(),
                contents: contents.clone(),
                version: 0,
                language_id: language_id.to_string(),
                ref_count: 1,
                content_hash: hash,
            },
        );
        debug!(uri, "Opening document");

        Ok(OpenOutcome::Opened(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: parsed_uri,
                language_id: language_id.to_string(),
                version: 0,
                text: contents,
            },
        }))
    }

    /// Drops one reference to the document. When the count reaches zero the
    /// buffer is removed and the `didClose` payload is returned.
    pub fn release(&mut self, uri: &str) -> Option<DidCloseTextDocumentParams> {
        let buffer = self.buffers.get_mut(uri)?;
        buffer.ref_count = buffer.ref_count.saturating_sub(1);
        if buffer.ref_count > 0 {
            return None;
        }
        self.buffers.remove(uri);
        debug!(uri, "Closing document");
        let parsed_uri: Uri = uri.parse().ok()?;
        Some(DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: parsed_uri },
        })
    }

    /// Snapshot of an open buffer.
    #[must_use]
    pub fn get(&self, uri: &str) -> Option<&FileBuffer> {
        self.buffers.get(uri)
    }

    /// True when a buffer for `uri` is currently open.
    #[must_use]
    pub fn is_open(&self, uri: &str) -> bool {
        self.buffers.contains_key(uri)
    }

    /// Inserts `text` at `(line, column)`, bumps the version, recomputes
    /// the hash and returns the post-edit cursor position together with
    /// the `didChange` payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the buffer is not open.
    pub fn insert_at(
        &mut self,
        uri: &str,
        line: u32,
        column: u32,
        text: &str,
    ) -> Result<(Position, DidChangeTextDocumentParams)> {
        let buffer = self
            .buffers
            .get_mut(uri)
            .ok_or_else(|| Error::FileNotFound(uri.into()))?;

        let (new_contents, cursor) = insert_text(&buffer.contents, line, column, text);
        buffer.contents = new_contents;
        buffer.version += 1;
        buffer.content_hash = content_hash(&buffer.contents);

        let position = Position::new(line, column);
        let params = change_params(uri, buffer.version, Range::new(position, position), text)?;
        Ok((cursor, params))
    }

    /// Deletes the text between `start` and `end`, bumps the version,
    /// recomputes the hash and returns the deleted text together with the
    /// `didChange` payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the buffer is not open.
    pub fn delete_between(
        &mut self,
        uri: &str,
        start: Position,
        end: Position,
    ) -> Result<(String, DidChangeTextDocumentParams)> {
        let buffer = self
            .buffers
            .get_mut(uri)
            .ok_or_else(|| Error::FileNotFound(uri.into()))?;

        let (new_contents, deleted) = delete_text(&buffer.contents, start, end);
        buffer.contents = new_contents;
        buffer.version += 1;
        buffer.content_hash = content_hash(&buffer.contents);

        let params = change_params(uri, buffer.version, Range::new(start, end), "")?;
        Ok((deleted, params))
    }
}

fn change_params(
    uri: &str,
    version: i32,
    range: Range,
    text: &str,
) -> Result<DidChangeTextDocumentParams> {
    let parsed_uri: Uri = uri
        .parse()
        .map_err(|e| Error::Transport(format!("invalid document uri {uri}: {e}")))?;
    Ok(DidChangeTextDocumentParams {
        text_document: VersionedTextDocumentIdentifier {
            uri: parsed_uri,
            version,
        },
        content_changes: vec![TextDocumentContentChangeEvent {
            range: Some(range),
            range_length: None,
            text: text.to_string(),
        }],
    })
}

/// Byte offset of `(line, column)` in `contents`, clamping past-the-end
/// positions to line/file boundaries. Columns count characters.
fn offset_of(contents: &str, line: u32, column: u32) -> usize {
    let mut current_line = 0u32;
    let mut offset = 0;
    let bytes = contents.as_bytes();
    while current_line < line && offset < bytes.len() {
        if bytes[offset] == b'\n' {
            current_line += 1;
        }
        offset += 1;
    }
    let rest = &contents[offset..];
    let line_end = rest.find('\n').unwrap_or(rest.len());
    let line_text = &rest[..line_end];
    let column_offset = line_text
        .char_indices()
        .nth(column as usize)
        .map_or(line_text.len(), |(o, _)| o);
    offset + column_offset
}

/// Inserts `text` at `(line, column)` and computes the cursor position
/// just past the inserted text.
#[must_use]
pub fn insert_text(contents: &str, line: u32, column: u32, text: &str) -> (String, Position) {
    let offset = offset_of(contents, line, column);
    let mut updated = String::with_capacity(contents.len() + text.len());
    updated.push_str(&contents[..offset]);
    updated.push_str(text);
    updated.push_str(&contents[offset..]);

    let newline_count = u32::try_from(text.matches('\n').count()).unwrap_or(u32::MAX);
    let cursor = if newline_count == 0 {
        let width = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
        Position::new(line, column + width)
    } else {
        let last_line = text.rsplit('\n').next().unwrap_or("");
        let width = u32::try_from(last_line.chars().count()).unwrap_or(u32::MAX);
        Position::new(line + newline_count, width)
    };
    (updated, cursor)
}

/// Deletes the text between `start` and `end`, returning the new contents
/// and the deleted text.
#[must_use]
pub fn delete_text(contents: &str, start: Position, end: Position) -> (String, String) {
    let start_offset = offset_of(contents, start.line, start.character);
    let end_offset = offset_of(contents, end.line, end.character).max(start_offset);
    let deleted = contents[start_offset..end_offset].to_string();
    let mut updated = String::with_capacity(contents.len() - deleted.len());
    updated.push_str(&contents[..start_offset]);
    updated.push_str(&contents[end_offset..]);
    (updated, deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn insert_single_line_cursor() {
        let (updated, cursor) = insert_text("hello world\n", 0, 5, ", dear");
        assert_eq!(updated, "hello, dear world\n");
        assert_eq!(cursor, Position::new(0, 11));
    }

    #[test]
    fn insert_multi_line_cursor() {
        let (updated, cursor) = insert_text("ab\ncd\n", 1, 1, "X\nYZ");
        assert_eq!(updated, "ab\ncX\nYZd\n");
        assert_eq!(cursor, Position::new(2, 2));
    }

    #[test]
    fn delete_across_lines() {
        let (updated, deleted) =
            delete_text("ab\ncd\nef\n", Position::new(0, 1), Position::new(2, 1));
        assert_eq!(deleted, "b\ncd\ne");
        assert_eq!(updated, "af\n");
    }

    #[test]
    fn insert_then_delete_round_trips() {
        let original = "def f():\n    pass\n";
        let hash_before = content_hash(original);

        let (inserted, cursor) = insert_text(original, 1, 4, "x = 1\n    ");
        let (restored, deleted) = delete_text(&inserted, Position::new(1, 4), cursor);
        assert_eq!(deleted, "x = 1\n    ");
        assert_eq!(restored, original);
        assert_eq!(content_hash(&restored), hash_before);
    }

    #[test]
    fn store_refcounting_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("a.py");
        fs::write(&path, "x = 1\n")?;
        let uri = crate::paths::path_to_uri(&path);

        let mut store = DocumentStore::new();
        let first = store.open(&uri, &path, "python")?;
        assert!(matches!(first, OpenOutcome::Opened(_)));
        let second = store.open(&uri, &path, "python")?;
        assert!(matches!(second, OpenOutcome::AlreadyOpen));
        assert_eq!(store.get(&uri).map(|b| b.ref_count), Some(2));

        assert!(store.release(&uri).is_none());
        let closed = store.release(&uri);
        assert!(closed.is_some());
        assert!(!store.is_open(&uri));
        Ok(())
    }

    #[test]
    fn open_missing_file_fails() {
        let mut store = DocumentStore::new();
        let result = store.open("file:///nowhere/a.py", Path::new("/nowhere/a.py"), "python");
        assert!(matches!(result, Err(crate::error::Error::FileNotFound(_))));
    }

    #[test]
    fn edits_bump_version_and_hash() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("a.py");
        fs::write(&path, "x = 1\n")?;
        let uri = crate::paths::path_to_uri(&path);

        let mut store = DocumentStore::new();
        store.open(&uri, &path, "python")?;
        let original_hash = store.get(&uri).map(|b| b.content_hash.clone());

        let (cursor, change) = store.insert_at(&uri, 0, 5, "23")?;
        assert_eq!(cursor, Position::new(0, 7));
        assert_eq!(change.text_document.version, 1);
        assert_eq!(store.get(&uri).map(|b| b.contents.as_str()), Some("x = 123\n"));

        let (deleted, change) =
            store.delete_between(&uri, Position::new(0, 5), Position::new(0, 7))?;
        assert_eq!(deleted, "23");
        assert_eq!(change.text_document.version, 2);
        assert_eq!(store.get(&uri).map(|b| b.content_hash.clone()), original_hash);
        Ok(())
    }
}
