// SPDX-License-Identifier: GPL-3.0-or-later

//! URI and path mapping with caching.
//!
//! Language servers speak in `file://` URIs; the facade's callers speak in
//! repository-relative paths. [`UriPathMapper`] converts between the two and
//! memoizes every conversion in three write-through maps keyed by the exact
//! input text. Resolution treats the repository root as given; symlinks are
//! only chased when a path does not textually sit under the root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lsp_types::Range;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// An LSP location enriched with repository-relative path information.
///
/// `absolute_path` is always the decoded form of `uri`; `relative_path` is
/// present iff the location lies within the repository root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLocation {
    /// The `file://` URI as received from the server.
    pub uri: String,
    /// The range within the file.
    pub range: Range,
    /// Decoded absolute path of the file.
    #[serde(rename = "absolutePath")]
    pub absolute_path: PathBuf,
    /// Path relative to the repository root, forward slashes, when inside it.
    #[serde(rename = "relativePath", skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
}

/// Converts a filesystem path to a `file://` URI.
///
/// Falls back to naive concatenation for paths `url` refuses (relative
/// paths never reach this point in practice).
#[must_use]
pub fn path_to_uri(path: &Path) -> String {
    url::Url::from_file_path(path)
        .map_or_else(|()| format!("file://{}", path.display()), String::from)
}

/// Decodes a `file://` URI into an absolute path, percent-decoding as
/// needed. Non-file URIs are decoded on a best-effort basis.
#[must_use]
pub fn uri_to_path(uri: &str) -> PathBuf {
    if let Ok(parsed) = url::Url::parse(uri)
        && let Ok(path) = parsed.to_file_path()
    {
        return path;
    }
    // Tolerate bare or slightly malformed file URIs some servers emit.
    let stripped = uri.strip_prefix("file://").unwrap_or(uri);
    PathBuf::from(percent_decode(stripped))
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &text[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Bidirectional cached mapping between URIs, absolute paths and
/// repository-relative paths.
#[derive(Debug)]
pub struct UriPathMapper {
    root: PathBuf,
    uri_to_absolute: Mutex<HashMap<String, PathBuf>>,
    uri_to_relative: Mutex<HashMap<String, Option<String>>>,
    absolute_to_relative: Mutex<HashMap<PathBuf, Option<String>>>,
}

impl UriPathMapper {
    /// Creates a mapper for the given repository root.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            uri_to_absolute: Mutex::new(HashMap::new()),
            uri_to_relative: Mutex::new(HashMap::new()),
            absolute_to_relative: Mutex::new(HashMap::new()),
        }
    }

    /// The repository root this mapper resolves against.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Converts a URI to an absolute path, caching the result.
    pub fn uri_to_absolute(&self, uri: &str) -> PathBuf {
        if let Ok(cache) = self.uri_to_absolute.lock()
            && let Some(hit) = cache.get(uri)
        {
            return hit.clone();
        }
        let path = uri_to_path(uri);
        if let Ok(mut cache) = self.uri_to_absolute.lock() {
            cache.insert(uri.to_string(), path.clone());
        }
        path
    }

    /// Converts an absolute path to a repository-relative path (forward
    /// slashes), or `None` when the path lies outside the repository.
    pub fn absolute_to_relative(&self, absolute: &Path) -> Option<String> {
        if let Ok(cache) = self.absolute_to_relative.lock()
            && let Some(hit) = cache.get(absolute)
        {
            return hit.clone();
        }
        let relative = self.relativize(absolute);
        if let Ok(mut cache) = self.absolute_to_relative.lock() {
            cache.insert(absolute.to_path_buf(), relative.clone());
        }
        relative
    }

    /// Converts a URI directly to a repository-relative path.
    pub fn uri_to_relative(&self, uri: &str) -> Option<String> {
        if let Ok(cache) = self.uri_to_relative.lock()
            && let Some(hit) = cache.get(uri)
        {
            return hit.clone();
        }
        let absolute = self.uri_to_absolute(uri);
        let relative = self.absolute_to_relative(&absolute);
        if let Ok(mut cache) = self.uri_to_relative.lock() {
            cache.insert(uri.to_string(), relative.clone());
        }
        relative
    }

    /// Builds an enriched [`FileLocation`] from a URI and range.
    pub fn location(&self, uri: &str, range: Range) -> FileLocation {
        let absolute_path = self.uri_to_absolute(uri);
        let relative_path = self.absolute_to_relative(&absolute_path);
        FileLocation {
            uri: uri.to_string(),
            range,
            absolute_path,
            relative_path,
        }
    }

    /// Builds an enriched [`FileLocation`] for a known repository-relative
    /// path, without consulting the server.
    #[must_use]
    pub fn location_for_relative(&self, relative: &str, range: Range) -> FileLocation {
        let absolute_path = self.root.join(relative);
        FileLocation {
            uri: path_to_uri(&absolute_path),
            range,
            absolute_path,
            relative_path: Some(relative.replace('\\', "/")),
        }
    }

    fn relativize(&self, absolute: &Path) -> Option<String> {
        if let Ok(stripped) = absolute.strip_prefix(&self.root) {
            return Some(to_forward_slashes(stripped));
        }
        // The server may answer with a symlink-resolved path even though we
        // handed it the root as configured.
        let canonical_root = self.root.canonicalize().ok()?;
        let canonical = absolute.canonicalize().unwrap_or_else(|_| {
            warn!(path = %absolute.display(), "Cannot canonicalize path for relativization");
            absolute.to_path_buf()
        });
        canonical
            .strip_prefix(&canonical_root)
            .ok()
            .map(to_forward_slashes)
    }
}

fn to_forward_slashes(path: &Path) -> String {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::Position;

    fn mapper() -> UriPathMapper {
        UriPathMapper::new(PathBuf::from("/repo"))
    }

    fn zero_range() -> Range {
        Range::new(Position::new(0, 0), Position::new(0, 0))
    }

    #[test]
    fn uri_decodes_to_absolute_path() {
        let m = mapper();
        assert_eq!(
            m.uri_to_absolute("file:///repo/src/main.rs"),
            PathBuf::from("/repo/src/main.rs")
        );
    }

    #[test]
    fn uri_percent_decoding() {
        let m = mapper();
        assert_eq!(
            m.uri_to_absolute("file:///repo/my%20dir/a.py"),
            PathBuf::from("/repo/my dir/a.py")
        );
    }

    #[test]
    fn relative_path_inside_root() {
        let m = mapper();
        assert_eq!(
            m.absolute_to_relative(Path::new("/repo/src/a.py")),
            Some("src/a.py".to_string())
        );
    }

    #[test]
    fn relative_path_outside_root_is_none() {
        let m = mapper();
        assert_eq!(m.absolute_to_relative(Path::new("/usr/lib/os.py")), None);
    }

    #[test]
    fn uri_to_relative_chains_conversions() {
        let m = mapper();
        assert_eq!(
            m.uri_to_relative("file:///repo/pkg/mod.py"),
            Some("pkg/mod.py".to_string())
        );
        // Served from cache the second time; result must be identical.
        assert_eq!(
            m.uri_to_relative("file:///repo/pkg/mod.py"),
            Some("pkg/mod.py".to_string())
        );
    }

    #[test]
    fn location_enrichment() {
        let m = mapper();
        let loc = m.location("file:///repo/a.py", zero_range());
        assert_eq!(loc.absolute_path, PathBuf::from("/repo/a.py"));
        assert_eq!(loc.relative_path.as_deref(), Some("a.py"));

        let outside = m.location("file:///elsewhere/b.py", zero_range());
        assert_eq!(outside.relative_path, None);
    }

    #[test]
    fn path_uri_round_trip() {
        let path = Path::new("/repo/src/lib.rs");
        let uri = path_to_uri(path);
        assert!(uri.starts_with("file://"));
        assert_eq!(uri_to_path(&uri), path);
    }
}
