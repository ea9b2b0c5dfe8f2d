// SPDX-License-Identifier: GPL-3.0-or-later

//! Supported languages and their server launch/filtering defaults.
//!
//! Each language carries the LSP `languageId` used in `didOpen`, the set of
//! source-file extensions considered relevant, the directory names that are
//! always ignored for that ecosystem, and the default command line of the
//! native language server. The server command can be overridden through
//! [`crate::config::ServerOverride`]; installing the server binary itself is
//! the caller's responsibility.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A programming language the facade can drive a server for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Python, served by pyright.
    Python,
    /// Rust, served by rust-analyzer.
    Rust,
    /// Go, served by gopls.
    Go,
    /// TypeScript, served by typescript-language-server.
    TypeScript,
    /// JavaScript, served by typescript-language-server.
    JavaScript,
    /// C and C++, served by clangd.
    Cpp,
    /// PHP, served by phpactor.
    Php,
}

impl Language {
    /// The LSP `languageId` sent in `textDocument/didOpen`.
    #[must_use]
    pub const fn language_id(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::TypeScript => "typescript",
            Self::JavaScript => "javascript",
            Self::Cpp => "cpp",
            Self::Php => "php",
        }
    }

    /// File extensions treated as source files of this language.
    #[must_use]
    pub const fn source_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["py", "pyi"],
            Self::Rust => &["rs"],
            Self::Go => &["go"],
            Self::TypeScript => &["ts", "tsx"],
            Self::JavaScript => &["js", "jsx", "mjs", "cjs"],
            Self::Cpp => &["c", "cc", "cpp", "cxx", "h", "hpp"],
            Self::Php => &["php"],
        }
    }

    /// Directory names that are always ignored for this language, on top of
    /// the default rule that hidden directories (leading `.`) are skipped.
    #[must_use]
    pub const fn ignored_dirnames(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["venv", "__pycache__", "node_modules"],
            Self::Rust => &["target"],
            Self::Go => &["vendor", "node_modules", "dist", "build"],
            Self::TypeScript | Self::JavaScript => &["node_modules", "dist", "build", "coverage"],
            Self::Cpp => &["build", "cmake-build-debug", "cmake-build-release"],
            Self::Php => &["vendor", "node_modules"],
        }
    }

    /// Default command line of the native language server, in stdio mode.
    #[must_use]
    pub fn default_command(self) -> (&'static str, Vec<&'static str>) {
        match self {
            Self::Python => ("pyright-langserver", vec!["--stdio"]),
            Self::Rust => ("rust-analyzer", vec![]),
            Self::Go => ("gopls", vec![]),
            Self::TypeScript | Self::JavaScript => ("typescript-language-server", vec!["--stdio"]),
            Self::Cpp => ("clangd", vec![]),
            Self::Php => ("phpactor", vec!["language-server"]),
        }
    }

    /// Whether a filename looks like a source file of this language.
    #[must_use]
    pub fn is_source_file(self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.source_extensions()
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }

    /// Whether a directory name is always ignored for this language.
    ///
    /// The default condition is a leading `.`; language overlays add
    /// ecosystem-specific entries such as `node_modules` or `vendor`.
    #[must_use]
    pub fn is_ignored_dirname(self, dirname: &str) -> bool {
        dirname.starts_with('.') || self.ignored_dirnames().contains(&dirname)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.language_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_extension_matching() {
        assert!(Language::Python.is_source_file(Path::new("pkg/mod.py")));
        assert!(Language::Python.is_source_file(Path::new("stubs/mod.PYI")));
        assert!(!Language::Python.is_source_file(Path::new("readme.md")));
        assert!(!Language::Python.is_source_file(Path::new("Makefile")));
        assert!(Language::Rust.is_source_file(Path::new("src/lib.rs")));
        assert!(!Language::Rust.is_source_file(Path::new("src/lib.rs.orig")));
    }

    #[test]
    fn ignored_dirnames_include_hidden() {
        assert!(Language::Go.is_ignored_dirname(".git"));
        assert!(Language::Go.is_ignored_dirname("vendor"));
        assert!(Language::Go.is_ignored_dirname("node_modules"));
        assert!(!Language::Go.is_ignored_dirname("cmd"));
        assert!(Language::Rust.is_ignored_dirname("target"));
        assert!(!Language::Python.is_ignored_dirname("src"));
    }

    #[test]
    fn language_id_round_trips_through_serde() {
        let lang: Language = serde_json::from_str("\"python\"").unwrap_or(Language::Rust);
        assert_eq!(lang, Language::Python);
        assert_eq!(
            serde_json::to_string(&Language::TypeScript).ok().as_deref(),
            Some("\"typescript\"")
        );
    }
}
