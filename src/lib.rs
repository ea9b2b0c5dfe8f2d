// SPDX-License-Identifier: GPL-3.0-or-later

//! unilsp is a language-agnostic code intelligence facade over the
//! Language Server Protocol.
//!
//! Given a repository root and a target language it spawns the native
//! language server as a child process, speaks LSP 3.17 over its standard
//! streams, and exposes repository-relative views of definitions,
//! references, hovers, completions and symbol trees, with ignore-aware
//! filtering, reference-counted document buffers and a content-hash-keyed
//! symbol cache persisted under the repository.
//!
//! The async core lives in [`server::LanguageServer`]; blocking callers use
//! [`sync::SyncLanguageServer`], which owns a dedicated background runtime
//! and marshals every call onto it.

/// Persistent content-hash-keyed symbol cache.
pub mod cache;
/// Facade configuration.
pub mod config;
/// Reference-counted document buffer registry and text edits.
pub mod documents;
/// Error taxonomy.
pub mod error;
/// Ignore-aware path classification.
pub mod ignore_rules;
/// Supported languages and their server defaults.
pub mod language;
/// Child-process JSON-RPC transport and staged shutdown.
pub mod lsp;
/// URI and path mapping with caching.
pub mod paths;
/// The asynchronous facade.
pub mod server;
/// The blocking facade with its dedicated background loop.
pub mod sync;
/// The unified symbol model.
pub mod symbols;

pub use config::LspConfig;
pub use error::{Error, Result};
pub use language::Language;
pub use server::LanguageServer;
pub use sync::SyncLanguageServer;
