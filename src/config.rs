// SPDX-License-Identifier: GPL-3.0-or-later

//! Facade configuration.

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::language::Language;

/// Configuration for a [`crate::server::LanguageServer`] instance.
#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    /// The language whose server should be spawned.
    pub code_language: Language,

    /// Gitignore-style patterns for paths the facade must never surface.
    /// Backslashes are normalized to forward slashes before compilation.
    #[serde(default)]
    pub ignored_paths: Vec<String>,

    /// Log every JSON-RPC payload exchanged with the server.
    #[serde(default)]
    pub trace_lsp_communication: bool,

    /// Place the child in its own process group so it survives signals
    /// delivered to the parent's group.
    #[serde(default = "default_true")]
    pub start_independent_lsp_process: bool,

    /// Inline gitignore content. When set, `<repo>/.gitignore` is not read.
    #[serde(default)]
    pub gitignore_file_content: Option<String>,

    /// Override for the server command line (defaults per language).
    #[serde(default)]
    pub server: Option<ServerOverride>,

    /// Wall-clock budget applied per call by the sync facade. `None` means
    /// no timeout.
    #[serde(default, with = "opt_secs")]
    pub request_timeout: Option<Duration>,
}

/// Replacement for the built-in server command of a language.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerOverride {
    /// The command to execute (e.g., "pyright-langserver").
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Initialization options forwarded verbatim in `initialize`.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

const fn default_true() -> bool {
    true
}

/// Serde helper: optional timeout expressed as seconds in config sources.
mod opt_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

impl LspConfig {
    /// Minimal configuration for the given language, everything else at
    /// defaults.
    #[must_use]
    pub const fn new(code_language: Language) -> Self {
        Self {
            code_language,
            ignored_paths: Vec::new(),
            trace_lsp_communication: false,
            start_independent_lsp_process: true,
            gitignore_file_content: None,
            server: None,
            request_timeout: None,
        }
    }

    /// Load configuration from an optional TOML file and the environment.
    ///
    /// Later sources win: defaults, then the explicit file, then
    /// `UNILSP_*` environment variables (e.g. `UNILSP_CODE_LANGUAGE=rust`).
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the merged values do
    /// not deserialize into a valid configuration.
    pub fn load(explicit_file: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("trace_lsp_communication", false)?
            .set_default("start_independent_lsp_process", true)?;

        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("UNILSP"));

        let config = builder.build().context("Failed to build configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// The server command line: the override when present, otherwise the
    /// language default.
    #[must_use]
    pub fn server_command(&self) -> (String, Vec<String>) {
        if let Some(server) = &self.server {
            (server.command.clone(), server.args.clone())
        } else {
            let (program, args) = self.code_language.default_command();
            (
                program.to_string(),
                args.into_iter().map(str::to_string).collect(),
            )
        }
    }

    /// Initialization options from the override, if any.
    #[must_use]
    pub fn initialization_options(&self) -> Option<serde_json::Value> {
        self.server
            .as_ref()
            .and_then(|s| s.initialization_options.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;

    #[test]
    fn defaults_for_minimal_config() {
        let config = LspConfig::new(Language::Rust);
        assert!(config.start_independent_lsp_process);
        assert!(!config.trace_lsp_communication);
        assert!(config.ignored_paths.is_empty());
        assert_eq!(config.server_command().0, "rust-analyzer");
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn override_replaces_language_default() {
        let config = LspConfig {
            server: Some(ServerOverride {
                command: "my-analyzer".to_string(),
                args: vec!["--stdio".to_string()],
                initialization_options: None,
            }),
            ..LspConfig::new(Language::Python)
        };
        let (program, args) = config.server_command();
        assert_eq!(program, "my-analyzer");
        assert_eq!(args, vec!["--stdio".to_string()]);
    }

    #[test]
    fn load_from_toml_file() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            "code_language = \"python\"\nignored_paths = [\"build/**\"]\nrequest_timeout = 2.5\n"
        )?;

        let config = LspConfig::load(Some(file.path().to_path_buf()))?;
        assert_eq!(config.code_language, Language::Python);
        assert_eq!(config.ignored_paths, vec!["build/**".to_string()]);
        assert_eq!(config.request_timeout, Some(Duration::from_secs_f64(2.5)));
        Ok(())
    }
}
