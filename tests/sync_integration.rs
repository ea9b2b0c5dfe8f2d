// SPDX-License-Identifier: GPL-3.0-or-later

//! Tests for the blocking facade: marshalling onto the background loop,
//! per-call timeouts, idempotent shutdown and scoped file handles.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use unilsp::config::ServerOverride;
use unilsp::{Language, LspConfig, SyncLanguageServer};

fn mockls_config(extra_args: &[&str]) -> LspConfig {
    let mut config = LspConfig::new(Language::Python);
    config.server = Some(ServerOverride {
        command: env!("CARGO_BIN_EXE_mockls").to_string(),
        args: extra_args.iter().map(|s| (*s).to_string()).collect(),
        initialization_options: None,
    });
    config
}

fn write(root: &Path, rel: &str, contents: &str) -> Result<()> {
    init_tracing();
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

#[test]
fn blocking_definition_round_trip() -> Result<()> {
    let repo = TempDir::new()?;
    write(repo.path(), "a.py", "def f():\n    return 1\n")?;
    write(repo.path(), "b.py", "from a import f\nf()\n")?;

    let server = SyncLanguageServer::create(mockls_config(&["--no-diagnostics"]), repo.path())?;
    server.start()?;
    assert!(server.is_running());

    let definitions = server.request_definition("b.py", 1, 0)?;
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].relative_path.as_deref(), Some("a.py"));

    server.stop();
    assert!(!server.is_running());
    Ok(())
}

#[test]
fn per_call_timeout_is_typed() -> Result<()> {
    let repo = TempDir::new()?;
    write(repo.path(), "a.py", "x = 1\n")?;

    let mut config = mockls_config(&["--no-diagnostics", "--hang-on", "textDocument/hover"]);
    config.request_timeout = Some(Duration::from_millis(300));
    let server = SyncLanguageServer::create(config, repo.path())?;
    server.start()?;

    let outcome = server.request_hover("a.py", 0, 0);
    assert!(
        matches!(outcome, Err(unilsp::Error::Timeout(_))),
        "expected a timeout, got {outcome:?}"
    );

    // The facade stays usable after an abandoned call.
    let symbols = server.request_document_symbols("a.py", false)?;
    assert_eq!(symbols.flat_symbols().len(), 1);

    server.stop();
    Ok(())
}

#[test]
fn stop_is_idempotent() -> Result<()> {
    let repo = TempDir::new()?;
    write(repo.path(), "a.py", "x = 1\n")?;

    let server = SyncLanguageServer::create(mockls_config(&["--no-diagnostics"]), repo.path())?;
    server.start()?;

    server.stop();
    server.stop();
    assert!(!server.is_running());

    // Calls after stop fail fast instead of hanging.
    let outcome = server.request_definition("a.py", 0, 0);
    assert!(outcome.is_err());
    Ok(())
}

#[test]
fn stop_before_start_is_harmless() -> Result<()> {
    let repo = TempDir::new()?;
    let server = SyncLanguageServer::create(mockls_config(&[]), repo.path())?;
    server.stop();
    server.stop();
    assert!(!server.is_running());
    Ok(())
}

#[test]
fn stop_during_pending_request_resolves_it() -> Result<()> {
    let repo = TempDir::new()?;
    write(repo.path(), "a.py", "def f():\n    pass\n")?;

    let server = std::sync::Arc::new(SyncLanguageServer::create(
        mockls_config(&["--no-diagnostics", "--hang-on", "workspace/symbol"]),
        repo.path(),
    )?);
    server.start()?;

    let worker = {
        let server = server.clone();
        std::thread::spawn(move || server.request_workspace_symbol("anything"))
    };
    std::thread::sleep(Duration::from_millis(200));

    server.stop_with_timeout(Duration::from_secs(3));

    let outcome = worker
        .join()
        .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
    assert!(
        outcome.is_err(),
        "pending request must resolve with an error on stop"
    );
    assert!(!server.is_running());
    Ok(())
}

#[test]
fn open_file_guard_refcounts() -> Result<()> {
    let repo = TempDir::new()?;
    let original = "def f():\n    pass\n";
    write(repo.path(), "a.py", original)?;

    let server = SyncLanguageServer::create(mockls_config(&["--no-diagnostics"]), repo.path())?;
    server.start()?;

    {
        let _outer = server.open_file("a.py")?;
        {
            let _inner = server.open_file("a.py")?;
            // Edits require an open buffer; nested scopes share it.
            let cursor = server.insert_text_at_position("a.py", 1, 4, "x = 1\n    ")?;
            server.delete_text_between_positions(
                "a.py",
                lsp_types::Position::new(1, 4),
                cursor,
            )?;
        }
        // Still open through the outer scope.
        assert_eq!(server.retrieve_full_file_content("a.py")?, original);
    }

    // All scopes released: the buffer is gone, so edits fail.
    let outcome = server.insert_text_at_position("a.py", 0, 0, "pad");
    assert!(
        matches!(outcome, Err(unilsp::Error::FileNotFound(_))),
        "buffer must be absent after the last scope closes, got {outcome:?}"
    );

    server.stop();
    Ok(())
}

#[test]
fn sync_mirrors_cover_symbols_and_overviews() -> Result<()> {
    let repo = TempDir::new()?;
    write(
        repo.path(),
        "m.py",
        "class C:\n    def m(self):\n        pass\n",
    )?;

    let server = SyncLanguageServer::create(mockls_config(&["--no-diagnostics"]), repo.path())?;
    server.start()?;

    let containing = server.request_containing_symbol("m.py", 1, Some(4), false, false)?;
    assert_eq!(containing.map(|s| s.name), Some("m".to_string()));

    let tree = server.request_full_symbol_tree(None, false)?;
    assert!(!tree.is_empty());

    let overview = server.request_document_overview("m.py")?;
    assert_eq!(overview.len(), 1);

    let files = server.request_parsed_files()?;
    assert_eq!(files, vec!["m.py".to_string()]);

    server.stop();
    Ok(())
}
