// SPDX-License-Identifier: GPL-3.0-or-later

//! Integration tests for the low-level LSP client, driven against the
//! bundled `mockls` server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use unilsp::lsp::LspClient;

fn mockls() -> String {
    env!("CARGO_BIN_EXE_mockls").to_string()
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn spawn_mockls(dir: &TempDir, extra_args: &[&str]) -> Result<LspClient> {
    init_tracing();
    let args: Vec<String> = extra_args.iter().map(|s| (*s).to_string()).collect();
    Ok(LspClient::spawn(&mockls(), &args, dir.path(), false, false)?)
}

fn initialize_params(dir: &TempDir) -> lsp_types::InitializeParams {
    let uri = format!("file://{}", dir.path().display());
    lsp_types::InitializeParams {
        process_id: Some(std::process::id()),
        workspace_folders: uri.parse().ok().map(|uri| {
            vec![lsp_types::WorkspaceFolder {
                uri,
                name: "workspace".to_string(),
            }]
        }),
        ..Default::default()
    }
}

fn did_open(uri: &str, text: &str) -> Result<lsp_types::DidOpenTextDocumentParams> {
    Ok(lsp_types::DidOpenTextDocumentParams {
        text_document: lsp_types::TextDocumentItem {
            uri: uri.parse().map_err(|e| anyhow::anyhow!("bad uri: {e}"))?,
            language_id: "python".to_string(),
            version: 0,
            text: text.to_string(),
        },
    })
}

#[tokio::test]
async fn initialize_handshake_reports_capabilities() -> Result<()> {
    let dir = TempDir::new()?;
    let client = spawn_mockls(&dir, &[])?;

    let result = client.initialize(initialize_params(&dir)).await?;
    assert!(result.capabilities.definition_provider.is_some());
    assert!(result.capabilities.completion_provider.is_some());
    assert!(result.capabilities.text_document_sync.is_some());

    client.shutdown(Duration::from_secs(5)).await;
    assert!(!client.is_running());
    Ok(())
}

#[tokio::test]
async fn hover_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let client = spawn_mockls(&dir, &["--no-diagnostics"])?;
    client.initialize(initialize_params(&dir)).await?;
    client.initialized().await?;

    let uri = format!("file://{}/t.py", dir.path().display());
    client.did_open(did_open(&uri, "def f():\n    pass\n")?).await?;

    let hover = client
        .hover(lsp_types::HoverParams {
            text_document_position_params: lsp_types::TextDocumentPositionParams {
                text_document: lsp_types::TextDocumentIdentifier {
                    uri: uri.parse().map_err(|e| anyhow::anyhow!("bad uri: {e}"))?,
                },
                position: lsp_types::Position::new(0, 4),
            },
            work_done_progress_params: lsp_types::WorkDoneProgressParams::default(),
        })
        .await?;
    assert!(hover.is_some(), "expected hover content for 'f'");

    client.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test]
async fn protocol_error_is_typed() -> Result<()> {
    let dir = TempDir::new()?;
    let client = spawn_mockls(&dir, &["--no-diagnostics", "--fail-on", "textDocument/hover"])?;
    client.initialize(initialize_params(&dir)).await?;

    let uri = format!("file://{}/t.py", dir.path().display());
    client.did_open(did_open(&uri, "x = 1\n")?).await?;

    let outcome = client
        .hover(lsp_types::HoverParams {
            text_document_position_params: lsp_types::TextDocumentPositionParams {
                text_document: lsp_types::TextDocumentIdentifier {
                    uri: uri.parse().map_err(|e| anyhow::anyhow!("bad uri: {e}"))?,
                },
                position: lsp_types::Position::new(0, 0),
            },
            work_done_progress_params: lsp_types::WorkDoneProgressParams::default(),
        })
        .await;
    assert!(
        matches!(outcome, Err(unilsp::Error::Protocol { code: -32603, .. })),
        "expected a typed protocol error, got {outcome:?}"
    );

    client.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test]
async fn server_exit_fails_pending_requests() -> Result<()> {
    let dir = TempDir::new()?;
    // One response allowed: initialize. The next request hits a dead server.
    let client = spawn_mockls(&dir, &["--no-diagnostics", "--drop-after", "1"])?;
    client.initialize(initialize_params(&dir)).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome: unilsp::Result<serde_json::Value> =
        client.request("workspace/symbol", serde_json::json!({ "query": "" })).await;
    assert!(
        matches!(outcome, Err(unilsp::Error::Transport(_))),
        "expected a transport error, got {outcome:?}"
    );

    client.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test]
async fn shutdown_resolves_hanging_request() -> Result<()> {
    let dir = TempDir::new()?;
    let client = Arc::new(spawn_mockls(
        &dir,
        &["--no-diagnostics", "--hang-on", "workspace/symbol"],
    )?);
    client.initialize(initialize_params(&dir)).await?;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            let outcome: unilsp::Result<serde_json::Value> = client
                .request("workspace/symbol", serde_json::json!({ "query": "anything" }))
                .await;
            outcome
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.shutdown(Duration::from_secs(5)).await;

    let outcome = pending.await?;
    assert!(
        outcome.is_err(),
        "hanging request must resolve with an error on shutdown"
    );
    assert!(!client.is_running());
    Ok(())
}

#[tokio::test]
async fn shutdown_twice_is_harmless() -> Result<()> {
    let dir = TempDir::new()?;
    let client = spawn_mockls(&dir, &["--no-diagnostics"])?;
    client.initialize(initialize_params(&dir)).await?;

    client.shutdown(Duration::from_secs(5)).await;
    client.shutdown(Duration::from_secs(5)).await;
    assert!(!client.is_running());
    Ok(())
}

#[tokio::test]
async fn notification_handler_receives_diagnostics() -> Result<()> {
    let dir = TempDir::new()?;
    let client = spawn_mockls(&dir, &[])?;

    let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    client.on_notification(
        "textDocument/publishDiagnostics",
        Box::new(move |params| {
            if let Ok(mut held) = sink.lock() {
                held.push(params);
            }
        }),
    );

    client.initialize(initialize_params(&dir)).await?;
    let uri = format!("file://{}/t.py", dir.path().display());
    client.did_open(did_open(&uri, "x = 1\n")?).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    {
        let held = received.lock().map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(held.len(), 1, "expected one publishDiagnostics");
        assert_eq!(held[0]["uri"], serde_json::json!(uri));
    }

    client.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test]
async fn server_request_dispatched_to_handler() -> Result<()> {
    let dir = TempDir::new()?;
    let client = spawn_mockls(&dir, &["--no-diagnostics", "--send-configuration-request"])?;

    let invoked = Arc::new(Mutex::new(false));
    let flag = invoked.clone();
    client.on_request(
        "workspace/configuration",
        Box::new(move |_| {
            if let Ok(mut held) = flag.lock() {
                *held = true;
            }
            Ok(serde_json::json!([null]))
        }),
    );

    client.initialize(initialize_params(&dir)).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(*invoked.lock().map_err(|e| anyhow::anyhow!("{e}"))?);

    client.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test]
async fn request_counter_tracks_wire_traffic() -> Result<()> {
    let dir = TempDir::new()?;
    let client = spawn_mockls(&dir, &["--no-diagnostics"])?;
    assert_eq!(client.requests_sent(), 0);

    client.initialize(initialize_params(&dir)).await?;
    assert_eq!(client.requests_sent(), 1);

    // Notifications are not requests.
    client.initialized().await?;
    assert_eq!(client.requests_sent(), 1);

    client.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
