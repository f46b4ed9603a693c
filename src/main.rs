//! Headless Treiber für einen Anruf
//!
//! Verbindet mit der konfigurierten (oder als Argument übergebenen) URL und
//! liest Befehle von stdin: `mute`, `unmute`, `speaker on|off`, `status`,
//! `devices`, `hangup`. Events gehen als JSON-Zeilen nach stdout.

use airing_call_lib::audio::{list_devices, CpalCapture, CpalPlayback};
use airing_call_lib::{init_tracing, AiCallModule, CallConfig, UiEvent};
use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = CallConfig::load().context("Failed to load call config")?;
    let url = match std::env::args().nth(1) {
        Some(url) => url,
        None => config.call_url().context("No call URL available")?,
    };

    let module = AiCallModule::new(config, Arc::new(CpalCapture), Arc::new(CpalPlayback));
    let mut events = module.subscribe();

    let call_id = module.connect(&url).await.context("Failed to start call")?;
    tracing::info!("Call {} running, type 'hangup' to end", call_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if matches!(event, UiEvent::OnCallEnded { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if let Err(e) = handle_command(&module, line.trim()).await {
                        eprintln!("error: {:#}", e);
                    }
                }
                // stdin geschlossen
                None => {
                    stdin_open = false;
                    module.disconnect().await?;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, hanging up");
                module.disconnect().await?;
            }
        }
    }

    Ok(())
}

async fn handle_command(module: &AiCallModule, command: &str) -> anyhow::Result<()> {
    match command {
        "" => {}
        "mute" => module.set_muted(true).await?,
        "unmute" => module.set_muted(false).await?,
        "speaker on" => module.set_speaker(true).await?,
        "speaker off" => module.set_speaker(false).await?,
        "status" => {
            let snapshot = module.snapshot().await;
            println!("{}", serde_json::to_string(&snapshot)?);
        }
        "devices" => {
            let (inputs, outputs) = list_devices().map_err(anyhow::Error::msg)?;
            println!(
                "{}",
                serde_json::json!({ "inputs": inputs, "outputs": outputs })
            );
        }
        "hangup" => {
            module.disconnect().await?;
        }
        other => anyhow::bail!("unknown command '{}'", other),
    }
    Ok(())
}

fn print_event(event: &UiEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("Failed to serialize event: {}", e),
    }
}
