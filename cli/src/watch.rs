//! Live observer: prints every push from the dashboard's `/ws` channel

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::messages::Push;

/// `http://host:port` -> `ws://host:port/ws`
pub fn ws_url(base_url: &str) -> Result<String> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("Unsupported URL scheme: {}", other)),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("Cannot use {} with {}", scheme, base_url))?;
    url.set_path("/ws");
    Ok(url.to_string())
}

pub async fn run(base_url: &str, json: bool) -> Result<()> {
    let url = ws_url(base_url)?;
    tracing::info!("Connecting to {}", url);

    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if json {
                    println!("{}", text);
                    continue;
                }
                match serde_json::from_str::<Push>(&text) {
                    Ok(push) => println!("{}", push.summary()),
                    Err(e) => tracing::warn!("Failed to parse push: {} - {}", e, text),
                }
            }
            Ok(Message::Ping(data)) => {
                if write.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    tracing::info!("Disconnected");
    Ok(())
}
