//! stdin hook payload -> `POST /hooks/{event}`
//!
//! The relay runs inside the host's hook pipeline, so it never fails the
//! caller: a missing server, a slow stdin or a bad payload is logged and the
//! process still exits cleanly.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub const STDIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Event name: the explicit override, else the host's `hook_event_name`
pub fn resolve_event(event: Option<&str>, body: &Value) -> Option<String> {
    event
        .map(str::to_string)
        .or_else(|| {
            ["hook_event_name", "hookEventName", "event"]
                .iter()
                .find_map(|key| body.get(key).and_then(Value::as_str).map(str::to_string))
        })
        .filter(|name| !name.trim().is_empty())
}

/// Parse stdin; anything that is not a JSON object is wrapped rather than dropped
pub fn parse_payload(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => json!({ "value": other }),
        Err(e) => {
            tracing::warn!("stdin is not JSON ({}), forwarding as text", e);
            json!({ "raw": raw })
        }
    }
}

async fn read_stdin(timeout: Duration) -> String {
    let mut raw = String::new();
    match tokio::time::timeout(timeout, tokio::io::stdin().read_to_string(&mut raw)).await {
        Ok(Ok(_)) => raw,
        Ok(Err(e)) => {
            tracing::warn!("Failed to read stdin: {}", e);
            String::new()
        }
        Err(_) => {
            tracing::warn!("Timed out waiting for stdin");
            raw
        }
    }
}

/// Send one event and return the server's JSON reply, if any
pub async fn deliver(
    client: &reqwest::Client,
    base_url: &str,
    event: &str,
    body: &Value,
) -> Result<Option<Value>> {
    let url = format!("{}/hooks/{}", base_url.trim_end_matches('/'), event);
    let response = client
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("POST {}", url))?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("{} rejected {}: {} {}", url, event, status, text);
    }
    if text.trim().is_empty() {
        return Ok(None);
    }
    Ok(serde_json::from_str(&text).ok())
}

/// Text to hand back to the hook host. An empty object means "nothing to say".
pub fn host_output(reply: Option<Value>) -> Option<String> {
    match reply? {
        Value::Object(map) if map.is_empty() => None,
        Value::Null => None,
        reply => Some(reply.to_string()),
    }
}

pub async fn run(base_url: &str, event: Option<&str>, quiet: bool) -> Result<()> {
    let raw = read_stdin(STDIN_TIMEOUT).await;
    let body = parse_payload(&raw);

    let Some(event) = resolve_event(event, &body) else {
        tracing::warn!("No event name given and none found in payload, nothing sent");
        return Ok(());
    };

    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    match deliver(&client, base_url, &event, &body).await {
        Ok(reply) => {
            tracing::debug!(%event, "event delivered");
            if let Some(output) = host_output(reply).filter(|_| !quiet) {
                println!("{}", output);
            }
        }
        Err(e) => tracing::warn!(%event, "Failed to deliver event: {:#}", e),
    }

    Ok(())
}
