//! Command-line client for the demo tool server.
//!
//! Run with: cargo run -p test-client -- http://localhost:3000
//!
//! Opens `/sse`, waits for the endpoint announcement, then posts
//! `initialize`, `notifications/initialized`, `tools/list` and an
//! `echo` tool call, printing every stream message it receives.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use eventsource_stream::{Event, Eventsource};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "test-client", about = "Exercise a session relay server over SSE")]
struct Cli {
    /// Server origin. `https://` is assumed when no scheme is given.
    #[arg(default_value = "http://localhost:3000")]
    origin: String,

    /// Message sent through the echo tool.
    #[arg(long, default_value = "hello from the test client")]
    message: String,

    /// Seconds to wait for each stream event.
    #[arg(long, default_value_t = 15)]
    wait: u64,
}

fn normalize_origin(origin: &str) -> String {
    let origin = origin.trim_end_matches('/');
    if origin.starts_with("http://") || origin.starts_with("https://") {
        origin.to_string()
    } else {
        format!("https://{origin}")
    }
}

/// Wait for the next stream event with the given name.
async fn next_event<S, E>(events: &mut S, name: &str, wait: Duration) -> anyhow::Result<Event>
where
    S: Stream<Item = Result<Event, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let event = tokio::time::timeout(wait, events.next())
            .await
            .with_context(|| format!("No '{name}' event within {}s", wait.as_secs()))?
            .ok_or_else(|| anyhow!("Stream closed by server"))?
            .map_err(|e| anyhow!("Stream error: {e}"))?;
        if event.event == name {
            return Ok(event);
        }
        tracing::debug!(event = %event.event, "Skipping stream event");
    }
}

struct Session {
    http: reqwest::Client,
    endpoint: String,
    wait: Duration,
}

impl Session {
    /// POST one JSON-RPC message and return the HTTP status.
    async fn post(&self, message: &Value) -> anyhow::Result<reqwest::StatusCode> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .context("POST failed")?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        println!("POST {} -> {status} {body}", message["method"]);
        if !status.is_success() {
            bail!("Server rejected {}: {status} {body}", message["method"]);
        }
        Ok(status)
    }

    /// POST a request and wait for its reply on the stream.
    async fn call<S, E>(&self, events: &mut S, message: Value) -> anyhow::Result<Value>
    where
        S: Stream<Item = Result<Event, E>> + Unpin,
        E: std::fmt::Display,
    {
        self.post(&message).await?;
        loop {
            let event = next_event(events, "message", self.wait).await?;
            let reply: Value = serde_json::from_str(&event.data).context("Invalid JSON on stream")?;
            println!("<- {reply}");
            if reply["id"] == message["id"] {
                return Ok(reply);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let origin = normalize_origin(&cli.origin);
    let wait = Duration::from_secs(cli.wait);
    let http = reqwest::Client::new();

    let response = http
        .get(format!("{origin}/sse"))
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .with_context(|| format!("Failed to connect to {origin}"))?
        .error_for_status()?;
    let mut events = Box::pin(response.bytes_stream().eventsource());

    let endpoint = next_event(&mut events, "endpoint", wait).await?.data;
    println!("Connected, posting to {endpoint}");
    let session = Session {
        http,
        endpoint: format!("{origin}{endpoint}"),
        wait,
    };

    let init = session
        .call(
            &mut events,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "test-client", "version": env!("CARGO_PKG_VERSION") },
                },
            }),
        )
        .await?;
    println!("Server info: {}", init["result"]["serverInfo"]);

    session
        .post(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
        .await?;

    let tools = session
        .call(
            &mut events,
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        )
        .await?;
    let names: Vec<&str> = tools["result"]["tools"]
        .as_array()
        .map(|tools| tools.iter().filter_map(|t| t["name"].as_str()).collect())
        .unwrap_or_default();
    println!("Tools: {}", names.join(", "));

    let echoed = session
        .call(
            &mut events,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "echo", "arguments": { "message": cli.message } },
            }),
        )
        .await?;
    println!("Echoed: {}", echoed["result"]["content"][0]["text"]);

    Ok(())
}
