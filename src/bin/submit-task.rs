//! Task Submission Utility
//!
//! Posts one task to a running router and prints the result envelope, or each
//! relayed frame when streaming.
//!
//! ## Usage
//!
//! ```bash
//! # Synchronous run in DEMO mode
//! submit-task --task-type bias_scan --inputs '{"document": "..."}'
//!
//! # LIVE run with an explicit request id
//! submit-task --task-type bias_scan --mode LIVE --request-id audit-2024-001
//!
//! # Stream progress events
//! submit-task --task-type bias_scan --stream
//! ```

use clap::Parser;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::error::Error;
use std::io::Write;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "submit-task",
    about = "Submit a task to a running task router",
    long_about = "Posts one task to a running router and prints the result envelope,\nor each relayed frame when --stream is given."
)]
struct Args {
    /// Task type to run
    #[arg(long, required = true)]
    task_type: String,

    /// Request id (a UUID v4 is generated if not provided)
    #[arg(long)]
    request_id: Option<String>,

    /// DEMO or LIVE
    #[arg(long, default_value = "DEMO")]
    mode: String,

    /// Inputs as a JSON object
    #[arg(long, default_value = "{}")]
    inputs: String,

    /// Stream events instead of waiting for the envelope
    #[arg(long)]
    stream: bool,

    /// Router base URL
    #[arg(long, env = "ROUTER_URL", default_value = "http://localhost:8080")]
    router_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let inputs: Value = serde_json::from_str(&args.inputs)
        .map_err(|e| format!("--inputs is not valid JSON: {e}"))?;
    let request_id = args
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let body = json!({
        "task_type": args.task_type,
        "request_id": request_id,
        "mode": args.mode,
        "inputs": inputs,
    });

    println!("📤 Submitting task");
    println!("   Task type: {}", args.task_type);
    println!("   Request ID: {request_id}");
    println!("   Mode: {}", args.mode);

    let client = reqwest::Client::new();
    let base = args.router_url.trim_end_matches('/');

    if args.stream {
        stream_task(&client, base, &body).await
    } else {
        run_task(&client, base, &body).await
    }
}

async fn run_task(
    client: &reqwest::Client,
    base: &str,
    body: &Value,
) -> Result<(), Box<dyn Error>> {
    let response = client.post(format!("{base}/v1/run")).json(body).send().await?;
    let status = response.status();
    let envelope: Value = response.json().await?;

    let marker = if envelope["ok"] == json!(true) { "✅" } else { "❌" };
    println!("{marker} HTTP {status}");
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

async fn stream_task(
    client: &reqwest::Client,
    base: &str,
    body: &Value,
) -> Result<(), Box<dyn Error>> {
    let response = client
        .post(format!("{base}/v1/run/stream"))
        .json(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let envelope: Value = response.json().await?;
        println!("❌ HTTP {status}");
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    println!("📡 Streaming events");
    let mut stdout = std::io::stdout();
    if !print_frames(response.bytes_stream(), &mut stdout).await? {
        println!("⚠️  Stream ended without a terminal frame");
    }
    Ok(())
}

/// Print each SSE frame of `body`; returns whether a DONE or ERROR frame arrived
async fn print_frames<S, B, E>(body: S, out: &mut impl Write) -> Result<bool, Box<dyn Error>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Error + Send + Sync + 'static,
{
    let mut events = std::pin::pin!(body.eventsource());

    while let Some(event) = events.next().await {
        let event = event?;
        if event.data.is_empty() {
            continue;
        }

        let frame: Value = serde_json::from_str(&event.data)?;
        writeln!(
            out,
            "   [{}] {} {}",
            frame["sequence"], frame["kind"], frame["payload"]
        )?;

        if frame["kind"] == "DONE" || frame["kind"] == "ERROR" {
            return Ok(true);
        }
    }

    Ok(false)
}
