//! # qr-cli — Thin client for the QUARRY gateway
//!
//! - `qr query <pipeline>...` — submit one or more pipelines and print the reply.
//! - `qr watch <pipeline>` — re-poll with the last delta tag and print changes.
//! - `qr status` — gateway status.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "qr", version, about = "QUARRY gateway client")]
struct Cli {
    /// Gateway base URL (or QR_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one or more query pipelines.
    Query {
        /// Pipelines like docs.users.find(id,1).collects(name)
        queries: Vec<String>,

        /// Request correlation id (defaults to a fresh uuid)
        #[arg(long)]
        rid: Option<String>,

        /// Ask the gateway for diff metadata
        #[arg(long)]
        diffs: bool,

        /// Last diff tag seen
        #[arg(long)]
        diff_tag: Option<String>,

        /// Restrict reported deltas to these record keys
        #[arg(long)]
        watch: Vec<String>,

        /// Skip the JSON-shape envelope
        #[arg(long)]
        no_json: bool,
    },

    /// Poll a pipeline, following its deltas.
    Watch {
        query: String,

        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },

    /// Gateway status.
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let base_url = cli
        .base_url
        .or_else(|| std::env::var("QR_BASE_URL").ok())
        .unwrap_or_else(|| "http://127.0.0.1:3300".to_string());
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Query {
            queries,
            rid,
            diffs,
            diff_tag,
            watch,
            no_json,
        } => {
            if queries.is_empty() {
                eprintln!("nothing to send: pass at least one pipeline");
                std::process::exit(2);
            }

            let payload = serde_json::json!({
                "request_id": rid.unwrap_or_else(|| uuid::Uuid::new_v4().as_simple().to_string()),
                "queries": queries,
                "diffs": diffs,
                "diff_tag": diff_tag.unwrap_or_default(),
                "diff_watch": watch,
                "no_json": no_json,
            });

            match post_query(&client, &base_url, &payload).await {
                Ok(body) => println!("{}", serde_json::to_string_pretty(&body).unwrap()),
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Watch { query, interval_ms } => {
            let rid = uuid::Uuid::new_v4().as_simple().to_string();
            let mut last_tag = String::new();

            loop {
                let payload = serde_json::json!({
                    "request_id": rid,
                    "queries": [query],
                    "diffs": true,
                    "diff_tag": last_tag,
                });

                match post_query(&client, &base_url, &payload).await {
                    Ok(body) => {
                        let deltas = body
                            .get("deltas")
                            .and_then(|d| d.as_array())
                            .map(|d| d.len())
                            .unwrap_or(0);
                        let fresh = last_tag.is_empty() || deltas > 0;

                        if let Some(tag) = body.get("delta_id").and_then(|t| t.as_str()) {
                            last_tag = tag.to_string();
                        }

                        if fresh {
                            println!("{}", serde_json::to_string(&body).unwrap());
                        }
                    }
                    Err(e) => eprintln!("error: {e}"),
                }

                tokio::time::sleep(tokio::time::Duration::from_millis(interval_ms)).await;
            }
        }

        Commands::Status => {
            let url = format!("{base_url}/api/status");
            match client.get(&url).send().await {
                Ok(resp) => match resp.json::<serde_json::Value>().await {
                    Ok(json) => println!("{}", serde_json::to_string_pretty(&json).unwrap()),
                    Err(e) => eprintln!("error: malformed status body: {e}"),
                },
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn post_query(
    client: &reqwest::Client,
    base_url: &str,
    payload: &serde_json::Value,
) -> Result<serde_json::Value, String> {
    let url = format!("{base_url}/query");
    let resp = client
        .post(&url)
        .json(payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    resp.json::<serde_json::Value>().await.map_err(|e| e.to_string())
}
