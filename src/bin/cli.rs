//! CLI for cluster operations

use clap::{Parser, Subcommand};
use herd::common::{encode_key, format_bytes, parse_duration};

#[derive(Parser)]
#[command(name = "herd")]
#[command(about = "herd cluster CLI")]
#[command(version)]
struct Cli {
    /// Gateway URL (any node)
    #[arg(long, default_value = "http://localhost:8000")]
    gateway: String,

    /// Request timeout (e.g. 5s, 500ms)
    #[arg(long, default_value = "10s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put a value
    Put {
        key: String,

        /// Value literal
        #[arg(long, conflicts_with = "file")]
        value: Option<String>,

        /// Read the value from a file
        #[arg(long)]
        file: Option<std::path::PathBuf>,
    },

    /// Get a value
    Get {
        key: String,

        /// Write the value to a file instead of stdout
        #[arg(long)]
        output: Option<std::path::PathBuf>,
    },

    /// Delete a key
    Delete { key: String },

    /// Scan a key range
    Scan {
        #[arg(long, default_value = "")]
        start: String,

        #[arg(long, default_value = "")]
        end: String,

        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Show node status (roles, epoch, sync sessions)
    Status,

    /// List cluster members and their liveness state
    Members,

    /// Show the partition map
    Partitions,

    /// Remove a node from all replica sets
    RemoveNode { node: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let timeout = parse_duration(&cli.timeout).map_err(|e| anyhow::anyhow!("{}", e))?;
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let base = cli.gateway.trim_end_matches('/');

    match cli.command {
        Commands::Put { key, value, file } => {
            let body = match (value, file) {
                (Some(v), None) => v.into_bytes(),
                (None, Some(path)) => std::fs::read(path)?,
                _ => anyhow::bail!("provide exactly one of --value or --file"),
            };
            let size = body.len() as u64;
            let url = format!("{}/kv/{}", base, encode_key(&key));
            let resp = client.put(&url).body(body).send().await?;
            if resp.status().is_success() {
                let json: serde_json::Value = resp.json().await?;
                println!(
                    "OK {} ({}) at offset {}",
                    key,
                    format_bytes(size),
                    json["offset"]
                );
            } else {
                anyhow::bail!("put failed: {} {}", resp.status(), resp.text().await?);
            }
        }

        Commands::Get { key, output } => {
            let url = format!("{}/kv/{}", base, encode_key(&key));
            let resp = client.get(&url).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                anyhow::bail!("key not found: {}", key);
            }
            if !resp.status().is_success() {
                anyhow::bail!("get failed: {} {}", resp.status(), resp.text().await?);
            }
            let bytes = resp.bytes().await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes)?;
                    println!("wrote {} to {}", format_bytes(bytes.len() as u64), path.display());
                }
                None => match std::str::from_utf8(&bytes) {
                    Ok(s) => println!("{}", s),
                    Err(_) => println!("{}", hex::encode(&bytes)),
                },
            }
        }

        Commands::Delete { key } => {
            let url = format!("{}/kv/{}", base, encode_key(&key));
            let resp = client.delete(&url).send().await?;
            if resp.status().is_success() {
                println!("deleted {}", key);
            } else {
                anyhow::bail!("delete failed: {} {}", resp.status(), resp.text().await?);
            }
        }

        Commands::Scan { start, end, limit } => {
            let url = format!(
                "{}/kv?start={}&end={}&limit={}",
                base,
                encode_key(&start),
                encode_key(&end),
                limit
            );
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                anyhow::bail!("scan failed: {} {}", resp.status(), resp.text().await?);
            }
            let json: serde_json::Value = resp.json().await?;
            if let Some(entries) = json["entries"].as_array() {
                for e in entries {
                    println!("{}\t{}", e["key"].as_str().unwrap_or(""), e["value"]);
                }
                println!("({} entries)", entries.len());
            }
        }

        Commands::Status => {
            let resp = client.get(format!("{}/status", base)).send().await?;
            let json: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }

        Commands::Members => {
            let resp = client.get(format!("{}/admin/members", base)).send().await?;
            let json: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }

        Commands::Partitions => {
            let resp = client
                .get(format!("{}/admin/partitions", base))
                .send()
                .await?;
            let json: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }

        Commands::RemoveNode { node } => {
            let resp = client
                .post(format!("{}/admin/remove/{}", base, node))
                .send()
                .await?;
            if resp.status().is_success() {
                let json: serde_json::Value = resp.json().await?;
                println!("removed {} (epoch {})", node, json["epoch"]);
            } else {
                anyhow::bail!("remove failed: {} {}", resp.status(), resp.text().await?);
            }
        }
    }

    Ok(())
}
