use anyhow::Context;
use broker_core::JobRecord;
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "broker-cli", version, about = "CLI for the job broker")]
struct Cli {
    #[arg(long, default_value = "http://localhost:7419")]
    server_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping server health endpoint
    Ping,

    /// Push a job
    Push {
        jobtype: String,

        #[arg(long, default_value = "default")]
        queue: String,

        /// JSON arguments, e.g. '[1, "two"]'
        #[arg(long, default_value = "[]")]
        args: String,

        /// Job id; a random UUID when omitted
        #[arg(long)]
        jid: Option<String>,

        /// Run no earlier than this many seconds from now
        #[arg(long)]
        delay_secs: Option<i64>,

        /// Retry limit for this job
        #[arg(long)]
        retry: Option<i64>,
    },

    /// Lease one job and print it
    Fetch {
        /// Queues to try, in order
        #[arg(long = "queue", default_value = "default")]
        queues: Vec<String>,

        #[arg(long)]
        lease_ms: Option<u64>,
    },

    /// Acknowledge a leased job
    Ack { jid: String },

    /// Report a failed attempt
    Fail {
        jid: String,

        #[arg(long, default_value = "Error")]
        errtype: String,

        #[arg(long)]
        message: Option<String>,
    },

    /// Print queue and set sizes
    Stats,
}

#[derive(Serialize)]
struct FetchBody {
    queues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_ms: Option<u64>,
}

#[derive(Serialize)]
struct FailBody {
    errtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

async fn check(r: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
    if !r.status().is_success() {
        let status = r.status();
        let body = r.text().await.unwrap_or_default();
        anyhow::bail!("{what} failed: {} {}", status, body);
    }
    Ok(r)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let base = cli.server_url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Ping => {
            let url = format!("{}/healthz", base);
            let r = reqwest::get(url).await?;
            let text = r.text().await.unwrap_or_default();
            println!("{}", text);
        }

        Commands::Push {
            jobtype,
            queue,
            args,
            jid,
            delay_secs,
            retry,
        } => {
            let args: Value = serde_json::from_str(&args).context("invalid JSON args")?;

            let jid = jid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut job = JobRecord::new(jid.clone(), jobtype, queue);
            job.args = Some(args);
            job.retry = retry;
            job.at = delay_secs.map(|s| Utc::now() + TimeDelta::seconds(s));

            let url = format!("{}/v1/jobs", base);
            let r = client.post(url).json(&job).send().await?;
            check(r, "push").await?;
            println!("{}", jid);
        }

        Commands::Fetch { queues, lease_ms } => {
            let url = format!("{}/v1/fetch", base);
            let r = client
                .post(url)
                .json(&FetchBody { queues, lease_ms })
                .send()
                .await?;
            let r = check(r, "fetch").await?;
            if r.status() == reqwest::StatusCode::NO_CONTENT {
                println!("no jobs");
            } else {
                let body: Value = r.json().await?;
                println!("{}", serde_json::to_string_pretty(&body["job"])?);
            }
        }

        Commands::Ack { jid } => {
            let url = format!("{}/v1/jobs/{}/ack", base, jid);
            check(client.post(url).send().await?, "ack").await?;
        }

        Commands::Fail {
            jid,
            errtype,
            message,
        } => {
            let url = format!("{}/v1/jobs/{}/fail", base, jid);
            let r = client
                .post(url)
                .json(&FailBody { errtype, message })
                .send()
                .await?;
            check(r, "fail").await?;
        }

        Commands::Stats => {
            let url = format!("{}/v1/stats", base);
            let r = check(client.get(url).send().await?, "stats").await?;
            let body: Value = r.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
