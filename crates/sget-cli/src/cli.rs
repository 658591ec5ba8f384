use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sget_core::audit;
use sget_core::config::SgetConfig;
use sget_core::download::Downloader;
use sget_core::logging;
use sget_core::request::Credentials;

/// sget: segmented, resumable HTTP downloader.
#[derive(Debug, Parser)]
#[command(name = "sget")]
#[command(about = "Segmented, resumable HTTP downloader", long_about = None)]
pub struct Cli {
    /// URL to download.
    pub url: String,

    /// Output file (derived from the URL path when omitted).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of parallel connections.
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Resume a partial download (`--continue=false` starts over).
    #[arg(
        short = 'c',
        long = "continue",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub continue_download: bool,

    /// Basic-auth user name.
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Basic-auth password.
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Instead of downloading, hash-audit the file in windows of this size
    /// (power of two; accepts K/M/G suffixes, e.g. "4M").
    #[arg(long, value_name = "LEN")]
    pub audit: Option<String>,

    /// Byte offset the audit starts from (accepts K/M/G suffixes).
    #[arg(long, value_name = "OFF", default_value = "0")]
    pub audit_start: String,

    /// Verbose logging.
    #[arg(long)]
    pub debug: bool,
}

pub async fn run_from_args() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.debug);

    let mut cfg = SgetConfig::load_or_create()?;
    if let Some(n) = cli.connections {
        cfg.thread_count = n.max(1);
    }
    tracing::debug!("config: {:?}", cfg);

    let auth = match (&cli.username, &cli.password) {
        (None, None) => None,
        (user, pass) => Some(Credentials {
            username: user.clone().unwrap_or_default(),
            password: pass.clone().unwrap_or_default(),
        }),
    };
    let downloader = Downloader::new(&cfg).with_auth(auth);

    match &cli.audit {
        Some(len) => {
            let max_len = parse_size(len).context("invalid --audit length")?;
            let start = parse_size(&cli.audit_start).context("invalid --audit-start offset")?;
            let output = match &cli.output {
                Some(path) => path.clone(),
                None => PathBuf::from(sget_core::url_model::derive_filename(&cli.url)),
            };
            let interrupt = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&interrupt);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    flag.store(true, Ordering::Relaxed);
                }
            });
            let request = downloader.request(&cli.url);
            let report = audit::audit_output(
                &request,
                &output,
                downloader.min_chunk(),
                max_len,
                start,
                interrupt,
            )
            .await?;
            if report.reopened.is_empty() {
                println!("audit clean ({} windows)", report.windows_checked);
            } else {
                for (begin, end) in &report.reopened {
                    println!("corrupt: bytes {}-{}", begin, end);
                }
                println!(
                    "{} range(s) queued for re-download; run sget again to repair",
                    report.reopened.len()
                );
            }
            Ok(())
        }
        None => {
            downloader
                .download(&cli.url, cli.output.as_deref(), cli.continue_download)
                .await
        }
    }
}

/// Parse a byte count with an optional K/M/G/T suffix (binary units).
fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let mult: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                other => anyhow::bail!("unknown size suffix {:?}", other),
            };
            (&text[..i], mult)
        }
        _ => (text, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size {:?}", text))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("size {:?} overflows", text))
}
