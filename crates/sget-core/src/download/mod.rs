//! Download coordinator: probe the server, pick the engine, drive it.
//!
//! Range-capable servers get the segmented reactor (N parallel range
//! transfers over one shared ledger); everything else falls back to a
//! sequential GET. The `.state` sidecar exists only for the segmented path.

mod fetcher;
mod run;
mod single;
mod writer;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::SgetConfig;
use crate::probe;
use crate::progress::human_bytes;
use crate::request::{Credentials, RequestTemplate};
use crate::statefile::StateFile;
use crate::storage::StorageWriter;
use crate::url_model;

/// A configured download session factory.
#[derive(Debug, Clone)]
pub struct Downloader {
    thread_count: usize,
    min_chunk: u64,
    read_timeout: Duration,
    connect_timeout: Duration,
    headers: HashMap<String, String>,
    auth: Option<Credentials>,
}

impl Downloader {
    pub fn new(cfg: &SgetConfig) -> Self {
        Downloader {
            thread_count: cfg.thread_count.max(1),
            min_chunk: cfg.min_chunk_bytes.max(1),
            read_timeout: cfg.read_timeout(),
            connect_timeout: cfg.connect_timeout(),
            headers: HashMap::new(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn min_chunk(&self) -> u64 {
        self.min_chunk
    }

    /// Request template for `url` carrying this session's headers and
    /// credentials (shared by the probe, fetchers, and the hash audit).
    pub fn request(&self, url: &str) -> RequestTemplate {
        RequestTemplate::new(url, self.connect_timeout)
            .with_headers(self.headers.clone())
            .with_auth(self.auth.clone())
    }

    /// Download `url` into `output` (or a name derived from the URL).
    ///
    /// With `resume` (the default), an existing output file and `.state`
    /// sidecar continue where they left off; without it, both are discarded
    /// first.
    pub async fn download(&self, url: &str, output: Option<&Path>, resume: bool) -> Result<()> {
        let output: PathBuf = match output {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(url_model::derive_filename(url)),
        };
        let request = self.request(url);
        let state = StateFile::for_output(&output);

        if !resume {
            state.delete()?;
            match std::fs::remove_file(&output) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("remove existing {}", output.display()))
                }
            }
        }

        let probed = {
            let request = request.clone();
            tokio::task::spawn_blocking(move || probe::probe(&request))
                .await
                .context("probe task join")??
        };
        tracing::debug!(ranged = probed.ranged, total = probed.total, "probe result");

        if !probed.ranged || self.thread_count == 1 {
            if !probed.ranged {
                tracing::warn!("server does not serve byte ranges, using a single connection");
            }
            return single::download_single(&request, &output, probed.total, self.read_timeout, resume)
                .await;
        }

        let mut segments = state.load(self.min_chunk)?;
        if segments.coverage_end() > probed.total {
            anyhow::bail!(
                "state file {} covers {} bytes but the server reports {}; \
                 delete it to restart the download",
                state.path().display(),
                segments.coverage_end(),
                probed.total
            );
        }
        segments.init_size(probed.total);
        tracing::info!(
            "downloading {} ({}) with {} connections",
            output.display(),
            human_bytes(probed.total as f64),
            self.thread_count
        );

        let storage = StorageWriter::open(&output)?;
        run::run(
            &request,
            &mut segments,
            &storage,
            &state,
            probed.total,
            run::ReactorOpts {
                thread_count: self.thread_count,
                read_timeout: self.read_timeout,
            },
        )
        .await?;
        storage.sync()?;
        tracing::info!(
            "finished {} ({})",
            output.display(),
            human_bytes(probed.total as f64)
        );
        Ok(())
    }
}
