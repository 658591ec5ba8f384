//! Capability probe: can the server serve byte ranges, and how big is the
//! resource?
//!
//! Sends a `HEAD` with `Range: bytes=1-` (the whole resource minus its first
//! byte). A `206` reply proves range support and its `Content-Length` is
//! `total - 1`; a plain `2xx` means no range support and `Content-Length` is
//! the total. Anything else fails the download up front.

use anyhow::{Context, Result};
use std::str;

use crate::request::RequestTemplate;

/// What the probe learned about the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeProbe {
    /// True when the server honored the suffix range with `206`.
    pub ranged: bool,
    /// Total resource size in bytes.
    pub total: u64,
}

/// Probe `request`'s URL. Blocking; call from `spawn_blocking` in async code.
pub fn probe(request: &RequestTemplate) -> Result<RangeProbe> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = request.new_easy().context("build probe request")?;
    easy.nobody(true)?; // HEAD
    easy.range("1-")?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                let line = s.trim_end();
                // curl emits one header block per redirect hop; keep only the
                // final response's headers.
                if line.starts_with("HTTP/") {
                    headers.clear();
                }
                headers.push(line.to_string());
            }
            true
        })?;
        transfer.perform().context("HEAD probe failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    let content_length = parse_content_length(&headers);
    match code {
        206 => {
            let len = content_length
                .ok_or_else(|| anyhow::anyhow!("206 probe reply without Content-Length"))?;
            Ok(RangeProbe {
                ranged: true,
                total: len + 1,
            })
        }
        200..=299 => {
            let len = content_length
                .ok_or_else(|| anyhow::anyhow!("probe reply without Content-Length"))?;
            Ok(RangeProbe {
                ranged: false,
                total: len,
            })
        }
        _ => anyhow::bail!("HEAD {} returned HTTP {}", request.url(), code),
    }
}

/// `Content-Length` from collected header lines, case-insensitive.
fn parse_content_length(lines: &[String]) -> Option<u64> {
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                if let Ok(n) = value.trim().parse::<u64>() {
                    return Some(n);
                }
            }
        }
    }
    None
}
