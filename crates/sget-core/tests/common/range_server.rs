//! Minimal HTTP/1.1 server for integration tests: HEAD and Range GET over a
//! single static body, server-side SHA-1 range hashes (`?hash=sha1`), and an
//! optional one-shot mid-transfer stall.

use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and returns 200 with the full body, and
    /// HEAD never answers 206.
    pub support_ranges: bool,
    /// When set, the first range GET writes this many bytes, hangs for the
    /// given duration, then drops the connection. Later requests are normal.
    pub stall_once: Option<(usize, Duration)>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            stall_once: None,
        }
    }
}

/// Starts a server in a background thread serving `body`. Returns the base
/// URL (e.g. "http://127.0.0.1:12345/data.bin"). Runs until the process exits.
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let stall_pending = Arc::new(AtomicBool::new(opts.stall_once.is_some()));
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let stall_pending = Arc::clone(&stall_pending);
            thread::spawn(move || handle(stream, &body, opts, &stall_pending));
        }
    });
    format!("http://127.0.0.1:{}/data.bin", port)
}

fn handle(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: RangeServerOptions,
    stall_pending: &AtomicBool,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, target, range) = parse_request(request);
    let total = body.len() as u64;
    let wants_hash = target.contains("hash=sha1");
    let range = if opts.support_ranges { range } else { None };

    if method.eq_ignore_ascii_case("HEAD") {
        let response = match range {
            Some((start, end_incl)) => {
                let start = start.min(total);
                let end_incl = end_incl.min(total.saturating_sub(1));
                let len = (end_incl + 1).saturating_sub(start);
                format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\
                     Content-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\n\
                     Connection: close\r\n\r\n",
                    len, start, end_incl, total
                )
            }
            None => format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                total
            ),
        };
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    let (status, range_header, slice) = match range {
        Some((start, end_incl)) => {
            let start = start.min(total) as usize;
            let end_excl = ((end_incl.min(total.saturating_sub(1))) + 1).min(total) as usize;
            let slice = body.get(start..end_excl).unwrap_or(&body[0..0]);
            (
                "206 Partial Content",
                format!("bytes {}-{}/{}", start, end_excl.saturating_sub(1), total),
                slice,
            )
        }
        None => (
            "200 OK",
            format!("bytes 0-{}/{}", total.saturating_sub(1), total),
            body,
        ),
    };

    if wants_hash {
        let digest = hex::encode(Sha1::digest(slice));
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            digest.len(),
            digest
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let header = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Range: {}\r\nAccept-Ranges: bytes\r\n\
         Connection: close\r\n\r\n",
        status,
        slice.len(),
        range_header
    );
    let _ = stream.write_all(header.as_bytes());

    if let Some((stall_after, stall_for)) = opts.stall_once {
        if range.is_some()
            && stall_pending
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let prefix = stall_after.min(slice.len());
            let _ = stream.write_all(&slice[..prefix]);
            let _ = stream.flush();
            thread::sleep(stall_for);
            return; // drop the connection mid-body
        }
    }
    let _ = stream.write_all(slice);
}

/// Returns (method, request-target, optional (start, end_inclusive)).
fn parse_request(request: &str) -> (&str, &str, Option<(u64, u64)>) {
    let mut method = "";
    let mut target = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            let mut parts = line.split_whitespace();
            method = parts.next().unwrap_or("");
            target = parts.next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(spec) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = spec.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, target, range)
}
