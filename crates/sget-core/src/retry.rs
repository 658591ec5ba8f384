//! Recovery for the sequential fallback path.
//!
//! The segmented engine recovers by respawning a slot from the ledger
//! cursor, so it never waits. The fallback has no ledger to lean on: when
//! its one connection dies it reconnects from the current file size, pausing
//! between attempts so a flapping server is not hammered.

use std::fmt;
use std::time::Duration;

/// Error from one transfer attempt of the fallback path.
#[derive(Debug)]
pub enum TransferError {
    /// Transport-level failure reported by curl.
    Curl(curl::Error),
    /// Response status outside 2xx.
    Http(u32),
    /// Connection closed before the expected byte count arrived.
    Partial { expected: u64, received: u64 },
    /// Local disk failure.
    Storage(anyhow::Error),
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Open a fresh connection and continue from the current file size.
    Reconnect,
    /// Reconnect, but not before a longer pause: the server asked for air.
    SlowDown,
    /// Reconnecting will not help.
    GiveUp,
}

impl TransferError {
    /// How the fallback should react to this error.
    ///
    /// Whatever heals by opening a fresh connection (drops, timeouts, short
    /// bodies, 5xx) reconnects; explicit pressure signals (408, 429, 503)
    /// reconnect after a longer pause; everything else, including any local
    /// disk problem, ends the download.
    pub fn recovery(&self) -> Recovery {
        match self {
            TransferError::Curl(e) => {
                let reconnectable = e.is_operation_timedout()
                    || e.is_couldnt_resolve_host()
                    || e.is_couldnt_resolve_proxy()
                    || e.is_couldnt_connect()
                    || e.is_partial_file()
                    || e.is_got_nothing()
                    || e.is_recv_error()
                    || e.is_send_error()
                    || e.is_read_error()
                    || e.is_write_error();
                if reconnectable {
                    Recovery::Reconnect
                } else {
                    Recovery::GiveUp
                }
            }
            TransferError::Http(code) => match code {
                408 | 429 | 503 => Recovery::SlowDown,
                500..=599 => Recovery::Reconnect,
                _ => Recovery::GiveUp,
            },
            TransferError::Partial { .. } => Recovery::Reconnect,
            TransferError::Storage(_) => Recovery::GiveUp,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Curl(e) => write!(f, "transport: {}", e),
            TransferError::Http(code) => write!(f, "server returned HTTP {}", code),
            TransferError::Partial { expected, received } => {
                write!(f, "connection closed early: {} of {} bytes", received, expected)
            }
            TransferError::Storage(e) => write!(f, "local write: {}", e),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Curl(e) => Some(e),
            TransferError::Http(_) | TransferError::Partial { .. } | TransferError::Storage(_) => {
                None
            }
        }
    }
}

/// Pause schedule between reconnects.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Reconnects allowed before the download is declared failed.
    pub max_reconnects: u32,
    /// Pause before the first reconnect; doubles on each further one.
    pub initial_pause: Duration,
    /// Ceiling for the doubling pause.
    pub max_pause: Duration,
    /// Shortest pause honored once the server asked to slow down.
    pub slow_down_floor: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            max_reconnects: 6,
            initial_pause: Duration::from_millis(400),
            max_pause: Duration::from_secs(20),
            slow_down_floor: Duration::from_secs(3),
        }
    }
}

impl Backoff {
    /// Pause before reconnect number `reconnect` (1-based), or `None` when
    /// the error is unrecoverable or the schedule is exhausted.
    pub fn pause_before(&self, reconnect: u32, recovery: Recovery) -> Option<Duration> {
        if recovery == Recovery::GiveUp || reconnect > self.max_reconnects {
            return None;
        }
        let mut pause = self.initial_pause;
        for _ in 1..reconnect {
            pause = (pause + pause).min(self.max_pause);
            if pause == self.max_pause {
                break;
            }
        }
        if recovery == Recovery::SlowDown {
            pause = pause.max(self.slow_down_floor);
        }
        Some(pause.min(self.max_pause))
    }
}

/// Run `attempt` until it succeeds, pausing and reconnecting per `backoff`.
/// Blocking; call from the blocking pool.
pub fn reconnect_loop<F>(backoff: &Backoff, mut attempt: F) -> Result<(), TransferError>
where
    F: FnMut() -> Result<(), TransferError>,
{
    let mut reconnects = 0u32;
    loop {
        let err = match attempt() {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        reconnects += 1;
        let Some(pause) = backoff.pause_before(reconnects, err.recovery()) else {
            return Err(err);
        };
        tracing::debug!(
            reconnects,
            pause_ms = pause.as_millis() as u64,
            error = %err,
            "reconnecting after pause"
        );
        std::thread::sleep(pause);
    }
}
