//! Access token extraction from notebook boot logs.
//!
//! The notebook server prints its login URL, including a one-time token, while
//! it boots. The log is followed live, so scanning is bounded by a line cap and
//! a deadline instead of by the end of the stream.

use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, warn};

/// Marker preceding the token in the notebook's login URL.
pub const TOKEN_MARKER: &[u8] = b"token=";

/// Length of the token the notebook server generates.
pub const TOKEN_LEN: usize = 48;

/// Bounds applied to a log scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    /// Give up after this long.
    pub timeout: Duration,
    /// Give up after this many lines.
    pub max_lines: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_lines: 10_000,
        }
    }
}

/// Find the token in a single log line.
///
/// Returns the `TOKEN_LEN` bytes following the first marker, or fewer if the
/// line ends sooner.
pub fn find_token(line: &[u8]) -> Option<String> {
    let pos = line
        .windows(TOKEN_MARKER.len())
        .position(|window| window == TOKEN_MARKER)?;
    let start = pos + TOKEN_MARKER.len();
    let end = (start + TOKEN_LEN).min(line.len());
    let token = &line[start..end];
    if token.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(token).into_owned())
}

/// Scan a log stream for the access token.
///
/// Stops at the first line carrying the marker. Read errors are skipped;
/// exhausting the stream, the line cap or the deadline yields `None`.
pub async fn extract_token<S>(lines: S, limits: ScanLimits) -> Option<String>
where
    S: Stream<Item = std::io::Result<Vec<u8>>> + Unpin,
{
    let scan = async move {
        let mut lines = lines.take(limits.max_lines);
        let mut seen = 0usize;
        while let Some(line) = lines.next().await {
            seen += 1;
            match line {
                Ok(line) => {
                    if let Some(token) = find_token(&line) {
                        debug!("found access token after {} log lines", seen);
                        return Some(token);
                    }
                }
                Err(e) => warn!("error reading container log line: {}", e),
            }
        }
        debug!("log scan ended after {} lines without a token", seen);
        None
    };

    match tokio::time::timeout(limits.timeout, scan).await {
        Ok(token) => token,
        Err(_) => {
            warn!("no access token in container logs after {:?}", limits.timeout);
            None
        }
    }
}
