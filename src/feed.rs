//! Resilient dump1090 frame source.
//!
//! Maintains a TCP session to the raw feed and yields hex frames in
//! the text framing (`*<hex>;` per line). Connection loss is handled
//! locally: close, back off exponentially, reconnect. The stream never
//! buffers beyond one line; if the consumer lags, the kernel drops
//! bytes, which is acceptable for a lossy radio protocol.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential reconnect backoff: 500 ms doubling to a 10 s cap,
/// reset after any success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            current: initial,
        }
    }

    /// Returns the delay to wait before the next attempt and advances
    /// the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10))
    }
}

/// Current wall-clock time as fractional epoch seconds, the timestamp
/// unit used throughout the pipeline.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Lazily-connected, self-healing frame reader.
pub struct FrameSource {
    host: String,
    port: u16,
    backoff: Backoff,
    reader: Option<BufReader<TcpStream>>,
    line: String,
}

impl FrameSource {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            backoff: Backoff::default(),
            reader: None,
            line: String::new(),
        }
    }

    /// Yields the next hex frame with its receive time. Returns `None`
    /// only on cancellation; all I/O errors are absorbed by
    /// reconnecting.
    pub async fn next_frame(&mut self, cancel: &CancellationToken) -> Option<(String, f64)> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            if self.reader.is_none() {
                self.connect(cancel).await?;
            }

            let reader = self.reader.as_mut()?;
            self.line.clear();

            let read = tokio::select! {
                _ = cancel.cancelled() => return None,
                r = reader.read_line(&mut self.line) => r,
            };

            match read {
                Ok(0) => {
                    warn!(host = %self.host, port = self.port, "feed closed by peer");
                    self.reader = None;
                }
                Ok(_) => {
                    self.backoff.reset();
                    if let Some(frame) = strip_frame(&self.line) {
                        return Some((frame.to_string(), epoch_now()));
                    }
                    // Keepalives and partial lines are skipped silently.
                }
                Err(e) => {
                    warn!(error = %e, "feed read error, reconnecting");
                    self.reader = None;
                }
            }
        }
    }

    /// Connects with backoff until it succeeds or the token fires.
    async fn connect(&mut self, cancel: &CancellationToken) -> Option<()> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(stream) => {
                    info!(host = %self.host, port = self.port, "connected to dump1090 feed");
                    self.reader = Some(BufReader::new(stream));
                    return Some(());
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    debug!(
                        host = %self.host,
                        port = self.port,
                        error = %e,
                        retry_in = ?delay,
                        "feed connect failed",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Extracts the hex payload from one `*<hex>;` line. Returns `None`
/// for anything that is not a well-formed frame line.
fn strip_frame(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let body = trimmed.strip_prefix('*')?.strip_suffix(';')?;
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_frame() {
        assert_eq!(
            strip_frame("*8D4840D6202CC371C32CE0576098;\n"),
            Some("8D4840D6202CC371C32CE0576098")
        );
        assert_eq!(strip_frame("*8d4840d6;"), Some("8d4840d6"));
        assert_eq!(strip_frame("8D4840D6;"), None);
        assert_eq!(strip_frame("*;"), None);
        assert_eq!(strip_frame("*zz;"), None);
        assert_eq!(strip_frame(""), None);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(10));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_secs(8));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_frame_source_reads_and_survives_reconnect() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // First connection: one frame, then drop.
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"*8D4840D6202CC371C32CE0576098;\n").await.unwrap();
            drop(s);

            // Second connection: junk line then a frame.
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"not a frame\n*8D40621D58C382D690C8AC2863A7;\n")
                .await
                .unwrap();
            // Hold the socket open until the test ends.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let cancel = CancellationToken::new();
        let mut source = FrameSource::new("127.0.0.1", addr.port());
        // Shrink the backoff so the reconnect happens quickly.
        source.backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));

        let (frame, _) = source.next_frame(&cancel).await.unwrap();
        assert_eq!(frame, "8D4840D6202CC371C32CE0576098");

        let (frame, _) = source.next_frame(&cancel).await.unwrap();
        assert_eq!(frame, "8D40621D58C382D690C8AC2863A7");

        cancel.cancel();
        assert!(source.next_frame(&cancel).await.is_none());
    }
}
