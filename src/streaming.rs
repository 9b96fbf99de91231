//! Streaming delivery plumbing shared by all adapters.
//!
//! Provider SSE deltas are tiny; delivering each one to the user callback
//! would dominate wall time. [`BufferedStreamer`] coalesces them and flushes
//! either when the buffer reaches a size threshold or on a timer tick, which
//! bounds both callback rate and delivery latency.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::types::{FetchCompletionOptions, StreamEvent, StreamHandler};

/// Maximum delay between flushes of buffered stream data.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(256);
/// Approximate target size (in chars) for chunks passed to the handler.
pub const FLUSH_CHUNK_SIZE: usize = 1024;

/// Sink receiving coalesced stream data.
pub type EmitFn = Arc<dyn Fn(String) -> Result<()> + Send + Sync>;

struct StreamerShared {
    buf: Mutex<String>,
    emit: EmitFn,
    done: Notify,
}

impl StreamerShared {
    /// Drains the buffer under the lock; the emit call happens outside it.
    fn take_buffered(&self) -> Option<String> {
        let mut buf = self.buf.lock().unwrap();
        if buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *buf))
        }
    }
}

/// Coalescing writer with a background time-based flusher.
///
/// Must be created inside a tokio runtime. `write` is safe to call from any
/// task; size-triggered emit errors propagate to the writer, timer-triggered
/// ones are logged and swallowed (the background task has no caller to return
/// to). `flush` is idempotent: the first call stops the timer and drains once.
pub struct BufferedStreamer {
    shared: Arc<StreamerShared>,
    max_size: usize,
    flushed: Once,
}

impl BufferedStreamer {
    pub fn new(emit: EmitFn, flush_interval: Duration, max_size: usize) -> BufferedStreamer {
        let flush_interval = if flush_interval.is_zero() {
            FLUSH_INTERVAL
        } else {
            flush_interval
        };
        let max_size = if max_size == 0 { FLUSH_CHUNK_SIZE } else { max_size };

        let shared = Arc::new(StreamerShared {
            buf: Mutex::new(String::new()),
            emit,
            done: Notify::new(),
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(data) = task_shared.take_buffered() {
                            let emit = Arc::clone(&task_shared.emit);
                            match std::panic::catch_unwind(AssertUnwindSafe(|| emit(data))) {
                                Ok(Err(e)) => {
                                    debug!(error = %e, "time-triggered stream flush failed");
                                }
                                Ok(Ok(())) => {}
                                Err(_) => {
                                    error!("buffered streamer background flush panic");
                                    return;
                                }
                            }
                        }
                    }
                    _ = task_shared.done.notified() => {
                        return;
                    }
                }
            }
        });

        BufferedStreamer {
            shared,
            max_size,
            flushed: Once::new(),
        }
    }

    /// Appends to the buffer; drains and emits synchronously once the buffer
    /// reaches the size threshold.
    pub fn write(&self, chunk: &str) -> Result<()> {
        let data = {
            let mut buf = self.shared.buf.lock().unwrap();
            buf.push_str(chunk);
            if buf.len() >= self.max_size {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };
        if let Some(data) = data {
            (self.shared.emit)(data)?;
        }
        Ok(())
    }

    /// Stops the timer task and drains any remaining buffered data. Safe to
    /// call more than once; only the first call has any effect.
    pub fn flush(&self) {
        self.flushed.call_once(|| {
            // notify_one stores a permit, so the task exits even if it is
            // mid-tick when flush runs.
            self.shared.done.notify_one();
            if let Some(data) = self.shared.take_buffered() {
                let _ = (self.shared.emit)(data);
            }
        });
    }
}

impl Drop for BufferedStreamer {
    /// Stops the ticker task even when the owning fetch is cancelled before
    /// `flush` runs.
    fn drop(&mut self) {
        self.shared.done.notify_one();
    }
}

/// Invokes the user's stream handler, converting a panic into an error so a
/// faulty callback cannot take down the streaming loop. A missing handler is
/// a no-op.
pub fn safe_call_stream_handler(
    handler: &Option<StreamHandler>,
    event: StreamEvent,
) -> Result<()> {
    let Some(handler) = handler else {
        return Ok(());
    };
    let kind = event.kind;
    let provider = event.provider.clone();
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(res) => res,
        Err(_) => {
            error!(?kind, provider, "stream handler panic");
            Err(anyhow::anyhow!("stream handler panicked"))
        }
    }
}

/// Builds the emit sink for one stream kind: wraps coalesced chunks into
/// [`StreamEvent`]s and delivers them through the guarded handler call.
/// Whitespace-only chunks are not delivered.
pub(crate) fn stream_emit(
    handler: Option<StreamHandler>,
    kind: crate::types::StreamContentKind,
    provider: String,
    model: String,
) -> EmitFn {
    use crate::types::StreamContentKind;
    Arc::new(move |chunk: String| {
        if chunk.trim().is_empty() {
            return Ok(());
        }
        let event = match kind {
            StreamContentKind::Text => StreamEvent::text(provider.clone(), model.clone(), chunk),
            StreamContentKind::Thinking => {
                StreamEvent::thinking(provider.clone(), model.clone(), chunk)
            }
        };
        safe_call_stream_handler(&handler, event)
    })
}

/// Fully-specified streaming configuration after applying defaults.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedStreamConfig {
    pub flush_interval: Duration,
    pub flush_chunk_size: usize,
}

impl ResolvedStreamConfig {
    pub fn from_options(opts: &FetchCompletionOptions) -> ResolvedStreamConfig {
        let mut cfg = ResolvedStreamConfig {
            flush_interval: FLUSH_INTERVAL,
            flush_chunk_size: FLUSH_CHUNK_SIZE,
        };
        if let Some(sc) = &opts.stream_config {
            if sc.flush_interval_millis > 0 {
                cfg.flush_interval = Duration::from_millis(sc.flush_interval_millis);
            }
            if sc.flush_chunk_size > 0 {
                cfg.flush_chunk_size = sc.flush_chunk_size;
            }
        }
        cfg
    }
}

/// Incremental splitter turning raw response bytes into complete lines,
/// tolerating UTF-8 sequences split across chunk boundaries.
#[derive(Default)]
pub struct SseLineScanner {
    byte_buffer: Vec<u8>,
    line_buffer: String,
}

impl SseLineScanner {
    pub fn new() -> SseLineScanner {
        SseLineScanner::default()
    }

    /// Feeds one network chunk, invoking `on_line` for every completed line
    /// (without its trailing newline).
    pub fn push(
        &mut self,
        chunk: &[u8],
        mut on_line: impl FnMut(&str) -> Result<()>,
    ) -> Result<()> {
        self.byte_buffer.extend_from_slice(chunk);

        let valid_len = match std::str::from_utf8(&self.byte_buffer) {
            Ok(_) => self.byte_buffer.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => return Err(anyhow::anyhow!("invalid UTF-8 in stream: {e}")),
        };

        let valid = std::str::from_utf8(&self.byte_buffer[..valid_len]).expect("checked above");
        for c in valid.chars() {
            if c == '\n' {
                if !self.line_buffer.is_empty() {
                    let line = std::mem::take(&mut self.line_buffer);
                    on_line(&line)?;
                }
            } else {
                self.line_buffer.push(c);
            }
        }
        // Keep any incomplete trailing UTF-8 sequence for the next chunk.
        self.byte_buffer.drain(..valid_len);
        Ok(())
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self, mut on_line: impl FnMut(&str) -> Result<()>) -> Result<()> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            on_line(&line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector() -> (EmitFn, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let emit: EmitFn = Arc::new(move |s: String| {
            seen2.lock().unwrap().push(s);
            Ok(())
        });
        (emit, seen)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interval_flush_then_final_flush() {
        let (emit, seen) = collector();
        let s = BufferedStreamer::new(emit, Duration::ZERO, 0);

        s.write("ab").unwrap();
        s.write("cd").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(seen.lock().unwrap().clone(), vec!["abcd".to_string()]);

        s.write("e").unwrap();
        s.flush();
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["abcd".to_string(), "e".to_string()]
        );

        // Second flush is a no-op.
        s.flush();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn size_triggered_flush_is_synchronous() {
        let (emit, seen) = collector();
        let s = BufferedStreamer::new(emit, Duration::from_secs(3600), 4);

        s.write("abc").unwrap();
        assert!(seen.lock().unwrap().is_empty());
        s.write("de").unwrap();
        assert_eq!(seen.lock().unwrap().clone(), vec!["abcde".to_string()]);
        s.flush();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bytes_are_conserved_in_order() {
        let (emit, seen) = collector();
        let s = BufferedStreamer::new(emit, Duration::from_secs(3600), 8);

        let chunks = ["hello ", "wor", "ld", ", again ", "and again"];
        for c in chunks {
            s.write(c).unwrap();
        }
        s.flush();

        let emitted = seen.lock().unwrap().concat();
        assert_eq!(emitted, chunks.concat());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn size_flush_error_propagates_to_writer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let emit: EmitFn = Arc::new(move |_s: String| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("downstream gone"))
        });
        let s = BufferedStreamer::new(emit, Duration::from_secs(3600), 2);

        let err = s.write("abcd").unwrap_err();
        assert!(err.to_string().contains("downstream gone"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timer_flush_error_is_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let emit: EmitFn = Arc::new(move |_s: String| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("boom"))
        });
        let s = BufferedStreamer::new(emit, Duration::from_millis(50), 1024);

        s.write("x").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Writer keeps working afterwards.
        s.write("y").unwrap();
        s.flush();
    }

    #[test]
    fn safe_handler_converts_panic_to_error() {
        let handler: StreamHandler = Arc::new(|_e| panic!("user callback bug"));
        let res = safe_call_stream_handler(
            &Some(handler),
            StreamEvent::text("p", "m", "chunk"),
        );
        assert!(res.is_err());
    }

    #[test]
    fn safe_handler_none_is_noop() {
        assert!(safe_call_stream_handler(&None, StreamEvent::text("p", "m", "x")).is_ok());
    }

    #[test]
    fn resolved_config_applies_defaults() {
        let cfg = ResolvedStreamConfig::from_options(&FetchCompletionOptions::default());
        assert_eq!(cfg.flush_interval, FLUSH_INTERVAL);
        assert_eq!(cfg.flush_chunk_size, FLUSH_CHUNK_SIZE);

        let cfg = ResolvedStreamConfig::from_options(&FetchCompletionOptions {
            stream_handler: None,
            stream_config: Some(crate::types::StreamConfig {
                flush_interval_millis: 10,
                flush_chunk_size: 2,
            }),
        });
        assert_eq!(cfg.flush_interval, Duration::from_millis(10));
        assert_eq!(cfg.flush_chunk_size, 2);
    }

    #[test]
    fn scanner_handles_split_utf8_and_lines() {
        let mut scanner = SseLineScanner::new();
        let mut lines = Vec::new();

        // "é" is 0xC3 0xA9; split it across chunks.
        scanner
            .push(b"data: caf\xC3", |l| {
                lines.push(l.to_string());
                Ok(())
            })
            .unwrap();
        assert!(lines.is_empty());
        scanner
            .push(b"\xA9\ndata: two\n", |l| {
                lines.push(l.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(lines, vec!["data: café".to_string(), "data: two".to_string()]);

        scanner
            .push(b"tail without newline", |l| {
                lines.push(l.to_string());
                Ok(())
            })
            .unwrap();
        scanner
            .finish(|l| {
                lines.push(l.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(lines.last().unwrap(), "tail without newline");
    }
}
