//! Output streaming
//!
//! [`OutputStream`] turns the raw events of a remote process into an
//! ordered sequence of [`OutputChunk`]s. The line carrying the return value
//! is withheld from the console and delivered last, after every chunk the
//! process printed before it.

use std::collections::VecDeque;
use std::io::Write;

use chrono::{DateTime, Utc};
use futures::Stream;
use offload_exec::{ProcessEvent, RemoteProcess};
use serde_json::Value;

use crate::error::OffloadError;

/// Origin of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Stdout,
    Stderr,
    /// Encoded return value; always the final chunk
    Result,
}

/// Timestamped fragment of remote output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Position in the stream, starting at 0
    pub seq: u64,
    /// Arrival time
    pub at: DateTime<Utc>,
    pub kind: ChunkKind,
    pub text: String,
}

/// Where chunks are echoed while the process runs
pub trait Console: Send + Sync {
    fn emit(&self, chunk: &OutputChunk);
}

/// Echoes to the local stdout and stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl Console for StdConsole {
    fn emit(&self, chunk: &OutputChunk) {
        // Console failures must not fail the call
        match chunk.kind {
            ChunkKind::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(chunk.text.as_bytes());
                let _ = out.flush();
            }
            ChunkKind::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = err.write_all(chunk.text.as_bytes());
                let _ = err.flush();
            }
            ChunkKind::Result => {}
        }
    }
}

/// Everything a drained stream produced
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Console text in arrival order
    pub output: String,
    /// Raw payload of the result line
    pub result: Option<String>,
    /// Exit status, `Some(None)` when killed by a signal
    pub exit: Option<Option<i32>>,
    /// Why the transport gave up before the process ended
    pub lost: Option<String>,
}

impl StreamSummary {
    /// Decode the return value
    ///
    /// # Errors
    /// `OffloadError::ResultDecode` if the result line is missing or is not
    /// JSON, `OffloadError::StreamInterrupted` if it is missing because the
    /// transport failed.
    pub fn decode(&self) -> Result<Value, OffloadError> {
        match (&self.result, &self.lost) {
            (Some(payload), _) => serde_json::from_str(payload).map_err(|e| {
                OffloadError::ResultDecode(format!("malformed result {payload:?}: {e}"))
            }),
            (None, Some(reason)) => Err(OffloadError::StreamInterrupted(reason.clone())),
            (None, None) => Err(OffloadError::ResultDecode(match self.exit {
                Some(Some(code)) => format!("process exited with status {code} without a result"),
                _ => "process was killed before returning a result".to_string(),
            })),
        }
    }
}

/// Lazy, ordered, finite sequence of chunks for one process
#[derive(Debug)]
pub struct OutputStream {
    process: RemoteProcess,
    marker: String,
    seq: u64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    at_line_start: bool,
    ready: VecDeque<OutputChunk>,
    result: Option<String>,
    exit: Option<Option<i32>>,
    lost: Option<String>,
    finished: bool,
}

impl OutputStream {
    /// Stream `process`, treating lines that start with `marker` as the result
    #[must_use]
    pub fn new(process: RemoteProcess, marker: impl Into<String>) -> Self {
        Self {
            process,
            marker: marker.into(),
            seq: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            at_line_start: true,
            ready: VecDeque::new(),
            result: None,
            exit: None,
            lost: None,
            finished: false,
        }
    }

    /// Next chunk, waiting for the process if none is ready
    ///
    /// Returns `None` once the process ended and every chunk was handed out.
    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Some(chunk);
            }
            if self.finished {
                return None;
            }

            match self.process.next_event().await {
                Some(ProcessEvent::Stdout(bytes)) => {
                    self.stdout.extend_from_slice(&bytes);
                    self.drain_stdout(false);
                }
                Some(ProcessEvent::Stderr(bytes)) => {
                    self.stderr.extend_from_slice(&bytes);
                    self.drain_stderr(false);
                }
                Some(ProcessEvent::Exit(code)) => {
                    self.exit = Some(code);
                    self.finish();
                }
                Some(ProcessEvent::Lost(reason)) => {
                    self.lost = Some(reason);
                    self.finish();
                }
                None => {
                    self.lost = Some("event channel closed before the process ended".to_string());
                    self.finish();
                }
            }
        }
    }

    /// Exit status, once known
    #[must_use]
    pub fn exit(&self) -> Option<Option<i32>> {
        self.exit
    }

    /// Transport failure, if any
    #[must_use]
    pub fn lost(&self) -> Option<&str> {
        self.lost.as_deref()
    }

    /// Pull-based view for callers that drain the stream themselves
    pub fn into_stream(self) -> impl Stream<Item = OutputChunk> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next_chunk().await.map(|chunk| (chunk, stream))
        })
    }

    /// Drain the stream, echoing console chunks as they arrive
    pub async fn relay(mut self, console: Option<&dyn Console>) -> StreamSummary {
        let mut summary = StreamSummary::default();

        while let Some(chunk) = self.next_chunk().await {
            match chunk.kind {
                ChunkKind::Result => summary.result = Some(chunk.text),
                ChunkKind::Stdout | ChunkKind::Stderr => {
                    if let Some(console) = console {
                        console.emit(&chunk);
                    }
                    summary.output.push_str(&chunk.text);
                }
            }
        }

        summary.exit = self.exit;
        summary.lost = self.lost;
        summary
    }

    fn push(&mut self, kind: ChunkKind, text: String) {
        if text.is_empty() && kind != ChunkKind::Result {
            return;
        }
        self.ready.push_back(OutputChunk {
            seq: self.seq,
            at: Utc::now(),
            kind,
            text,
        });
        self.seq += 1;
    }

    fn drain_stdout(&mut self, eof: bool) {
        while let Some(pos) = self.stdout.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.stdout.drain(..=pos).collect();
            self.take_line(&line);
        }

        if self.stdout.is_empty() {
            return;
        }
        if eof {
            let rest = std::mem::take(&mut self.stdout);
            self.take_line(&rest);
        } else if !self.may_be_marker() {
            // Partial line, emitted now for real-time echo
            if let Some(text) = take_utf8(&mut self.stdout) {
                self.at_line_start = false;
                self.push(ChunkKind::Stdout, text);
            }
        }
    }

    fn drain_stderr(&mut self, eof: bool) {
        let text = if eof {
            let rest = std::mem::take(&mut self.stderr);
            Some(String::from_utf8_lossy(&rest).into_owned())
        } else {
            take_utf8(&mut self.stderr)
        };
        if let Some(text) = text {
            self.push(ChunkKind::Stderr, text);
        }
    }

    /// Whether the held partial line could still turn into the result line
    fn may_be_marker(&self) -> bool {
        let marker = self.marker.as_bytes();
        self.at_line_start && (marker.starts_with(&self.stdout) || self.stdout.starts_with(marker))
    }

    fn take_line(&mut self, line: &[u8]) {
        let was_line_start = self.at_line_start;
        self.at_line_start = line.ends_with(b"\n");

        if was_line_start && let Some(payload) = line.strip_prefix(self.marker.as_bytes()) {
            let payload = String::from_utf8_lossy(payload).trim().to_string();
            self.result = Some(if payload.is_empty() {
                "null".to_string()
            } else {
                payload
            });
            return;
        }

        self.push(ChunkKind::Stdout, String::from_utf8_lossy(line).into_owned());
    }

    fn finish(&mut self) {
        self.drain_stdout(true);
        self.drain_stderr(true);
        if let Some(payload) = self.result.clone() {
            self.push(ChunkKind::Result, payload);
        }
        self.finished = true;
    }
}

/// Remove and return the longest valid UTF-8 prefix of `buf`
///
/// An incomplete trailing sequence stays in `buf`; invalid bytes are
/// replaced.
fn take_utf8(buf: &mut Vec<u8>) -> Option<String> {
    let valid = match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => buf.len(),
    };
    if valid == 0 {
        return None;
    }

    let head: Vec<u8> = buf.drain(..valid).collect();
    Some(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::sync::mpsc;

    use super::*;

    const MARKER: &str = "@@offload-result-test";

    fn stream(events: Vec<ProcessEvent>) -> OutputStream {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        OutputStream::new(RemoteProcess::new(rx), MARKER)
    }

    fn out(text: &str) -> ProcessEvent {
        ProcessEvent::Stdout(text.as_bytes().to_vec())
    }

    fn err(text: &str) -> ProcessEvent {
        ProcessEvent::Stderr(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_result_is_last_and_hidden() {
        let summary = stream(vec![
            out("one\n"),
            err("warn\n"),
            out(&format!("two\n{MARKER} [1, \"x\"]\n")),
            ProcessEvent::Exit(Some(0)),
        ])
        .relay(None)
        .await;

        assert_eq!(summary.output, "one\nwarn\ntwo\n");
        assert_eq!(summary.decode().unwrap(), serde_json::json!([1, "x"]));
    }

    #[tokio::test]
    async fn test_chunks_keep_arrival_order() {
        let chunks: Vec<OutputChunk> = stream(vec![
            out("a\n"),
            err("b\n"),
            out("c\n"),
            out(&format!("{MARKER} 3\n")),
            ProcessEvent::Exit(Some(0)),
        ])
        .into_stream()
        .collect()
        .await;

        let kinds: Vec<_> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChunkKind::Stdout,
                ChunkKind::Stderr,
                ChunkKind::Stdout,
                ChunkKind::Result
            ]
        );
        assert!(chunks.windows(2).all(|w| w[0].seq + 1 == w[1].seq));
        assert_eq!(chunks[3].text, "3");
    }

    #[tokio::test]
    async fn test_marker_split_across_reads() {
        let (head, tail) = MARKER.split_at(5);
        let summary = stream(vec![
            out("progress\n"),
            out(head),
            out(tail),
            out(" {\"ok\": true}\n"),
            ProcessEvent::Exit(Some(0)),
        ])
        .relay(None)
        .await;

        assert_eq!(summary.output, "progress\n");
        assert_eq!(summary.decode().unwrap(), serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_marker_mid_line_is_text() {
        let line = format!("echo {MARKER} 1\n");
        let summary = stream(vec![out(&line), ProcessEvent::Exit(Some(0))])
            .relay(None)
            .await;

        assert_eq!(summary.output, line);
        assert!(matches!(summary.decode(), Err(OffloadError::ResultDecode(_))));
    }

    #[tokio::test]
    async fn test_partial_line_is_emitted_early() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = OutputStream::new(RemoteProcess::new(rx), MARKER);

        tx.send(out("working...")).unwrap();
        let chunk = stream.next_chunk().await.unwrap();
        assert_eq!(chunk.text, "working...");

        tx.send(out(" done\n")).unwrap();
        tx.send(ProcessEvent::Exit(Some(0))).unwrap();
        assert_eq!(stream.next_chunk().await.unwrap().text, " done\n");
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_utf8_split_across_reads() {
        let bytes = "héllo\n".as_bytes();
        let summary = stream(vec![
            ProcessEvent::Stderr(bytes[..2].to_vec()),
            ProcessEvent::Stderr(bytes[2..].to_vec()),
            ProcessEvent::Exit(Some(0)),
        ])
        .relay(None)
        .await;

        assert_eq!(summary.output, "héllo\n");
    }

    #[tokio::test]
    async fn test_malformed_result() {
        let summary = stream(vec![out(&format!("{MARKER} {{oops\n")), ProcessEvent::Exit(Some(0))])
            .relay(None)
            .await;

        assert!(matches!(summary.decode(), Err(OffloadError::ResultDecode(_))));
    }

    #[tokio::test]
    async fn test_lost_transport_is_reported() {
        let summary = stream(vec![
            out("partial\n"),
            ProcessEvent::Lost("channel reset".into()),
        ])
        .relay(None)
        .await;

        assert_eq!(summary.output, "partial\n");
        assert!(matches!(
            summary.decode(),
            Err(OffloadError::StreamInterrupted(reason)) if reason == "channel reset"
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_counts_as_lost() {
        let summary = stream(vec![out("x\n")]).relay(None).await;
        assert!(summary.lost.is_some());
    }
}
