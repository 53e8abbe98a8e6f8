//! Chunk stream: reads upload files from disk, one fixed-size chunk at a time.
//!
//! The stream runs as its own task and hands chunks to the event loop over
//! a bounded channel, so disk reads stay at most `CHUNK_READ_AHEAD` chunks
//! ahead of the transport.
//!
//! ```text
//! ┌───────────┐  bounded chan  ┌────────────┐
//! │ DiskRead  │ ─────────────► │ event loop │ ──► upload_chunk
//! │ (task)    │  StreamEvent   │            │
//! └───────────┘                └────────────┘
//! ```
//!
//! Cancellation is cooperative: the stop signal is checked before every
//! read, never in the middle of one.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::config::{CHUNK_READ_AHEAD, CHUNK_YIELD_EVERY};
use crate::utils::sos::SignalOfStop;

/// A file scheduled for streaming.
#[derive(Debug, Clone)]
pub struct StreamFile {
    pub file_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Output of the chunk stream task.
#[derive(Debug)]
pub enum StreamEvent {
    /// The next chunk of `file_id`. Indices start at 0 and increase by one.
    Chunk {
        upload_id: String,
        file_id: String,
        chunk_index: u32,
        data: Vec<u8>,
    },
    /// A file could not be read; streaming continues with the next file.
    FileFailed {
        upload_id: String,
        file_id: String,
        error: String,
    },
    /// Every file was read to the end.
    Finished { upload_id: String },
    /// The stop signal fired before the end.
    Cancelled { upload_id: String },
}

/// Number of chunks a file of `size` bytes is split into.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

/// Spawn the chunk reader for one upload.
pub fn spawn_chunk_stream(
    upload_id: String,
    files: Vec<StreamFile>,
    chunk_size: usize,
    stop: SignalOfStop,
) -> (mpsc::Receiver<StreamEvent>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHUNK_READ_AHEAD);

    let handle = tokio::spawn(async move {
        let mut sent_since_yield = 0u32;
        for file in files {
            if stop.cancelled() {
                let _ = tx.send(StreamEvent::Cancelled { upload_id }).await;
                return;
            }
            match stream_file(&upload_id, &file, chunk_size, &stop, &tx, &mut sent_since_yield)
                .await
            {
                Ok(FileOutcome::Done) => {}
                Ok(FileOutcome::Stopped) => {
                    let _ = tx.send(StreamEvent::Cancelled { upload_id }).await;
                    return;
                }
                Ok(FileOutcome::ConsumerGone) => return,
                Err(e) => {
                    warn!(event = "chunk_stream_file_failure", upload_id = %upload_id, file_id = %file.file_id, error = %e, "Skipping unreadable file");
                    let failed = StreamEvent::FileFailed {
                        upload_id: upload_id.clone(),
                        file_id: file.file_id.clone(),
                        error: format!("{:#}", e),
                    };
                    if tx.send(failed).await.is_err() {
                        return;
                    }
                }
            }
        }
        debug!(event = "chunk_stream_finished", upload_id = %upload_id, "All files streamed");
        let _ = tx.send(StreamEvent::Finished { upload_id }).await;
    });

    (rx, handle)
}

enum FileOutcome {
    Done,
    Stopped,
    ConsumerGone,
}

async fn stream_file(
    upload_id: &str,
    file: &StreamFile,
    chunk_size: usize,
    stop: &SignalOfStop,
    tx: &mpsc::Sender<StreamEvent>,
    sent_since_yield: &mut u32,
) -> Result<FileOutcome> {
    let mut handle = tokio::fs::File::open(&file.path)
        .await
        .with_context(|| format!("cannot open {}", file.path.display()))?;

    let total = chunk_count(file.size_bytes, chunk_size);
    let mut remaining = file.size_bytes;
    for chunk_index in 0..total {
        if stop.cancelled() {
            return Ok(FileOutcome::Stopped);
        }
        let len = (chunk_size as u64).min(remaining) as usize;
        let mut data = vec![0u8; len];
        handle
            .read_exact(&mut data)
            .await
            .with_context(|| format!("short read on {} at chunk {}", file.path.display(), chunk_index))?;
        remaining -= len as u64;

        let event = StreamEvent::Chunk {
            upload_id: upload_id.to_string(),
            file_id: file.file_id.clone(),
            chunk_index,
            data,
        };
        if tx.send(event).await.is_err() {
            return Ok(FileOutcome::ConsumerGone);
        }

        *sent_since_yield += 1;
        if *sent_since_yield >= CHUNK_YIELD_EVERY {
            *sent_since_yield = 0;
            tokio::task::yield_now().await;
        }
    }
    Ok(FileOutcome::Done)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("scenecast_test")
            .join("chunk")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 10), 0);
        assert_eq!(chunk_count(1, 10), 1);
        assert_eq!(chunk_count(10, 10), 1);
        assert_eq!(chunk_count(11, 10), 2);
    }

    #[tokio::test]
    async fn streams_files_in_order_with_increasing_indices() {
        let dir = test_dir("ordered");
        let big = dir.join("big.bin");
        let tiny = dir.join("tiny.bin");
        std::fs::write(&big, vec![1u8; 25]).unwrap();
        std::fs::write(&tiny, vec![2u8; 1]).unwrap();

        let files = vec![
            StreamFile {
                file_id: "big".into(),
                path: big,
                size_bytes: 25,
            },
            StreamFile {
                file_id: "tiny".into(),
                path: tiny,
                size_bytes: 1,
            },
        ];
        let (rx, _handle) = spawn_chunk_stream("u1".into(), files, 10, SignalOfStop::new());
        let events = collect(rx).await;

        let chunks: Vec<(String, u32, usize)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk {
                    file_id,
                    chunk_index,
                    data,
                    ..
                } => Some((file_id.clone(), *chunk_index, data.len())),
                _ => None,
            })
            .collect();
        assert_eq!(
            chunks,
            vec![
                ("big".to_string(), 0, 10),
                ("big".to_string(), 1, 10),
                ("big".to_string(), 2, 5),
                ("tiny".to_string(), 0, 1),
            ]
        );
        assert!(matches!(events.last(), Some(StreamEvent::Finished { .. })));

        cleanup(&dir);
    }

    #[tokio::test]
    async fn missing_file_is_skipped() {
        let dir = test_dir("missing");
        let ok = dir.join("ok.bin");
        std::fs::write(&ok, vec![0u8; 3]).unwrap();

        let files = vec![
            StreamFile {
                file_id: "gone".into(),
                path: dir.join("gone.bin"),
                size_bytes: 5,
            },
            StreamFile {
                file_id: "ok".into(),
                path: ok,
                size_bytes: 3,
            },
        ];
        let (rx, _handle) = spawn_chunk_stream("u2".into(), files, 10, SignalOfStop::new());
        let events = collect(rx).await;

        assert!(matches!(&events[0], StreamEvent::FileFailed { file_id, .. } if file_id == "gone"));
        assert!(matches!(&events[1], StreamEvent::Chunk { file_id, .. } if file_id == "ok"));
        assert!(matches!(events.last(), Some(StreamEvent::Finished { .. })));

        cleanup(&dir);
    }

    #[tokio::test]
    async fn stop_signal_ends_stream_with_cancelled() {
        let dir = test_dir("cancel");
        let path = dir.join("data.bin");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        let stop = SignalOfStop::new();
        stop.cancel();
        let files = vec![StreamFile {
            file_id: "d".into(),
            path,
            size_bytes: 100,
        }];
        let (rx, _handle) = spawn_chunk_stream("u3".into(), files, 10, stop);
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Cancelled { .. }));

        cleanup(&dir);
    }
}
