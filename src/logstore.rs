//! Append-only log store with many independent tailing readers.
//!
//! A single writer appends bytes (as they arrive from a job's stdout/stderr
//! pump). Any number of readers can open an independent cursor starting at
//! offset 0 and read forward, blocking when caught up to the end until more
//! data arrives or the store is sealed (the job has exited and no more bytes
//! will ever be appended). No reader blocks the writer and no reader blocks
//! another reader.
//!
//! Bytes never leave memory involuntarily: once the in-memory buffer exceeds
//! `max_memory_bytes` the oldest bytes are spilled to a single append-only
//! file on disk, but every byte ever written remains readable from offset 0
//! for the lifetime of the store (see SPEC_FULL §10.8 / DESIGN.md's Open
//! Question decision on log rotation).

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

struct Inner {
    /// Bytes currently held in memory, covering
    /// `[spilled_len, spilled_len + memory.len())`.
    memory: Vec<u8>,
    /// Total bytes ever written that have been moved out of `memory` into
    /// `spill_file`.
    spilled_len: u64,
    spill_file: Option<std::fs::File>,
    spill_path: Option<PathBuf>,
    sealed: bool,
}

impl Inner {
    fn total_len(&self) -> u64 {
        self.spilled_len + self.memory.len() as u64
    }
}

/// Shared handle to a job's log. Cheaply cloneable; clones share the same
/// underlying buffer.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    max_memory_bytes: usize,
}

impl LogStore {
    pub fn new(max_memory_bytes: usize) -> Self {
        LogStore {
            inner: Arc::new(Mutex::new(Inner {
                memory: Vec::new(),
                spilled_len: 0,
                spill_file: None,
                spill_path: None,
                sealed: false,
            })),
            notify: Arc::new(Notify::new()),
            max_memory_bytes,
        }
    }

    /// Enables spill-to-disk once the in-memory buffer would otherwise grow
    /// past `max_memory_bytes`. Without this, the store simply keeps
    /// growing in memory (never drops bytes, never blocks the writer).
    pub async fn set_spill_path(&self, path: PathBuf) {
        let mut inner = self.inner.lock().await;
        inner.spill_path = Some(path);
    }

    /// Appends `data` to the log and wakes any readers blocked waiting for
    /// more bytes. Never fails on a healthy store; I/O errors during spill
    /// are logged and the bytes are kept in memory instead (spilling is a
    /// memory-management optimization, not a correctness requirement).
    pub async fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.memory.extend_from_slice(data);
        self.maybe_spill(&mut inner);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn maybe_spill(&self, inner: &mut Inner) {
        if inner.memory.len() <= self.max_memory_bytes {
            return;
        }
        let Some(spill_path) = inner.spill_path.clone() else {
            return;
        };
        let overflow = inner.memory.len() - self.max_memory_bytes;
        if inner.spill_file.is_none() {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&spill_path)
            {
                Ok(f) => inner.spill_file = Some(f),
                Err(e) => {
                    tracing::warn!(error = %e, path = %spill_path.display(), "failed to open log spill file");
                    return;
                }
            }
        }
        let to_spill: Vec<u8> = inner.memory.drain(..overflow).collect();
        if let Some(file) = inner.spill_file.as_mut() {
            if let Err(e) = file.write_all(&to_spill) {
                tracing::warn!(error = %e, "failed to spill log bytes, keeping in memory");
                // Put the bytes back at the front rather than lose them.
                let mut restored = to_spill;
                restored.extend_from_slice(&inner.memory);
                inner.memory = restored;
                return;
            }
        }
        inner.spilled_len += to_spill.len() as u64;
    }

    /// Marks the store as finished: no more bytes will ever be appended.
    /// Readers blocked at end-of-data wake up and see EOF instead of
    /// blocking further.
    pub async fn seal(&self) {
        let mut inner = self.inner.lock().await;
        inner.sealed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Opens an independent reading cursor starting at offset 0.
    pub fn tail(&self) -> LogTail {
        LogTail {
            store: self.clone(),
            offset: 0,
        }
    }
}

/// One reader's independent position into a [`LogStore`].
pub struct LogTail {
    store: LogStore,
    offset: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TailRead {
    /// New bytes were available immediately.
    Data(Vec<u8>),
    /// The store is sealed and there is nothing left to read.
    Eof,
}

impl LogTail {
    /// Turns this tail into a `futures_util::Stream` of byte chunks, ending
    /// when the store is sealed or `cancel` fires. This is what the Stream
    /// RPC operation hands to the transport layer.
    pub fn into_stream(
        mut self,
        cancel: CancellationToken,
    ) -> impl futures_util::Stream<Item = Vec<u8>> {
        futures_util::stream::unfold((self, cancel), |(mut tail, cancel)| async move {
            match tail.wait_for_data(&cancel).await {
                TailRead::Data(bytes) if bytes.is_empty() => None,
                TailRead::Data(bytes) => Some((bytes, (tail, cancel))),
                TailRead::Eof => None,
            }
        })
    }

    /// Returns any bytes available past the current offset without
    /// blocking, advancing the cursor. Returns an empty `Data(vec![])` if
    /// caught up but not sealed.
    pub async fn read_available(&mut self) -> TailRead {
        let inner = self.store.inner.lock().await;
        let bytes = self.read_locked(&inner);
        let sealed = inner.sealed;
        drop(inner);
        if bytes.is_empty() && sealed {
            TailRead::Eof
        } else {
            TailRead::Data(bytes)
        }
    }

    /// Blocks until new bytes are available, the store is sealed, or
    /// `cancel` fires. Used by the Stream RPC operation so a client
    /// disconnect (cancellation) doesn't leave the task parked forever.
    pub async fn wait_for_data(&mut self, cancel: &CancellationToken) -> TailRead {
        loop {
            let notified = self.store.notify.notified();
            let inner = self.store.inner.lock().await;
            let bytes = self.read_locked(&inner);
            if !bytes.is_empty() {
                drop(inner);
                return TailRead::Data(bytes);
            }
            if inner.sealed {
                return TailRead::Eof;
            }
            drop(inner);

            tokio::select! {
                _ = notified => continue,
                _ = cancel.cancelled() => return TailRead::Data(Vec::new()),
            }
        }
    }

    fn read_locked(&mut self, inner: &Inner) -> Vec<u8> {
        let total = inner.total_len();
        if self.offset >= total {
            return Vec::new();
        }

        let mut out = Vec::new();

        if self.offset < inner.spilled_len {
            if let Some(path) = &inner.spill_path {
                if let Ok(mut f) = std::fs::File::open(path) {
                    let to_read = (inner.spilled_len - self.offset) as usize;
                    let _ = f.seek(SeekFrom::Start(self.offset));
                    let mut buf = vec![0u8; to_read];
                    if let Ok(n) = f.read(&mut buf) {
                        buf.truncate(n);
                        out.extend_from_slice(&buf);
                    }
                }
            }
        }

        let mem_start = self.offset.saturating_sub(inner.spilled_len) as usize;
        if mem_start < inner.memory.len() {
            out.extend_from_slice(&inner.memory[mem_start..]);
        }

        self.offset += out.len() as u64;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_readers_from_offset_zero_see_all_bytes_independently() {
        let store = LogStore::new(1024 * 1024);
        store.append(b"hello ").await;

        let mut tail_a = store.tail();
        assert_eq!(
            tail_a.read_available().await,
            TailRead::Data(b"hello ".to_vec())
        );

        store.append(b"world").await;
        let mut tail_b = store.tail();
        assert_eq!(
            tail_b.read_available().await,
            TailRead::Data(b"hello world".to_vec())
        );
        assert_eq!(
            tail_a.read_available().await,
            TailRead::Data(b"world".to_vec())
        );
    }

    #[tokio::test]
    async fn seal_yields_eof_once_drained() {
        let store = LogStore::new(1024);
        store.append(b"x").await;
        store.seal().await;

        let mut tail = store.tail();
        assert_eq!(tail.read_available().await, TailRead::Data(b"x".to_vec()));
        assert_eq!(tail.read_available().await, TailRead::Eof);
    }

    #[tokio::test]
    async fn spills_past_memory_cap_and_stays_readable_from_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LogStore::new(4);
        store.set_spill_path(tmp.path().join("job.log")).await;

        store.append(b"abcdefgh").await;
        store.append(b"ijkl").await;

        let mut tail = store.tail();
        let TailRead::Data(all) = tail.read_available().await else {
            panic!("expected data");
        };
        assert_eq!(all, b"abcdefghijkl");
    }

    #[tokio::test]
    async fn wait_for_data_wakes_on_append() {
        let store = LogStore::new(1024);
        let mut tail = store.tail();
        let cancel = CancellationToken::new();

        let store2 = store.clone();
        let waiter = tokio::spawn(async move {
            let cancel2 = CancellationToken::new();
            tail.wait_for_data(&cancel2).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store2.append(b"late").await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, TailRead::Data(b"late".to_vec()));
        drop(cancel);
    }

    #[tokio::test]
    async fn wait_for_data_returns_on_cancellation() {
        let store = LogStore::new(1024);
        let mut tail = store.tail();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            tail.wait_for_data(&cancel),
        )
        .await
        .unwrap();
        assert_eq!(result, TailRead::Data(Vec::new()));
    }

    #[tokio::test]
    async fn into_stream_yields_chunks_then_ends_at_seal() {
        use futures_util::StreamExt;

        let store = LogStore::new(1024);
        store.append(b"a").await;
        store.append(b"b").await;
        store.seal().await;

        let cancel = CancellationToken::new();
        let chunks: Vec<Vec<u8>> = store.tail().into_stream(cancel).collect().await;
        let joined: Vec<u8> = chunks.into_iter().flatten().collect();
        assert_eq!(joined, b"ab");
    }
}
