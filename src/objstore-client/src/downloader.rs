// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Multiplexed multi-range downloads over one read stream.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mz_objstore_proto as proto;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::sync::Mutex as AsyncMutex;
use tonic::metadata::MetadataMap;
use tracing::{debug, info, warn};

use crate::cfg::ClientConfig;
use crate::error::StorageError;
use crate::read_stream::ReadObjectStream;
use crate::sink::ByteSink;
use crate::transport::Transport;

/// Hard cap on ranges accepted by one `download_ranges` call.
pub const MAX_READ_RANGES_PER_CALL: usize = 1000;
/// Ranges are split into sub-requests of at most this many entries.
const MAX_READ_RANGES_PER_REQUEST: usize = 100;

const READ_ID_BITS: u32 = 56;

/// Whether a hardware CRC32C implementation is available. Without one,
/// validating every inbound frame would silently dominate download cost, so
/// `open` refuses to proceed.
static CRC32C_ACCELERATED: Lazy<bool> = Lazy::new(|| {
    #[cfg(target_arch = "x86_64")]
    return std::is_x86_feature_detected!("sse4.2");
    #[cfg(target_arch = "aarch64")]
    return std::arch::is_aarch64_feature_detected!("crc");
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    false
});

/// One requested byte range and the sink its bytes go to.
///
/// `length == 0` means "from `offset` to the end of the object".
pub struct RangeRequest {
    pub offset: u64,
    pub length: u64,
    pub sink: Box<dyn ByteSink>,
}

impl RangeRequest {
    pub fn new(offset: u64, length: u64, sink: impl ByteSink + 'static) -> Self {
        RangeRequest {
            offset,
            length,
            sink: Box::new(sink),
        }
    }
}

impl fmt::Debug for RangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeRequest")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Per-range outcome of a successful `download_ranges` call, in input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeResult {
    /// The requested length; 0 for to-end ranges.
    pub bytes_requested: u64,
    pub bytes_written: u64,
}

/// An in-flight range: its sink, its owning batch, and how far it has
/// progressed. Progress drives resumption: after a reconnect the remainder is
/// re-requested from `offset + written`.
struct ActiveRange {
    batch_id: u64,
    /// Position in the originating call's input, for result assembly.
    slot: usize,
    offset: u64,
    length: u64,
    written: u64,
    sink: Box<dyn ByteSink>,
}

struct BatchState {
    pending: HashSet<u64>,
    results: Vec<RangeResult>,
}

/// The shared range-correlation state.
///
/// Invariant: every id in `ranges` appears in exactly one batch's pending
/// set, and vice versa; the two are updated together under one lock.
#[derive(Default)]
struct DownloadState {
    ranges: HashMap<u64, ActiveRange>,
    batches: HashMap<u64, BatchState>,
}

impl DownloadState {
    fn fresh_id(&self, rng: &mut StdRng) -> u64 {
        loop {
            let id = rng.gen::<u64>() >> (64 - READ_ID_BITS);
            if !self.ranges.contains_key(&id) && !self.batches.contains_key(&id) {
                return id;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unopened,
    Open,
    Closed,
}

/// Downloads many byte ranges of one object concurrently over a single
/// long-lived read stream.
///
/// Ranges are correlated by client-chosen 56-bit read-ids, validated against
/// their CRC32C checksums, and written to caller-supplied sinks in arrival
/// order. Transient stream failures are recovered transparently: the stream
/// re-opens with its read handle and the unfinished remainders of all
/// in-flight ranges are re-requested under fresh ids.
///
/// Concurrent `download_ranges` calls on one downloader must share a caller
/// supplied lock; see [MultiRangeDownloader::download_ranges].
pub struct MultiRangeDownloader<T: Transport> {
    cfg: ClientConfig,
    lifecycle: Mutex<Lifecycle>,
    stream: AsyncMutex<ReadObjectStream<T>>,
    state: Mutex<DownloadState>,
    rng: Mutex<StdRng>,
    /// Flipped by `close` so in-flight calls observe cancellation at their
    /// next suspension point instead of blocking `close` forever.
    cancel: watch::Sender<bool>,
    /// Object identity as of the last successful open, readable without
    /// touching the stream lock.
    meta: Mutex<(Option<i64>, Option<Bytes>)>,
}

impl<T: Transport> std::fmt::Debug for MultiRangeDownloader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiRangeDownloader").finish()
    }
}

impl<T: Transport> MultiRangeDownloader<T> {
    /// Creates a downloader for `bucket`/`object` without opening it.
    ///
    /// `generation` pins a specific revision; when absent, the server's
    /// current revision is pinned at open. `read_handle` from an earlier
    /// stream makes the open cheaper.
    pub fn new(
        transport: Arc<T>,
        cfg: ClientConfig,
        bucket: &str,
        object: &str,
        generation: Option<i64>,
        read_handle: Option<Bytes>,
    ) -> Result<Self, StorageError> {
        let stream = ReadObjectStream::new(
            transport,
            bucket.to_string(),
            object.to_string(),
            generation,
            read_handle.clone(),
            &MetadataMap::new(),
        )?;
        let (cancel, _) = watch::channel(false);
        Ok(MultiRangeDownloader {
            cfg,
            lifecycle: Mutex::new(Lifecycle::Unopened),
            stream: AsyncMutex::new(stream),
            state: Mutex::new(DownloadState::default()),
            rng: Mutex::new(StdRng::from_entropy()),
            cancel,
            meta: Mutex::new((generation, read_handle)),
        })
    }

    /// Creates a downloader and opens it in one call.
    pub async fn open_new(
        transport: Arc<T>,
        cfg: ClientConfig,
        bucket: &str,
        object: &str,
        generation: Option<i64>,
        read_handle: Option<Bytes>,
    ) -> Result<Self, StorageError> {
        let mrd = Self::new(transport, cfg, bucket, object, generation, read_handle)?;
        mrd.open().await?;
        Ok(mrd)
    }

    /// Replaces the caller-supplied metadata attached to every stream open.
    pub fn with_call_metadata(self, metadata: &MetadataMap) -> Result<Self, StorageError> {
        self.stream
            .try_lock()
            .expect("downloader not yet shared")
            .set_extra_metadata(metadata)?;
        Ok(self)
    }

    /// Opens the underlying read stream, retrying transient failures.
    pub async fn open(&self) -> Result<(), StorageError> {
        if !*CRC32C_ACCELERATED {
            return Err(StorageError::RuntimeMissing);
        }
        let mut stream = self.stream.lock().await;
        match *self.lifecycle.lock().expect("lock poisoned") {
            Lifecycle::Unopened => {}
            Lifecycle::Open => return Err(StorageError::AlreadyOpen),
            Lifecycle::Closed => return Err(StorageError::Closed),
        }

        let mut retry = self.cfg.retry().into_retry_stream();
        loop {
            match stream.open().await {
                Ok(()) => break,
                Err(err) if err.is_transient() => {
                    if retry.budget_exhausted(self.cfg.retry_deadline) {
                        return Err(err);
                    }
                    if let StorageError::Transient(status) = &err {
                        stream.absorb_redirect(status);
                    }
                    debug!(
                        "read stream open failed, retrying in {:?}: {}",
                        retry.next_sleep(),
                        err
                    );
                    stream.reset();
                    retry = retry.sleep().await;
                }
                Err(err) => return Err(err),
            }
        }
        *self.meta.lock().expect("lock poisoned") = (stream.generation(), stream.read_handle());
        *self.lifecycle.lock().expect("lock poisoned") = Lifecycle::Open;
        Ok(())
    }

    /// Downloads `ranges` into their sinks, returning per-range results in
    /// input order once every range has fully drained.
    ///
    /// Callers running `download_ranges` concurrently on one downloader must
    /// pass clones of one shared `lock`; it serializes both the batched sends
    /// and the receive-dispatch sections so sub-requests from different calls
    /// cannot interleave mid-batch. Serial callers may pass `None`, which
    /// uses a fresh lock per call.
    pub async fn download_ranges(
        &self,
        ranges: Vec<RangeRequest>,
        lock: Option<Arc<AsyncMutex<()>>>,
    ) -> Result<Vec<RangeResult>, StorageError> {
        if ranges.len() > MAX_READ_RANGES_PER_CALL {
            return Err(StorageError::TooManyRanges {
                count: ranges.len(),
                max: MAX_READ_RANGES_PER_CALL,
            });
        }
        if *self.lifecycle.lock().expect("lock poisoned") != Lifecycle::Open {
            return Err(StorageError::NotOpen);
        }
        let lock = lock.unwrap_or_default();

        // Register the whole batch before anything hits the wire, so a
        // concurrent caller that receives our frames finds the sinks and the
        // pending set in place, and so resumption covers not-yet-sent ranges.
        let (batch_id, wire_ranges) = {
            let mut state = self.state.lock().expect("lock poisoned");
            let mut rng = self.rng.lock().expect("lock poisoned");
            let batch_id = state.fresh_id(&mut rng);
            // Reserve the batch id right away so the read-ids drawn below
            // are checked against it too; the placeholder is overwritten
            // once the batch is assembled.
            state.batches.insert(
                batch_id,
                BatchState {
                    pending: HashSet::new(),
                    results: Vec::new(),
                },
            );
            let mut pending = HashSet::with_capacity(ranges.len());
            let mut results = Vec::with_capacity(ranges.len());
            let mut wire_ranges = Vec::with_capacity(ranges.len());
            for (slot, range) in ranges.into_iter().enumerate() {
                let read_id = state.fresh_id(&mut rng);
                pending.insert(read_id);
                results.push(RangeResult {
                    bytes_requested: range.length,
                    bytes_written: 0,
                });
                wire_ranges.push(proto::ReadRange {
                    read_offset: range.offset,
                    read_length: range.length,
                    read_id,
                });
                state.ranges.insert(
                    read_id,
                    ActiveRange {
                        batch_id,
                        slot,
                        offset: range.offset,
                        length: range.length,
                        written: 0,
                        sink: range.sink,
                    },
                );
            }
            state.batches.insert(batch_id, BatchState { pending, results });
            (batch_id, wire_ranges)
        };

        match self.run_batch(batch_id, wire_ranges, &lock).await {
            Ok(()) => {
                let mut state = self.state.lock().expect("lock poisoned");
                let batch = state
                    .batches
                    .remove(&batch_id)
                    .expect("completed batch is still registered");
                Ok(batch.results)
            }
            Err(err) => {
                // Drop what is left of the batch; bytes already written to
                // sinks stay for the caller to inspect.
                {
                    let mut state = self.state.lock().expect("lock poisoned");
                    if let Some(batch) = state.batches.remove(&batch_id) {
                        for read_id in batch.pending {
                            state.ranges.remove(&read_id);
                        }
                    }
                }
                if matches!(err, StorageError::DataCorruption { .. }) {
                    self.close_for_corruption().await;
                }
                Err(err)
            }
        }
    }

    async fn run_batch(
        &self,
        batch_id: u64,
        wire_ranges: Vec<proto::ReadRange>,
        lock: &Arc<AsyncMutex<()>>,
    ) -> Result<(), StorageError> {
        let mut cancel = self.cancel.subscribe();

        // Send the sub-requests back-to-back while holding the lock.
        {
            let _guard = lock.lock().await;
            let mut stream = self.stream.lock().await;
            for chunk in wire_ranges.chunks(MAX_READ_RANGES_PER_REQUEST) {
                match stream.send_ranges(chunk.to_vec()) {
                    Ok(()) => {}
                    Err(err) if err.is_transient() => {
                        // Resumption re-requests every registered range,
                        // including the chunks never sent.
                        self.resume(&mut stream, err).await?;
                        break;
                    }
                    // The queue died with the RPC. Fall through to the
                    // receive loop, which drains any frames that beat the
                    // failure and then observes the terminal status.
                    Err(StorageError::Closed) => break,
                    Err(StorageError::NotOpen) => return Err(StorageError::Cancelled),
                    Err(err) => return Err(err),
                }
            }
        }

        loop {
            if self.batch_drained(batch_id) {
                return Ok(());
            }
            let _guard = lock.lock().await;
            // A concurrent holder of the lock may have drained our frames.
            if self.batch_drained(batch_id) {
                return Ok(());
            }
            let mut stream = self.stream.lock().await;
            let received = tokio::select! {
                biased;
                _ = cancel.changed() => return Err(StorageError::Cancelled),
                received = stream.recv() => received,
            };
            match received {
                Ok(Some(response)) => self.dispatch(response)?,
                Ok(None) => {
                    return Err(StorageError::Protocol(
                        "read stream closed with ranges outstanding".into(),
                    ))
                }
                Err(err) if err.is_transient() => self.resume(&mut stream, err).await?,
                // `close` won the race for the stream before we subscribed.
                Err(StorageError::NotOpen) => return Err(StorageError::Cancelled),
                Err(err) => return Err(err),
            }
        }
    }

    fn batch_drained(&self, batch_id: u64) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state
            .batches
            .get(&batch_id)
            .map_or(true, |batch| batch.pending.is_empty())
    }

    /// Routes every frame of `response` to its range's sink, validating
    /// checksums and retiring ranges whose final frame arrived.
    fn dispatch(&self, response: proto::BidiReadObjectResponse) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("lock poisoned");
        for frame in response.object_data_ranges {
            let range = frame.read_range.ok_or_else(|| {
                StorageError::Protocol("data frame carried no read_range".into())
            })?;
            let read_id = range.read_id;
            let data = frame.checksummed_data.unwrap_or_default();
            if frame.range_end {
                let mut active = state.ranges.remove(&read_id).ok_or_else(|| {
                    StorageError::Protocol(format!("data frame for unknown read_id {read_id}"))
                })?;
                write_frame(&mut active, read_id, &data)?;
                let batch = state
                    .batches
                    .get_mut(&active.batch_id)
                    .expect("active range's batch is registered");
                batch.pending.remove(&read_id);
                batch.results[active.slot].bytes_written = active.written;
            } else {
                let active = state.ranges.get_mut(&read_id).ok_or_else(|| {
                    StorageError::Protocol(format!("data frame for unknown read_id {read_id}"))
                })?;
                write_frame(active, read_id, &data)?;
            }
        }
        Ok(())
    }

    /// Re-establishes the stream after a transient failure and re-requests
    /// the unfinished remainder of every in-flight range under fresh ids.
    async fn resume(
        &self,
        stream: &mut ReadObjectStream<T>,
        err: StorageError,
    ) -> Result<(), StorageError> {
        let mut last = match err {
            StorageError::Transient(status) => status,
            _ => unreachable!("resume is only entered on transient errors"),
        };
        let mut retry = self.cfg.retry().into_retry_stream();
        loop {
            if retry.budget_exhausted(self.cfg.retry_deadline) {
                warn!(
                    "read stream not recovered within deadline after {} attempts: {}",
                    retry.attempt(),
                    last
                );
                return Err(StorageError::Transient(last));
            }
            stream.absorb_redirect(&last);
            info!(
                "read stream failed, reconnecting in {:?}: {}",
                retry.next_sleep(),
                last
            );
            stream.reset();
            retry = retry.sleep().await;
            match stream.open().await {
                Ok(()) => {}
                Err(StorageError::Transient(status)) => {
                    last = status;
                    continue;
                }
                Err(err) => return Err(err),
            }

            let wire_ranges = self.reissue_pending_ranges();
            let mut send_failure = None;
            for chunk in wire_ranges.chunks(MAX_READ_RANGES_PER_REQUEST) {
                match stream.send_ranges(chunk.to_vec()) {
                    Ok(()) => {}
                    Err(StorageError::Transient(status)) => {
                        send_failure = Some(status);
                        break;
                    }
                    Err(StorageError::Closed) => {
                        send_failure =
                            Some(tonic::Status::unavailable("stream closed while resubmitting"));
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            match send_failure {
                Some(status) => last = status,
                None => {
                    *self.meta.lock().expect("lock poisoned") =
                        (stream.generation(), stream.read_handle());
                    return Ok(());
                }
            }
        }
    }

    /// Swaps every pending range onto a fresh read-id and builds the wire
    /// ranges for its unfinished remainder.
    fn reissue_pending_ranges(&self) -> Vec<proto::ReadRange> {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut rng = self.rng.lock().expect("lock poisoned");
        let old_ids: Vec<u64> = state.ranges.keys().copied().collect();
        let mut wire_ranges = Vec::with_capacity(old_ids.len());
        for old_id in old_ids {
            let active = state
                .ranges
                .remove(&old_id)
                .expect("id was just enumerated");
            // A bounded range that already received all its bytes only lost
            // its range_end marker to the failure; re-requesting zero bytes
            // would instead read to the end of the object, so retire it here.
            if active.length > 0 && active.written >= active.length {
                let batch = state
                    .batches
                    .get_mut(&active.batch_id)
                    .expect("active range's batch is registered");
                batch.pending.remove(&old_id);
                batch.results[active.slot].bytes_written = active.written;
                continue;
            }
            let new_id = state.fresh_id(&mut rng);
            let batch = state
                .batches
                .get_mut(&active.batch_id)
                .expect("active range's batch is registered");
            batch.pending.remove(&old_id);
            batch.pending.insert(new_id);
            wire_ranges.push(proto::ReadRange {
                read_offset: active.offset + active.written,
                read_length: if active.length == 0 {
                    0
                } else {
                    active.length - active.written
                },
                read_id: new_id,
            });
            state.ranges.insert(new_id, active);
        }
        wire_ranges
    }

    async fn close_for_corruption(&self) {
        self.cancel.send_replace(true);
        let mut stream = self.stream.lock().await;
        stream.close();
        *self.lifecycle.lock().expect("lock poisoned") = Lifecycle::Closed;
    }

    /// Closes the underlying stream. In-flight `download_ranges` calls fail
    /// with [StorageError::Cancelled].
    pub async fn close(&self) -> Result<(), StorageError> {
        if *self.lifecycle.lock().expect("lock poisoned") != Lifecycle::Open {
            return Err(StorageError::NotOpen);
        }
        self.cancel.send_replace(true);
        let mut stream = self.stream.lock().await;
        stream.close();
        *self.lifecycle.lock().expect("lock poisoned") = Lifecycle::Closed;
        Ok(())
    }

    pub fn is_stream_open(&self) -> bool {
        *self.lifecycle.lock().expect("lock poisoned") == Lifecycle::Open
    }

    /// The generation pinned at open, if any.
    pub fn generation(&self) -> Option<i64> {
        self.meta.lock().expect("lock poisoned").0
    }

    /// The server-issued handle for fast re-opens, if one was received.
    pub fn read_handle(&self) -> Option<Bytes> {
        self.meta.lock().expect("lock poisoned").1.clone()
    }
}

fn write_frame(
    active: &mut ActiveRange,
    read_id: u64,
    data: &proto::ChecksummedData,
) -> Result<(), StorageError> {
    if let Some(server_crc32c) = data.crc32c {
        let client_crc32c = crc32c::crc32c(&data.content);
        if client_crc32c != server_crc32c {
            return Err(StorageError::DataCorruption {
                read_id,
                server_crc32c,
                client_crc32c,
            });
        }
    }
    active
        .sink
        .push_chunk(&data.content)
        .map_err(StorageError::Io)?;
    active.written += data.content.len() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_56_bit_and_unique() {
        let mut state = DownloadState::default();
        let mut rng = StdRng::from_entropy();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = state.fresh_id(&mut rng);
            assert!(id < (1 << READ_ID_BITS));
            assert!(seen.insert(id), "collision on {id}");
            // Track the id so the generator must avoid it from now on.
            state.batches.insert(
                id,
                BatchState {
                    pending: HashSet::new(),
                    results: Vec::new(),
                },
            );
        }
    }

    #[test]
    fn checksum_mismatch_identifies_read_id() {
        let mut active = ActiveRange {
            batch_id: 1,
            slot: 0,
            offset: 0,
            length: 4,
            written: 0,
            sink: Box::new(Vec::new()),
        };
        let data = proto::ChecksummedData {
            content: Bytes::from_static(b"dead"),
            crc32c: Some(crc32c::crc32c(b"beef")),
        };
        let err = write_frame(&mut active, 77, &data).unwrap_err();
        match &err {
            StorageError::DataCorruption { read_id, .. } => assert_eq!(*read_id, 77),
            other => panic!("expected DataCorruption, got {other}"),
        }
        assert!(err.to_string().contains("read_id 77"));
        // Nothing from the bad frame reached the sink.
        assert_eq!(active.written, 0);
    }

    #[test]
    fn frames_without_checksum_are_accepted() {
        let mut active = ActiveRange {
            batch_id: 1,
            slot: 0,
            offset: 0,
            length: 4,
            written: 0,
            sink: Box::new(Vec::new()),
        };
        let data = proto::ChecksummedData {
            content: Bytes::from_static(b"okay"),
            crc32c: None,
        };
        write_frame(&mut active, 1, &data).unwrap();
        assert_eq!(active.written, 4);
    }
}
