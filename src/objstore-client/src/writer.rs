// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Incremental appends to an object over one write stream.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use mz_objstore_proto::bidi_write_object_request::Data;
use mz_objstore_proto::{BidiWriteObjectRequest, ChecksummedData};
use tokio::io::{AsyncRead, AsyncReadExt};
use tonic::metadata::MetadataMap;
use tracing::{debug, info, warn};

use crate::cfg::ClientConfig;
use crate::error::StorageError;
use crate::transport::Transport;
use crate::write_stream::WriteObjectStream;

/// Where an [AppendableObjectWriter] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Created but not yet opened.
    Unopened,
    /// Open and accepting appends.
    Open,
    /// The stream was terminated without finalizing; the object remains
    /// appendable through a new writer carrying the same generation.
    HalfClosed,
    /// The object was finalized and is immutable. Terminal.
    Finalized,
    /// An unrecoverable error occurred. Terminal.
    Failed,
}

/// A frame that has been sent but whose durability the server has not yet
/// acknowledged. Retained so a reconnect can retransmit everything above the
/// persisted watermark.
#[derive(Debug)]
struct ReplayFrame {
    offset: u64,
    data: Bytes,
}

/// Appends bytes to an object incrementally over a single long-lived write
/// stream.
///
/// Appends are buffered until [ClientConfig::flush_interval_bytes]
/// accumulate, then framed and pipelined without waiting for per-frame
/// acknowledgments; the durable watermark advances as the server acks.
/// [AppendableObjectWriter::flush] forces buffered bytes out and waits for
/// the watermark to catch up. Closing without finalizing leaves the object
/// appendable by a later writer opened with the same generation;
/// [AppendableObjectWriter::finalize] makes it immutable.
///
/// Transient stream failures are recovered transparently: the stream
/// re-opens with its write handle, refreshes the persisted size, and
/// retransmits every unacknowledged frame. Bytes appear in the object exactly
/// in append order, and `persisted_size` never decreases.
pub struct AppendableObjectWriter<T: Transport> {
    cfg: ClientConfig,
    stream: WriteObjectStream<T>,
    state: WriterState,
    /// Appended bytes not yet framed onto the wire.
    unflushed: BytesMut,
    /// Sent-but-unacknowledged frames, oldest first.
    replay: VecDeque<ReplayFrame>,
    /// The object offset the next emitted frame will carry.
    sent_offset: u64,
    /// Total bytes accepted by `append`, including still-buffered ones.
    total_appended: u64,
}

impl<T: Transport> std::fmt::Debug for AppendableObjectWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendableObjectWriter")
            .field("state", &self.state)
            .field("sent_offset", &self.sent_offset)
            .field("total_appended", &self.total_appended)
            .finish()
    }
}

impl<T: Transport> AppendableObjectWriter<T> {
    /// Creates a writer for `bucket`/`object` without opening it.
    ///
    /// A `generation` resumes an existing appendable object; `None` creates
    /// the object at open. A `write_handle` from an earlier stream makes the
    /// open cheaper.
    pub fn new(
        transport: Arc<T>,
        cfg: ClientConfig,
        bucket: &str,
        object: &str,
        generation: Option<i64>,
        write_handle: Option<Bytes>,
    ) -> Result<Self, StorageError> {
        let stream = WriteObjectStream::new(
            transport,
            bucket.to_string(),
            object.to_string(),
            generation,
            write_handle,
            &MetadataMap::new(),
        )?;
        Ok(AppendableObjectWriter {
            cfg,
            stream,
            state: WriterState::Unopened,
            unflushed: BytesMut::new(),
            replay: VecDeque::new(),
            sent_offset: 0,
            total_appended: 0,
        })
    }

    /// Creates a writer and opens it in one call.
    pub async fn open_new(
        transport: Arc<T>,
        cfg: ClientConfig,
        bucket: &str,
        object: &str,
        generation: Option<i64>,
        write_handle: Option<Bytes>,
    ) -> Result<Self, StorageError> {
        let mut writer = Self::new(transport, cfg, bucket, object, generation, write_handle)?;
        writer.open().await?;
        Ok(writer)
    }

    /// Replaces the caller-supplied metadata attached to every stream open.
    pub fn with_call_metadata(mut self, metadata: &MetadataMap) -> Result<Self, StorageError> {
        self.stream.set_extra_metadata(metadata)?;
        Ok(self)
    }

    /// Opens the write stream and performs the state-lookup handshake; after
    /// this returns, [AppendableObjectWriter::persisted_size] reflects what
    /// the server has durably stored.
    pub async fn open(&mut self) -> Result<(), StorageError> {
        match self.state {
            WriterState::Unopened => {}
            WriterState::Open => return Err(StorageError::AlreadyOpen),
            _ => return Err(StorageError::Closed),
        }
        let mut retry = self.cfg.retry().into_retry_stream();
        loop {
            match self.stream.open().await {
                Ok(()) => break,
                Err(err) if err.is_transient() => {
                    if retry.budget_exhausted(self.cfg.retry_deadline) {
                        return Err(err);
                    }
                    if let StorageError::Transient(status) = &err {
                        self.stream.absorb_redirect(status);
                    }
                    debug!(
                        "append stream open failed, retrying in {:?}: {}",
                        retry.next_sleep(),
                        err
                    );
                    self.stream.reset();
                    retry = retry.sleep().await;
                }
                Err(err) => return Err(err),
            }
        }
        self.sent_offset = self.stream.persisted_size();
        self.total_appended = self.sent_offset;
        self.state = WriterState::Open;
        Ok(())
    }

    /// Buffers `data` for appending. Once the buffer crosses the flush
    /// interval it is framed and sent, pipelined ahead of acknowledgment.
    pub async fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.check_open()?;
        self.unflushed.extend_from_slice(data);
        self.total_appended += data.len() as u64;
        if self.unflushed.len() >= self.cfg.flush_interval_bytes {
            self.emit_buffered(false, false).await?;
        }
        self.drain_ready_acks().await?;
        Ok(())
    }

    /// Appends everything `reader` yields, in flush-interval-sized chunks.
    pub async fn append_from_reader<R>(&mut self, reader: &mut R) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut total = 0u64;
        let mut chunk = BytesMut::with_capacity(self.cfg.flush_interval_bytes);
        loop {
            let n = reader.read_buf(&mut chunk).await.map_err(StorageError::Io)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if chunk.len() >= self.cfg.flush_interval_bytes {
                self.append(&chunk.split()).await?;
            }
        }
        if !chunk.is_empty() {
            self.append(&chunk.split()).await?;
        }
        Ok(total)
    }

    /// Asks the server for the current durable size and returns it.
    pub async fn state_lookup(&mut self) -> Result<u64, StorageError> {
        self.check_open()?;
        loop {
            self.send_with_resume(BidiWriteObjectRequest {
                state_lookup: true,
                ..Default::default()
            })
            .await?;
            match self.stream.recv().await {
                Ok(Some(response)) => {
                    let persisted = self.apply_ack(&response)?;
                    return Ok(persisted);
                }
                Ok(None) => {
                    self.state = WriterState::Failed;
                    return Err(StorageError::Protocol(
                        "append stream closed during state lookup".into(),
                    ));
                }
                Err(err) if err.is_transient() => {
                    // The reconnect handshake refreshed the state, but answer
                    // from a live stream: loop and ask again.
                    self.resume(err).await?;
                }
                Err(err) => {
                    self.state = WriterState::Failed;
                    return Err(err);
                }
            }
        }
    }

    /// Sends all buffered bytes and waits for the server to acknowledge
    /// everything appended so far. Returns the new persisted size.
    pub async fn flush(&mut self) -> Result<u64, StorageError> {
        self.check_open()?;
        self.emit_buffered(true, false).await?;
        self.await_persisted(self.sent_offset).await?;
        Ok(self.stream.persisted_size())
    }

    /// Flushes and terminates the stream.
    ///
    /// With `finalize_on_close` the last frame carries `finish_write` and the
    /// object becomes immutable; otherwise the stream is half-closed and the
    /// object stays appendable via a new writer bearing the same generation.
    /// Either way the writer accepts no further operations.
    pub async fn close(&mut self, finalize_on_close: bool) -> Result<u64, StorageError> {
        match self.state {
            WriterState::Open => {}
            WriterState::Unopened => return Err(StorageError::NotOpen),
            _ => return Err(StorageError::Closed),
        }
        if finalize_on_close {
            self.emit_buffered(false, true).await?;
            self.await_finalized().await?;
            self.stream.close();
            self.state = WriterState::Finalized;
            info!(
                "object finalized at {} bytes (generation {:?})",
                self.stream.persisted_size(),
                self.stream.generation(),
            );
        } else {
            self.emit_buffered(true, false).await?;
            self.await_persisted(self.sent_offset).await?;
            self.stream.close();
            self.state = WriterState::HalfClosed;
        }
        Ok(self.stream.persisted_size())
    }

    /// Finalizes the object; no appends are permitted afterwards. Returns the
    /// final persisted size.
    pub async fn finalize(&mut self) -> Result<u64, StorageError> {
        self.close(true).await
    }

    /// The durable byte length of the object as last reported by the server.
    pub fn persisted_size(&self) -> u64 {
        self.stream.persisted_size()
    }

    /// The object's generation, once known.
    pub fn generation(&self) -> Option<i64> {
        self.stream.generation()
    }

    /// The server-issued handle for resuming this append stream, if any.
    pub fn write_handle(&self) -> Option<Bytes> {
        self.stream.write_handle()
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn is_stream_open(&self) -> bool {
        self.state == WriterState::Open
    }

    fn check_open(&self) -> Result<(), StorageError> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Unopened => Err(StorageError::NotOpen),
            _ => Err(StorageError::Closed),
        }
    }

    /// Frames the unflushed buffer into chunk-sized requests and sends them.
    /// `flush`/`finish_write` ride on the last frame, or on a bare frame if
    /// nothing is buffered.
    async fn emit_buffered(&mut self, flush: bool, finish_write: bool) -> Result<(), StorageError> {
        let mut chunks = Vec::new();
        while !self.unflushed.is_empty() {
            let take = std::cmp::min(self.unflushed.len(), self.cfg.max_write_chunk_bytes);
            chunks.push(self.unflushed.split_to(take).freeze());
        }
        if chunks.is_empty() {
            if flush || finish_write {
                self.send_with_resume(BidiWriteObjectRequest {
                    write_offset: self.sent_offset,
                    flush,
                    finish_write,
                    ..Default::default()
                })
                .await?;
            }
            return Ok(());
        }
        let last = chunks.len() - 1;
        for (i, content) in chunks.into_iter().enumerate() {
            let offset = self.sent_offset;
            let len = content.len() as u64;
            let request = BidiWriteObjectRequest {
                write_offset: offset,
                flush: flush && i == last,
                finish_write: finish_write && i == last,
                data: Some(Data::ChecksummedData(ChecksummedData {
                    crc32c: Some(crc32c::crc32c(&content)),
                    content: content.clone(),
                })),
                ..Default::default()
            };
            self.send_with_resume(request).await?;
            self.replay.push_back(ReplayFrame {
                offset,
                data: content,
            });
            self.sent_offset = offset + len;
        }
        Ok(())
    }

    async fn send_with_resume(
        &mut self,
        request: BidiWriteObjectRequest,
    ) -> Result<(), StorageError> {
        loop {
            match self.stream.send(request.clone()) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => self.resume(err).await?,
                // The queue died with the RPC; the terminal status is waiting
                // on the response side, possibly behind acknowledgments that
                // beat the failure.
                Err(StorageError::Closed) => match self.stream.recv().await {
                    Ok(Some(response)) => {
                        self.apply_ack(&response)?;
                    }
                    Ok(None) => {
                        self.state = WriterState::Failed;
                        return Err(StorageError::Protocol(
                            "append stream closed mid-write".into(),
                        ));
                    }
                    Err(err) if err.is_transient() => self.resume(err).await?,
                    Err(err) => {
                        self.state = WriterState::Failed;
                        return Err(err);
                    }
                },
                Err(err) => {
                    self.state = WriterState::Failed;
                    return Err(err);
                }
            }
        }
    }

    /// Applies any acknowledgments that have already arrived, without
    /// blocking the append path.
    async fn drain_ready_acks(&mut self) -> Result<(), StorageError> {
        loop {
            match self.stream.recv().now_or_never() {
                None | Some(Ok(None)) => return Ok(()),
                Some(Ok(Some(response))) => {
                    self.apply_ack(&response)?;
                }
                Some(Err(err)) if err.is_transient() => {
                    self.resume(err).await?;
                    return Ok(());
                }
                Some(Err(err)) => {
                    self.state = WriterState::Failed;
                    return Err(err);
                }
            }
        }
    }

    /// Blocks until the persisted watermark reaches `target`.
    async fn await_persisted(&mut self, target: u64) -> Result<(), StorageError> {
        while self.stream.persisted_size() < target {
            match self.stream.recv().await {
                Ok(Some(response)) => {
                    self.apply_ack(&response)?;
                }
                Ok(None) => {
                    self.state = WriterState::Failed;
                    return Err(StorageError::Protocol(
                        "append stream closed before acknowledgment".into(),
                    ));
                }
                Err(err) if err.is_transient() => {
                    // The recovery retransmits the unacknowledged tail with a
                    // flush marker, so progress resumes on the new stream.
                    self.resume(err).await?;
                }
                Err(err) => {
                    self.state = WriterState::Failed;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Blocks until the server confirms finalization with the full resource.
    async fn await_finalized(&mut self) -> Result<(), StorageError> {
        loop {
            if let Some(resource) = self.stream.resource() {
                if resource.finalized {
                    return Ok(());
                }
            }
            match self.stream.recv().await {
                Ok(Some(response)) => {
                    self.apply_ack(&response)?;
                }
                Ok(None) => {
                    self.state = WriterState::Failed;
                    return Err(StorageError::Protocol(
                        "append stream closed before finalization".into(),
                    ));
                }
                Err(err) if err.is_transient() => {
                    self.resume(err).await?;
                    // Re-request finalization on the recovered stream.
                    self.send_with_resume(BidiWriteObjectRequest {
                        write_offset: self.sent_offset,
                        finish_write: true,
                        ..Default::default()
                    })
                    .await?;
                }
                Err(err) => {
                    self.state = WriterState::Failed;
                    return Err(err);
                }
            }
        }
    }

    fn apply_ack(
        &mut self,
        response: &mz_objstore_proto::BidiWriteObjectResponse,
    ) -> Result<u64, StorageError> {
        let persisted = match self.stream.apply_response(response) {
            Ok(persisted) => persisted,
            Err(err) => {
                self.state = WriterState::Failed;
                return Err(err);
            }
        };
        // Everything at or below the watermark is durable and need never be
        // replayed.
        while let Some(front) = self.replay.front() {
            if front.offset + front.data.len() as u64 <= persisted {
                self.replay.pop_front();
            } else {
                break;
            }
        }
        Ok(persisted)
    }

    /// Re-establishes the stream after a transient failure: re-opens with the
    /// write handle, refreshes the persisted size via the handshake's state
    /// lookup, and retransmits every frame above the watermark.
    async fn resume(&mut self, err: StorageError) -> Result<(), StorageError> {
        let mut last = match err {
            StorageError::Transient(status) => status,
            _ => unreachable!("resume is only entered on transient errors"),
        };
        let mut retry = self.cfg.retry().into_retry_stream();
        'reconnect: loop {
            if retry.budget_exhausted(self.cfg.retry_deadline) {
                warn!(
                    "append stream not recovered within deadline after {} attempts: {}",
                    retry.attempt(),
                    last
                );
                self.state = WriterState::Failed;
                return Err(StorageError::Transient(last));
            }
            self.stream.absorb_redirect(&last);
            info!(
                "append stream failed, reconnecting in {:?}: {}",
                retry.next_sleep(),
                last
            );
            self.stream.reset();
            retry = retry.sleep().await;
            match self.stream.open().await {
                Ok(()) => {}
                Err(StorageError::Transient(status)) => {
                    last = status;
                    continue;
                }
                Err(err) => {
                    self.state = WriterState::Failed;
                    return Err(err);
                }
            }

            // The handshake may have advanced the watermark past frames we
            // were still holding.
            let persisted = self.stream.persisted_size();
            while let Some(front) = self.replay.front() {
                if front.offset + front.data.len() as u64 <= persisted {
                    self.replay.pop_front();
                } else {
                    break;
                }
            }

            let frame_count = self.replay.len();
            for (i, frame) in self.replay.iter().enumerate() {
                // The front frame may be partially durable; retransmit only
                // the remainder.
                let (offset, data) = if frame.offset < persisted {
                    let skip = (persisted - frame.offset) as usize;
                    (persisted, frame.data.slice(skip..))
                } else {
                    (frame.offset, frame.data.clone())
                };
                let request = BidiWriteObjectRequest {
                    write_offset: offset,
                    // Force durability of the replayed tail so a waiting
                    // flush observes progress.
                    flush: i == frame_count - 1,
                    data: Some(Data::ChecksummedData(ChecksummedData {
                        crc32c: Some(crc32c::crc32c(&data)),
                        content: data,
                    })),
                    ..Default::default()
                };
                match self.stream.send(request) {
                    Ok(()) => {}
                    Err(StorageError::Transient(status)) => {
                        last = status;
                        continue 'reconnect;
                    }
                    Err(StorageError::Closed) => {
                        last = tonic::Status::unavailable("stream closed while replaying");
                        continue 'reconnect;
                    }
                    Err(err) => {
                        self.state = WriterState::Failed;
                        return Err(err);
                    }
                }
            }
            info!(
                "append stream recovered at persisted size {} ({} frames replayed)",
                persisted, frame_count,
            );
            return Ok(());
        }
    }
}
