// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The read-side specialization of the bidi stream.

use std::sync::Arc;

use bytes::Bytes;
use mz_objstore_proto::{
    decode_read_redirect, BidiReadObjectRequest, BidiReadObjectResponse, BidiReadObjectSpec,
    ReadHandle, ReadRange,
};
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tracing::{debug, info};

use crate::bidi::{request_queue, BidiStream};
use crate::error::StorageError;
use crate::transport::Transport;

/// Builds the routing metadata every stream to `bucket` must carry, merged
/// with any caller-supplied entries.
pub(crate) fn routing_metadata(
    bucket: &str,
    extra: &MetadataMap,
) -> Result<MetadataMap, StorageError> {
    let mut metadata = extra.clone();
    let value = format!("bucket=projects/_/buckets/{bucket}")
        .try_into()
        .map_err(|_| {
            StorageError::InvalidArgument(format!("bucket name is not valid metadata: {bucket}"))
        })?;
    metadata.insert("x-goog-request-params", value);
    Ok(metadata)
}

/// A bidi read stream pinned to one object.
///
/// `open` performs the metadata handshake: the first request names the
/// object (plus any handle from an earlier stream), the first response pins
/// the generation and hands back a fresh read handle. Re-opening after a
/// failure reuses the handle to skip the server-side metadata exchange.
pub(crate) struct ReadObjectStream<T: Transport> {
    transport: Arc<T>,
    bucket: String,
    object: String,
    generation: Option<i64>,
    read_handle: Option<Bytes>,
    routing_token: Option<String>,
    metadata: MetadataMap,
    conn: Option<BidiStream<BidiReadObjectRequest, T::ReadStream>>,
}

impl<T: Transport> ReadObjectStream<T> {
    pub fn new(
        transport: Arc<T>,
        bucket: String,
        object: String,
        generation: Option<i64>,
        read_handle: Option<Bytes>,
        extra_metadata: &MetadataMap,
    ) -> Result<Self, StorageError> {
        let metadata = routing_metadata(&bucket, extra_metadata)?;
        Ok(ReadObjectStream {
            transport,
            bucket,
            object,
            generation,
            read_handle,
            routing_token: None,
            metadata,
            conn: None,
        })
    }

    pub async fn open(&mut self) -> Result<(), StorageError> {
        if self.conn.is_some() {
            return Err(StorageError::AlreadyOpen);
        }
        let spec = BidiReadObjectSpec {
            bucket: format!("projects/_/buckets/{}", self.bucket),
            object: self.object.clone(),
            generation: self.generation,
            read_handle: self.read_handle.clone().map(|handle| ReadHandle { handle }),
            routing_token: self.routing_token.clone(),
        };
        let initial = BidiReadObjectRequest {
            read_object_spec: Some(spec),
            read_ranges: Vec::new(),
        };
        debug!(
            "opening read stream for {}/{} (handle: {})",
            self.bucket,
            self.object,
            self.read_handle.is_some(),
        );
        let (queue, requests) = request_queue(Some(initial));
        let call = self
            .transport
            .bidi_read_object(requests, self.metadata.clone())
            .await
            .map_err(StorageError::from_open_status)?;
        let mut conn = BidiStream::new(queue, call);

        // The handshake: the first response carries object metadata and the
        // re-open handle.
        let first = match conn.recv().await? {
            Some(first) => first,
            None => {
                return Err(StorageError::Protocol(
                    "read stream closed before initial metadata".into(),
                ))
            }
        };
        self.absorb_handshake(&first);
        info!("read stream for {}/{} connected", self.bucket, self.object);
        self.conn = Some(conn);
        Ok(())
    }

    fn absorb_handshake(&mut self, response: &BidiReadObjectResponse) {
        if let Some(object) = &response.metadata {
            // The generation is pinned on first discovery so every re-open
            // observes the same revision.
            if self.generation.is_none() {
                self.generation = Some(object.generation);
            }
        }
        if let Some(handle) = &response.read_handle {
            self.read_handle = Some(handle.handle.clone());
        }
    }

    /// Adopts the handle and routing token from a server-issued redirect, if
    /// `status` carries one.
    pub fn absorb_redirect(&mut self, status: &tonic::Status) {
        if let Some(redirect) = decode_read_redirect(status) {
            debug!(
                "read stream for {}/{} redirected (token: {:?})",
                self.bucket, self.object, redirect.routing_token,
            );
            if let Some(handle) = redirect.read_handle {
                self.read_handle = Some(handle.handle);
            }
            if redirect.routing_token.is_some() {
                self.routing_token = redirect.routing_token;
            }
        }
    }

    /// Merges caller-supplied entries into the metadata attached to every
    /// stream open. The bucket routing entry always wins.
    pub(crate) fn set_extra_metadata(&mut self, extra: &MetadataMap) -> Result<(), StorageError> {
        for entry in extra.iter() {
            match entry {
                KeyAndValueRef::Ascii(key, value) => {
                    self.metadata.insert(key.clone(), value.clone());
                }
                KeyAndValueRef::Binary(key, value) => {
                    self.metadata.insert_bin(key.clone(), value.clone());
                }
            }
        }
        self.metadata = routing_metadata(&self.bucket, &self.metadata)?;
        Ok(())
    }

    /// Enqueues one sub-request of ranges.
    pub fn send_ranges(&mut self, read_ranges: Vec<ReadRange>) -> Result<(), StorageError> {
        let conn = self.conn.as_mut().ok_or(StorageError::NotOpen)?;
        conn.send(BidiReadObjectRequest {
            read_object_spec: None,
            read_ranges,
        })
    }

    pub async fn recv(&mut self) -> Result<Option<BidiReadObjectResponse>, StorageError> {
        let conn = self.conn.as_mut().ok_or(StorageError::NotOpen)?;
        conn.recv().await
    }

    /// Drops the current connection so a later `open` can rebuild it. Any
    /// terminal error already observed is discarded with it.
    pub fn reset(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }

    pub fn close(&mut self) {
        self.reset();
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    pub fn read_handle(&self) -> Option<Bytes> {
        self.read_handle.clone()
    }
}
