// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The append-side specialization of the bidi stream.

use std::sync::Arc;

use bytes::Bytes;
use mz_objstore_proto::bidi_write_object_request::FirstMessage;
use mz_objstore_proto::bidi_write_object_response::WriteStatus;
use mz_objstore_proto::{
    decode_write_redirect, AppendObjectSpec, BidiWriteObjectRequest, BidiWriteObjectResponse,
    Object, WriteHandle, WriteObjectSpec,
};
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tracing::{debug, info};

use crate::bidi::{request_queue, BidiStream};
use crate::error::StorageError;
use crate::read_stream::routing_metadata;
use crate::transport::Transport;

/// A bidi append stream pinned to one object.
///
/// `open` performs the state-lookup handshake: the first request either
/// creates the object or resumes it by generation/handle, and asks the server
/// to report the durable size. [WriteObjectStream::persisted_size] is only
/// meaningful after `open` succeeds.
pub(crate) struct WriteObjectStream<T: Transport> {
    transport: Arc<T>,
    bucket: String,
    object: String,
    generation: Option<i64>,
    write_handle: Option<Bytes>,
    routing_token: Option<String>,
    persisted_size: u64,
    resource: Option<Object>,
    metadata: MetadataMap,
    conn: Option<BidiStream<BidiWriteObjectRequest, T::WriteStream>>,
}

impl<T: Transport> WriteObjectStream<T> {
    pub fn new(
        transport: Arc<T>,
        bucket: String,
        object: String,
        generation: Option<i64>,
        write_handle: Option<Bytes>,
        extra_metadata: &MetadataMap,
    ) -> Result<Self, StorageError> {
        let metadata = routing_metadata(&bucket, extra_metadata)?;
        Ok(WriteObjectStream {
            transport,
            bucket,
            object,
            generation,
            write_handle,
            routing_token: None,
            persisted_size: 0,
            resource: None,
            metadata,
            conn: None,
        })
    }

    pub async fn open(&mut self) -> Result<(), StorageError> {
        if self.conn.is_some() {
            return Err(StorageError::AlreadyOpen);
        }
        let full_bucket = format!("projects/_/buckets/{}", self.bucket);
        // An existing generation or handle means "resume"; otherwise the
        // server creates the object and assigns the generation.
        let first_message = if self.generation.is_some() || self.write_handle.is_some() {
            FirstMessage::AppendObjectSpec(AppendObjectSpec {
                bucket: full_bucket,
                object: self.object.clone(),
                generation: self.generation.unwrap_or(0),
                routing_token: self.routing_token.clone(),
                write_handle: self
                    .write_handle
                    .clone()
                    .map(|handle| WriteHandle { handle }),
            })
        } else {
            FirstMessage::WriteObjectSpec(WriteObjectSpec {
                resource: Some(Object {
                    bucket: full_bucket,
                    name: self.object.clone(),
                    ..Default::default()
                }),
                appendable: Some(true),
            })
        };
        let initial = BidiWriteObjectRequest {
            first_message: Some(first_message),
            state_lookup: true,
            ..Default::default()
        };
        debug!(
            "opening append stream for {}/{} (generation: {:?})",
            self.bucket, self.object, self.generation,
        );
        let (queue, requests) = request_queue(Some(initial));
        let call = self
            .transport
            .bidi_write_object(requests, self.metadata.clone())
            .await
            .map_err(StorageError::from_open_status)?;
        let mut conn = BidiStream::new(queue, call);

        let first = match conn.recv().await? {
            Some(first) => first,
            None => {
                return Err(StorageError::Protocol(
                    "append stream closed before state lookup response".into(),
                ))
            }
        };
        self.conn = Some(conn);
        self.apply_response(&first)?;
        info!(
            "append stream for {}/{} connected at persisted size {}",
            self.bucket, self.object, self.persisted_size,
        );
        Ok(())
    }

    /// Folds a server response into the stream state and returns the durable
    /// size it reported. `persisted_size` never regresses, so acknowledgments
    /// observed out of order cannot roll the watermark back.
    pub fn apply_response(
        &mut self,
        response: &BidiWriteObjectResponse,
    ) -> Result<u64, StorageError> {
        let reported = match &response.write_status {
            Some(WriteStatus::PersistedSize(n)) => *n,
            Some(WriteStatus::Resource(object)) => {
                if self.generation.is_none() {
                    self.generation = Some(object.generation);
                }
                self.resource = Some(object.clone());
                object.size
            }
            None => {
                return Err(StorageError::Protocol(
                    "write response carried no write status".into(),
                ))
            }
        };
        if let Some(handle) = &response.write_handle {
            self.write_handle = Some(handle.handle.clone());
        }
        self.persisted_size = std::cmp::max(self.persisted_size, reported);
        Ok(self.persisted_size)
    }

    /// Adopts the handle, token, and generation from a server-issued
    /// redirect, if `status` carries one.
    pub fn absorb_redirect(&mut self, status: &tonic::Status) {
        if let Some(redirect) = decode_write_redirect(status) {
            debug!(
                "append stream for {}/{} redirected (token: {:?})",
                self.bucket, self.object, redirect.routing_token,
            );
            if let Some(handle) = redirect.write_handle {
                self.write_handle = Some(handle.handle);
            }
            if redirect.routing_token.is_some() {
                self.routing_token = redirect.routing_token;
            }
            if let Some(generation) = redirect.generation {
                self.generation = Some(generation);
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

    pub fn send(&mut self, request: BidiWriteObjectRequest) -> Result<(), StorageError> {
        let conn = self.conn.as_mut().ok_or(StorageError::NotOpen)?;
        conn.send(request)
    }

    pub async fn recv(&mut self) -> Result<Option<BidiWriteObjectResponse>, StorageError> {
        let conn = self.conn.as_mut().ok_or(StorageError::NotOpen)?;
        conn.recv().await
    }

    /// Half-closes the request side (no `finish_write`) and drops the
    /// connection. The object stays appendable through a later stream.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }

    /// Drops the current connection so a later `open` can rebuild it.
    pub fn reset(&mut self) {
        self.close();
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn persisted_size(&self) -> u64 {
        self.persisted_size
    }

    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    pub fn write_handle(&self) -> Option<Bytes> {
        self.write_handle.clone()
    }

    pub fn resource(&self) -> Option<&Object> {
        self.resource.as_ref()
    }
}
