// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors surfaced by the object store client.

use mz_objstore_proto::{decode_read_redirect, decode_write_redirect};
use tonic::Code;

/// The error type for all client operations.
///
/// [StorageError::Transient] is consumed by the reconnect machinery and only
/// surfaces when a configured retry deadline is exhausted. Everything else
/// reaches the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The stream has not been opened (or was already closed again).
    #[error("stream is not open")]
    NotOpen,
    /// `open` was called on a stream that is already open.
    #[error("stream is already open")]
    AlreadyOpen,
    /// The stream reached a terminal state and accepts no further operations.
    #[error("stream is closed")]
    Closed,
    /// The operation was aborted because the stream was closed underneath it
    /// or the caller cancelled.
    #[error("operation was cancelled")]
    Cancelled,
    /// More ranges were supplied to one `download_ranges` call than the
    /// request-time cap allows.
    #[error("too many ranges in one call: {count} (maximum {max})")]
    TooManyRanges { count: usize, max: usize },
    /// The server rejected a requested range, e.g. an offset past the end of
    /// the object.
    #[error("invalid range: {0}")]
    InvalidRange(String),
    /// A server frame violated the expected protocol shape.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A frame's payload did not match its checksum. The affected batch is
    /// aborted and the stream closed.
    #[error(
        "checksum mismatch for read_id {read_id}: server sent {server_crc32c}, \
         client computed {client_crc32c}"
    )]
    DataCorruption {
        read_id: u64,
        server_crc32c: u32,
        client_crc32c: u32,
    },
    /// The RPC could not be started.
    #[error("failed to open stream: {0}")]
    StreamOpen(#[source] tonic::Status),
    /// A retriable stream failure. Recovered internally; surfaced only when
    /// the retry deadline is exhausted.
    #[error("transient stream failure: {0}")]
    Transient(#[source] tonic::Status),
    /// A permanent stream failure (authentication, permission, not-found).
    #[error("permanent stream failure: {0}")]
    Fatal(#[source] tonic::Status),
    /// No accelerated CRC32C implementation is available on this host.
    #[error("accelerated crc32c implementation unavailable")]
    RuntimeMissing,
    /// An I/O failure writing to a caller-supplied sink or reading from a
    /// caller-supplied source.
    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error),
    /// A caller-supplied argument was unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// Whether the reconnect machinery should absorb this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    /// Classifies a terminal RPC status.
    ///
    /// Server-issued redirects arrive as `ABORTED` with a redirect payload in
    /// the status details; they are retriable because the follow-up open
    /// carries the redirected handle.
    pub fn from_status(status: tonic::Status) -> StorageError {
        match status.code() {
            Code::Unavailable
            | Code::Internal
            | Code::DeadlineExceeded
            | Code::ResourceExhausted => StorageError::Transient(status),
            Code::Aborted
                if decode_read_redirect(&status).is_some()
                    || decode_write_redirect(&status).is_some() =>
            {
                StorageError::Transient(status)
            }
            Code::OutOfRange => StorageError::InvalidRange(status.message().to_string()),
            Code::Cancelled => StorageError::Cancelled,
            _ => StorageError::Fatal(status),
        }
    }

    /// Like [StorageError::from_status], but for failures to start an RPC,
    /// where permanent errors are reported as [StorageError::StreamOpen].
    pub(crate) fn from_open_status(status: tonic::Status) -> StorageError {
        match Self::from_status(status) {
            StorageError::Fatal(status) => StorageError::StreamOpen(status),
            other => other,
        }
    }
}
