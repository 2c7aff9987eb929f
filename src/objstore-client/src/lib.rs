// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Async client for the object store's bidi-streaming RPCs.
//!
//! The service exposes one bidirectional RPC per object for each direction of
//! transfer, and this crate implements the two client-side state machines
//! that ride on them:
//!
//! - [MultiRangeDownloader] multiplexes many concurrent byte-range reads over
//!   a single long-lived read stream, correlating inbound frames to
//!   caller-supplied sinks by client-chosen read-ids and validating CRC32C
//!   checksums.
//! - [AppendableObjectWriter] performs incremental, pipelined appends against
//!   an object, tracking the server's durable watermark and supporting
//!   pause/resume (half-close) and finalization.
//!
//! Both recover from transient stream failures and server-issued redirects by
//! re-opening with the opaque handle the server issued and rebuilding their
//! in-flight protocol state from watermarks, so client-visible progress is
//! preserved across faults. All I/O is non-blocking; the caller's runtime
//! interleaves it with application work.
//!
//! The gRPC channel itself is a seam: anything implementing [Transport] can
//! back the streams, with [GrpcTransport] as the production implementation.

mod bidi;
mod read_stream;
mod write_stream;

pub mod cfg;
pub mod downloader;
pub mod error;
pub mod metadata;
pub mod retry;
pub mod sink;
pub mod transport;
pub mod writer;

pub use cfg::ClientConfig;
pub use downloader::{MultiRangeDownloader, RangeRequest, RangeResult, MAX_READ_RANGES_PER_CALL};
pub use error::StorageError;
pub use metadata::MetadataClient;
pub use sink::{ByteSink, MemorySink, WriterSink};
pub use transport::{GrpcTransport, ResponseStream, Transport};
pub use writer::{AppendableObjectWriter, WriterState};

// The request-stream type appears in the [Transport] signature.
pub use bidi::RequestStream;
