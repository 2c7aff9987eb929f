// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wire types for the object store's bidi-streaming RPC surface.
//!
//! The message structs in this crate mirror the `mz.objstore.v1` protobuf
//! definitions. They are maintained by hand in prost's generated shape so the
//! crate builds without a protoc toolchain; field numbers are part of the wire
//! contract and must not be reassigned.

use bytes::Bytes;
use prost::Message;

/// Resource metadata for a stored object.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Object {
    /// The bucket containing this object, in `projects/_/buckets/<name>` form.
    #[prost(string, tag = "1")]
    pub bucket: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    /// The content revision. Assigned by the server at creation and pinned
    /// for the lifetime of any stream opened against the object.
    #[prost(int64, tag = "3")]
    pub generation: i64,
    #[prost(uint64, tag = "4")]
    pub size: u64,
    /// Set once the object has been finalized and become immutable.
    #[prost(bool, tag = "5")]
    pub finalized: bool,
}

/// Opaque token permitting fast re-open of a read stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadHandle {
    #[prost(bytes = "bytes", tag = "1")]
    pub handle: Bytes,
}

/// Opaque token permitting resumption of an append stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteHandle {
    #[prost(bytes = "bytes", tag = "1")]
    pub handle: Bytes,
}

/// Identifies the object a read stream is opened against.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiReadObjectSpec {
    #[prost(string, tag = "1")]
    pub bucket: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub object: ::prost::alloc::string::String,
    #[prost(int64, optional, tag = "3")]
    pub generation: ::core::option::Option<i64>,
    #[prost(message, optional, tag = "4")]
    pub read_handle: ::core::option::Option<ReadHandle>,
    #[prost(string, optional, tag = "5")]
    pub routing_token: ::core::option::Option<::prost::alloc::string::String>,
}

/// A byte range requested on a read stream.
///
/// `read_length == 0` means "from `read_offset` to the end of the object".
/// `read_id` is chosen by the client and correlates inbound
/// [`ObjectRangeData`] frames back to the request; it must be unique among
/// in-flight ranges on the stream.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReadRange {
    #[prost(uint64, tag = "1")]
    pub read_offset: u64,
    #[prost(uint64, tag = "2")]
    pub read_length: u64,
    #[prost(uint64, tag = "3")]
    pub read_id: u64,
}

/// A data payload plus its CRC32C (Castagnoli) checksum.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChecksummedData {
    #[prost(bytes = "bytes", tag = "1")]
    pub content: Bytes,
    #[prost(fixed32, optional, tag = "2")]
    pub crc32c: ::core::option::Option<u32>,
}

/// One frame of object data belonging to a single requested range.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectRangeData {
    #[prost(message, optional, tag = "1")]
    pub checksummed_data: ::core::option::Option<ChecksummedData>,
    /// The range this frame belongs to, offset-adjusted to the frame's
    /// position within the requested range.
    #[prost(message, optional, tag = "2")]
    pub read_range: ::core::option::Option<ReadRange>,
    /// Marks the final frame for this `read_id`.
    #[prost(bool, tag = "3")]
    pub range_end: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiReadObjectRequest {
    /// Present only on the first request of a stream.
    #[prost(message, optional, tag = "1")]
    pub read_object_spec: ::core::option::Option<BidiReadObjectSpec>,
    #[prost(message, repeated, tag = "2")]
    pub read_ranges: ::prost::alloc::vec::Vec<ReadRange>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiReadObjectResponse {
    #[prost(message, repeated, tag = "1")]
    pub object_data_ranges: ::prost::alloc::vec::Vec<ObjectRangeData>,
    /// Object metadata, sent on the first response of a stream.
    #[prost(message, optional, tag = "2")]
    pub metadata: ::core::option::Option<Object>,
    #[prost(message, optional, tag = "3")]
    pub read_handle: ::core::option::Option<ReadHandle>,
}

/// Detail payload attached to an `ABORTED` status when the server moves a
/// read stream to another backend. Carries the state needed to re-open
/// without a metadata round trip.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiReadObjectRedirectedError {
    #[prost(message, optional, tag = "1")]
    pub read_handle: ::core::option::Option<ReadHandle>,
    #[prost(string, optional, tag = "2")]
    pub routing_token: ::core::option::Option<::prost::alloc::string::String>,
}

/// Detail payload attached to an `ABORTED` status when the server moves an
/// append stream to another backend.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiWriteObjectRedirectedError {
    #[prost(string, optional, tag = "1")]
    pub routing_token: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "2")]
    pub write_handle: ::core::option::Option<WriteHandle>,
    #[prost(int64, optional, tag = "3")]
    pub generation: ::core::option::Option<i64>,
}

/// Describes a new appendable object to create.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteObjectSpec {
    #[prost(message, optional, tag = "1")]
    pub resource: ::core::option::Option<Object>,
    #[prost(bool, optional, tag = "2")]
    pub appendable: ::core::option::Option<bool>,
}

/// Describes an existing appendable object to resume.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendObjectSpec {
    #[prost(string, tag = "1")]
    pub bucket: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub object: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub generation: i64,
    #[prost(string, optional, tag = "4")]
    pub routing_token: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "5")]
    pub write_handle: ::core::option::Option<WriteHandle>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiWriteObjectRequest {
    /// The object offset at which `data` begins. Required on every request
    /// that carries data.
    #[prost(uint64, tag = "3")]
    pub write_offset: u64,
    /// Ask the server to report the current persisted size.
    #[prost(bool, tag = "5")]
    pub state_lookup: bool,
    /// Force durable persistence of all bytes received so far.
    #[prost(bool, tag = "6")]
    pub flush: bool,
    /// Marks the end of the object; the object becomes immutable.
    #[prost(bool, tag = "7")]
    pub finish_write: bool,
    #[prost(oneof = "bidi_write_object_request::FirstMessage", tags = "1, 2")]
    pub first_message: ::core::option::Option<bidi_write_object_request::FirstMessage>,
    #[prost(oneof = "bidi_write_object_request::Data", tags = "4")]
    pub data: ::core::option::Option<bidi_write_object_request::Data>,
}

/// Nested message and enum types in `BidiWriteObjectRequest`.
pub mod bidi_write_object_request {
    /// Present only on the first request of a stream.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum FirstMessage {
        #[prost(message, tag = "1")]
        WriteObjectSpec(super::WriteObjectSpec),
        #[prost(message, tag = "2")]
        AppendObjectSpec(super::AppendObjectSpec),
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(message, tag = "4")]
        ChecksummedData(super::ChecksummedData),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiWriteObjectResponse {
    #[prost(message, optional, tag = "3")]
    pub write_handle: ::core::option::Option<WriteHandle>,
    #[prost(oneof = "bidi_write_object_response::WriteStatus", tags = "1, 2")]
    pub write_status: ::core::option::Option<bidi_write_object_response::WriteStatus>,
}

/// Nested message and enum types in `BidiWriteObjectResponse`.
pub mod bidi_write_object_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum WriteStatus {
        /// The durable byte length of the object.
        #[prost(uint64, tag = "1")]
        PersistedSize(u64),
        /// The full resource, sent when the object is finalized.
        #[prost(message, tag = "2")]
        Resource(super::Object),
    }
}

/// Minimal mirror of `google.rpc.Status` and `google.protobuf.Any`, enough
/// to round-trip redirect payloads through the `grpc-status-details-bin`
/// metadata that tonic exposes via [`tonic::Status::details`].
pub mod rpc {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "3")]
        pub details: ::prost::alloc::vec::Vec<Any>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Any {
        #[prost(string, tag = "1")]
        pub type_url: ::prost::alloc::string::String,
        #[prost(bytes = "bytes", tag = "2")]
        pub value: Bytes,
    }
}

pub const READ_REDIRECT_TYPE_URL: &str =
    "type.googleapis.com/mz.objstore.v1.BidiReadObjectRedirectedError";
pub const WRITE_REDIRECT_TYPE_URL: &str =
    "type.googleapis.com/mz.objstore.v1.BidiWriteObjectRedirectedError";

fn decode_detail<M: Message + Default>(status: &tonic::Status, type_url: &str) -> Option<M> {
    let rpc_status = rpc::Status::decode(status.details()).ok()?;
    rpc_status
        .details
        .iter()
        .find(|any| any.type_url == type_url)
        .and_then(|any| M::decode(any.value.clone()).ok())
}

/// Extracts a read-redirect payload from a terminal status, if one is
/// attached. Anything malformed is treated as "no redirect".
pub fn decode_read_redirect(status: &tonic::Status) -> Option<BidiReadObjectRedirectedError> {
    decode_detail(status, READ_REDIRECT_TYPE_URL)
}

/// Extracts a write-redirect payload from a terminal status, if one is
/// attached.
pub fn decode_write_redirect(status: &tonic::Status) -> Option<BidiWriteObjectRedirectedError> {
    decode_detail(status, WRITE_REDIRECT_TYPE_URL)
}

fn status_with_detail<M: Message>(message: &str, type_url: &str, detail: &M) -> tonic::Status {
    let any = rpc::Any {
        type_url: type_url.into(),
        value: Bytes::from(detail.encode_to_vec()),
    };
    let rpc_status = rpc::Status {
        code: tonic::Code::Aborted as i32,
        message: message.into(),
        details: vec![any],
    };
    tonic::Status::with_details(
        tonic::Code::Aborted,
        message,
        Bytes::from(rpc_status.encode_to_vec()),
    )
}

/// Builds the `ABORTED` status a server sends to move a read stream to
/// another backend.
pub fn read_redirect_status(
    message: &str,
    redirect: &BidiReadObjectRedirectedError,
) -> tonic::Status {
    status_with_detail(message, READ_REDIRECT_TYPE_URL, redirect)
}

/// Builds the `ABORTED` status a server sends to move an append stream to
/// another backend.
pub fn write_redirect_status(
    message: &str,
    redirect: &BidiWriteObjectRedirectedError,
) -> tonic::Status {
    status_with_detail(message, WRITE_REDIRECT_TYPE_URL, redirect)
}

/// Client stub for the object store's bidi RPCs.
///
/// tonic does not present its generated clients as a trait, so this stub is
/// written out by hand against [`tonic::client::Grpc`] in the same shape the
/// code generator would emit, specialized to the transport `Channel` we
/// actually use.
pub mod object_store_client {
    use tonic::transport::Channel;

    #[derive(Debug, Clone)]
    pub struct ObjectStoreClient {
        inner: tonic::client::Grpc<Channel>,
    }

    impl ObjectStoreClient {
        pub fn new(channel: Channel) -> Self {
            ObjectStoreClient {
                inner: tonic::client::Grpc::new(channel),
            }
        }

        /// Attempt to create a new client by connecting to the given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<tonic::codegen::StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }

        pub async fn bidi_read_object(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::BidiReadObjectRequest>,
        ) -> Result<tonic::Response<tonic::codec::Streaming<super::BidiReadObjectResponse>>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/mz.objstore.v1.ObjectStore/BidiReadObject");
            self.inner
                .streaming(request.into_streaming_request(), path, codec)
                .await
        }

        pub async fn bidi_write_object(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::BidiWriteObjectRequest>,
        ) -> Result<tonic::Response<tonic::codec::Streaming<super::BidiWriteObjectResponse>>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/mz.objstore.v1.ObjectStore/BidiWriteObject");
            self.inner
                .streaming(request.into_streaming_request(), path, codec)
                .await
        }
    }
}
