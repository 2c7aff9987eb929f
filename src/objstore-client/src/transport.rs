// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The transport seam between the stream state machines and gRPC.

use async_trait::async_trait;
use mz_objstore_proto::object_store_client::ObjectStoreClient;
use mz_objstore_proto::{
    BidiReadObjectRequest, BidiReadObjectResponse, BidiWriteObjectRequest, BidiWriteObjectResponse,
};
use tonic::codec::Streaming;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};

use crate::bidi::RequestStream;

/// The response half of a bidi RPC.
///
/// tonic's [Streaming] is the production implementation; tests substitute
/// channel-backed streams so faults can be scripted without a network.
#[async_trait]
pub trait ResponseStream: Send {
    type Message: Send;

    /// Awaits the next inbound message. `Ok(None)` is a clean end of stream;
    /// an error is the RPC's terminal status.
    async fn next_message(&mut self) -> Result<Option<Self::Message>, tonic::Status>;
}

#[async_trait]
impl<R: Send> ResponseStream for Streaming<R> {
    type Message = R;

    async fn next_message(&mut self) -> Result<Option<R>, tonic::Status> {
        self.message().await
    }
}

/// A factory for the two bidi RPCs, given an already-queued request stream
/// and per-stream routing metadata.
///
/// Starting an RPC consumes the request stream; reconnecting therefore always
/// builds a fresh queue. Implementations must not buffer responses across
/// calls.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type ReadStream: ResponseStream<Message = BidiReadObjectResponse> + 'static;
    type WriteStream: ResponseStream<Message = BidiWriteObjectResponse> + 'static;

    async fn bidi_read_object(
        &self,
        requests: RequestStream<BidiReadObjectRequest>,
        metadata: MetadataMap,
    ) -> Result<Self::ReadStream, tonic::Status>;

    async fn bidi_write_object(
        &self,
        requests: RequestStream<BidiWriteObjectRequest>,
        metadata: MetadataMap,
    ) -> Result<Self::WriteStream, tonic::Status>;
}

/// The production [Transport]: a tonic channel to the object store service.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    channel: Channel,
}

impl GrpcTransport {
    /// Wraps an existing channel. Credential and TLS configuration happen
    /// wherever the channel is built.
    pub fn new(channel: Channel) -> Self {
        GrpcTransport { channel }
    }

    /// Connects to the service at `endpoint` (e.g. `"http://host:port"`).
    pub async fn connect(endpoint: &str) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::new(endpoint.to_string())?.connect().await?;
        Ok(GrpcTransport { channel })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    type ReadStream = Streaming<BidiReadObjectResponse>;
    type WriteStream = Streaming<BidiWriteObjectResponse>;

    async fn bidi_read_object(
        &self,
        requests: RequestStream<BidiReadObjectRequest>,
        metadata: MetadataMap,
    ) -> Result<Self::ReadStream, tonic::Status> {
        let mut client = ObjectStoreClient::new(self.channel.clone());
        let mut request = tonic::Request::new(requests);
        *request.metadata_mut() = metadata;
        Ok(client.bidi_read_object(request).await?.into_inner())
    }

    async fn bidi_write_object(
        &self,
        requests: RequestStream<BidiWriteObjectRequest>,
        metadata: MetadataMap,
    ) -> Result<Self::WriteStream, tonic::Status> {
        let mut client = ObjectStoreClient::new(self.channel.clone());
        let mut request = tonic::Request::new(requests);
        *request.metadata_mut() = metadata;
        Ok(client.bidi_write_object(request).await?.into_inner())
    }
}
