// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory object store behind the [Transport] seam, with scripted
//! fault injection for exercising the reconnect machinery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mz_objstore_client::{
    ClientConfig, MetadataClient, RequestStream, ResponseStream, StorageError, Transport,
};
use mz_objstore_proto as proto;
use mz_objstore_proto::bidi_write_object_request::{Data, FirstMessage};
use mz_objstore_proto::bidi_write_object_response::WriteStatus;
use tokio::sync::mpsc;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// A client config with small buffers and fast retries, so tests cross the
/// framing boundaries the defaults are sized to avoid.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        flush_interval_bytes: 16,
        max_write_chunk_bytes: 8,
        retry_initial_backoff: std::time::Duration::from_millis(2),
        retry_clamp_backoff: std::time::Duration::from_millis(50),
        ..ClientConfig::default()
    }
}

/// Scripted failure for the next read stream that opens.
#[allow(dead_code)]
pub enum ReadFault {
    /// Fail the open itself.
    OpenError(Status),
    /// Serve this many data frames, then terminate with the status.
    DropAfterFrames(usize, Status),
    /// Flip a bit in the content of the given data frame (0-based) after its
    /// checksum is computed.
    CorruptFrame(usize),
}

/// Scripted failure for the next write stream that opens.
#[allow(dead_code)]
pub enum WriteFault {
    /// Fail the open itself.
    OpenError(Status),
    /// Handle this many post-handshake requests, then terminate with the
    /// status, discarding all staged (unflushed) bytes.
    DropAfterRequests(usize, Status),
}

struct FakeObject {
    durable: Vec<u8>,
    generation: i64,
    finalized: bool,
}

struct Inner {
    buckets: HashSet<String>,
    objects: HashMap<(String, String), FakeObject>,
    next_generation: i64,
    read_faults: VecDeque<ReadFault>,
    write_faults: VecDeque<WriteFault>,
    /// Max bytes per served data frame.
    frame_size: usize,
    /// Metadata observed on each read/write stream open, in order.
    read_metadata: Vec<MetadataMap>,
    write_metadata: Vec<MetadataMap>,
}

/// An in-memory object store usable as a [Transport].
#[derive(Clone)]
pub struct FakeStorage {
    inner: Arc<Mutex<Inner>>,
}

#[allow(dead_code)]
impl FakeStorage {
    pub fn new() -> Self {
        FakeStorage {
            inner: Arc::new(Mutex::new(Inner {
                buckets: HashSet::new(),
                objects: HashMap::new(),
                next_generation: 1,
                read_faults: VecDeque::new(),
                write_faults: VecDeque::new(),
                frame_size: 1024,
                read_metadata: Vec::new(),
                write_metadata: Vec::new(),
            })),
        }
    }

    pub fn with_frame_size(self, frame_size: usize) -> Self {
        self.inner.lock().unwrap().frame_size = frame_size;
        self
    }

    /// Seeds a finalized object directly, returning its generation.
    pub fn put_object(&self, bucket: &str, object: &str, contents: &[u8]) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.buckets.insert(bucket.to_string());
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.objects.insert(
            (bucket.to_string(), object.to_string()),
            FakeObject {
                durable: contents.to_vec(),
                generation,
                finalized: true,
            },
        );
        generation
    }

    /// The durable bytes of an object, as a server-side oracle.
    pub fn object_contents(&self, bucket: &str, object: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(bucket.to_string(), object.to_string()))
            .map(|o| o.durable.clone())
    }

    pub fn inject_read_fault(&self, fault: ReadFault) {
        self.inner.lock().unwrap().read_faults.push_back(fault);
    }

    pub fn inject_write_fault(&self, fault: WriteFault) {
        self.inner.lock().unwrap().write_faults.push_back(fault);
    }

    /// The metadata that arrived with the most recent read stream open.
    pub fn last_read_metadata(&self) -> Option<MetadataMap> {
        self.inner.lock().unwrap().read_metadata.last().cloned()
    }

    /// The metadata that arrived with the most recent write stream open.
    pub fn last_write_metadata(&self) -> Option<MetadataMap> {
        self.inner.lock().unwrap().write_metadata.last().cloned()
    }
}

/// Strips the `projects/_/buckets/` resource prefix.
fn bucket_name(full: &str) -> &str {
    full.strip_prefix("projects/_/buckets/").unwrap_or(full)
}

fn require_routing_metadata(metadata: &MetadataMap) -> Result<(), Status> {
    match metadata.get("x-goog-request-params") {
        Some(_) => Ok(()),
        None => Err(Status::invalid_argument(
            "stream is missing x-goog-request-params metadata",
        )),
    }
}

/// The response half handed back to the client under test.
pub struct ChannelStream<R>(mpsc::UnboundedReceiver<Result<R, Status>>);

#[async_trait]
impl<R: Send> ResponseStream for ChannelStream<R> {
    type Message = R;

    async fn next_message(&mut self) -> Result<Option<R>, Status> {
        self.0.recv().await.transpose()
    }
}

#[async_trait]
impl Transport for FakeStorage {
    type ReadStream = ChannelStream<proto::BidiReadObjectResponse>;
    type WriteStream = ChannelStream<proto::BidiWriteObjectResponse>;

    async fn bidi_read_object(
        &self,
        mut requests: RequestStream<proto::BidiReadObjectRequest>,
        metadata: MetadataMap,
    ) -> Result<Self::ReadStream, Status> {
        self.inner.lock().unwrap().read_metadata.push(metadata.clone());
        require_routing_metadata(&metadata)?;
        let first = requests
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("read stream opened without a request"))?;
        let spec = first
            .read_object_spec
            .ok_or_else(|| Status::invalid_argument("first read request must carry a spec"))?;

        let fault = match self.inner.lock().unwrap().read_faults.pop_front() {
            Some(ReadFault::OpenError(status)) => return Err(status),
            fault => fault,
        };

        let (generation, frame_size) = {
            let inner = self.inner.lock().unwrap();
            let key = (bucket_name(&spec.bucket).to_string(), spec.object.clone());
            let object = inner
                .objects
                .get(&key)
                .ok_or_else(|| Status::not_found("no such object"))?;
            if let Some(generation) = spec.generation {
                if generation != object.generation {
                    return Err(Status::not_found("no such generation"));
                }
            }
            (object.generation, inner.frame_size)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(proto::BidiReadObjectResponse {
            object_data_ranges: Vec::new(),
            metadata: Some(proto::Object {
                bucket: spec.bucket.clone(),
                name: spec.object.clone(),
                generation,
                size: 0,
                finalized: false,
            }),
            read_handle: Some(proto::ReadHandle {
                handle: Bytes::from_static(b"fake-read-handle"),
            }),
        }));

        let server = ReadServer {
            inner: Arc::clone(&self.inner),
            key: (bucket_name(&spec.bucket).to_string(), spec.object),
            frame_size,
            frames_sent: 0,
            fault,
        };
        tokio::spawn(server.run(requests, tx));
        Ok(ChannelStream(rx))
    }

    async fn bidi_write_object(
        &self,
        mut requests: RequestStream<proto::BidiWriteObjectRequest>,
        metadata: MetadataMap,
    ) -> Result<Self::WriteStream, Status> {
        self.inner.lock().unwrap().write_metadata.push(metadata.clone());
        require_routing_metadata(&metadata)?;
        let first = requests
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("write stream opened without a request"))?;

        let fault = match self.inner.lock().unwrap().write_faults.pop_front() {
            Some(WriteFault::OpenError(status)) => return Err(status),
            fault => fault,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let key;
        {
            let mut inner = self.inner.lock().unwrap();
            match first.first_message {
                Some(FirstMessage::WriteObjectSpec(spec)) => {
                    let resource = spec
                        .resource
                        .ok_or_else(|| Status::invalid_argument("create without resource"))?;
                    key = (
                        bucket_name(&resource.bucket).to_string(),
                        resource.name.clone(),
                    );
                    if !inner.buckets.contains(&key.0) {
                        return Err(Status::not_found("no such bucket"));
                    }
                    let generation = inner.next_generation;
                    inner.next_generation += 1;
                    inner.objects.insert(
                        key.clone(),
                        FakeObject {
                            durable: Vec::new(),
                            generation,
                            finalized: false,
                        },
                    );
                    let _ = tx.send(Ok(proto::BidiWriteObjectResponse {
                        write_handle: Some(proto::WriteHandle {
                            handle: Bytes::from_static(b"fake-write-handle"),
                        }),
                        write_status: Some(WriteStatus::Resource(proto::Object {
                            bucket: resource.bucket,
                            name: resource.name,
                            generation,
                            size: 0,
                            finalized: false,
                        })),
                    }));
                }
                Some(FirstMessage::AppendObjectSpec(spec)) => {
                    key = (bucket_name(&spec.bucket).to_string(), spec.object.clone());
                    let object = inner
                        .objects
                        .get(&key)
                        .ok_or_else(|| Status::not_found("no such object"))?;
                    if spec.generation != object.generation {
                        return Err(Status::not_found("no such generation"));
                    }
                    if object.finalized {
                        return Err(Status::failed_precondition("object is finalized"));
                    }
                    let _ = tx.send(Ok(proto::BidiWriteObjectResponse {
                        write_handle: Some(proto::WriteHandle {
                            handle: Bytes::from_static(b"fake-write-handle"),
                        }),
                        write_status: Some(WriteStatus::PersistedSize(
                            object.durable.len() as u64
                        )),
                    }));
                }
                None => {
                    return Err(Status::invalid_argument(
                        "first write request must carry a spec",
                    ))
                }
            }
        }

        let server = WriteServer {
            inner: Arc::clone(&self.inner),
            key,
            staged: Vec::new(),
            requests_handled: 0,
            fault,
        };
        tokio::spawn(server.run(requests, tx));
        Ok(ChannelStream(rx))
    }
}

struct ReadServer {
    inner: Arc<Mutex<Inner>>,
    key: (String, String),
    frame_size: usize,
    frames_sent: usize,
    fault: Option<ReadFault>,
}

impl ReadServer {
    async fn run(
        mut self,
        mut requests: RequestStream<proto::BidiReadObjectRequest>,
        tx: mpsc::UnboundedSender<Result<proto::BidiReadObjectResponse, Status>>,
    ) {
        while let Some(request) = requests.next().await {
            for range in request.read_ranges {
                if !self.serve_range(&range, &tx) {
                    return;
                }
            }
        }
    }

    /// Serves one range as a chain of frames. Returns false once the stream
    /// is finished (fault fired or client went away).
    fn serve_range(
        &mut self,
        range: &proto::ReadRange,
        tx: &mpsc::UnboundedSender<Result<proto::BidiReadObjectResponse, Status>>,
    ) -> bool {
        // Read the durable bytes as of now, so tail reads observe appends.
        let contents = {
            let inner = self.inner.lock().unwrap();
            match inner.objects.get(&self.key) {
                Some(object) => object.durable.clone(),
                None => {
                    let _ = tx.send(Err(Status::not_found("object vanished")));
                    return false;
                }
            }
        };
        let offset = usize::try_from(range.read_offset).unwrap();
        if offset > contents.len() {
            let _ = tx.send(Err(Status::out_of_range(format!(
                "read at {} past object end {}",
                offset,
                contents.len()
            ))));
            return false;
        }
        let end = if range.read_length == 0 {
            contents.len()
        } else {
            std::cmp::min(contents.len(), offset + usize::try_from(range.read_length).unwrap())
        };
        let slice = &contents[offset..end];

        let mut pos = 0;
        loop {
            let take = std::cmp::min(self.frame_size, slice.len() - pos);
            let range_end = pos + take == slice.len();
            let mut content = slice[pos..pos + take].to_vec();
            let crc = crc32c::crc32c(&content);
            if let Some(ReadFault::CorruptFrame(n)) = &self.fault {
                if *n == self.frames_sent && !content.is_empty() {
                    content[0] ^= 0xff;
                }
            }
            if let Some(ReadFault::DropAfterFrames(n, status)) = &self.fault {
                if *n == self.frames_sent {
                    let _ = tx.send(Err(status.clone()));
                    return false;
                }
            }
            let frame = proto::ObjectRangeData {
                checksummed_data: Some(proto::ChecksummedData {
                    content: Bytes::from(content),
                    crc32c: Some(crc),
                }),
                read_range: Some(proto::ReadRange {
                    read_offset: (offset + pos) as u64,
                    read_length: take as u64,
                    read_id: range.read_id,
                }),
                range_end,
            };
            if tx
                .send(Ok(proto::BidiReadObjectResponse {
                    object_data_ranges: vec![frame],
                    metadata: None,
                    read_handle: None,
                }))
                .is_err()
            {
                return false;
            }
            self.frames_sent += 1;
            pos += take;
            if range_end {
                return true;
            }
        }
    }
}

struct WriteServer {
    inner: Arc<Mutex<Inner>>,
    key: (String, String),
    /// Received but not yet durable; discarded if the stream dies.
    staged: Vec<u8>,
    requests_handled: usize,
    fault: Option<WriteFault>,
}

impl WriteServer {
    async fn run(
        mut self,
        mut requests: RequestStream<proto::BidiWriteObjectRequest>,
        tx: mpsc::UnboundedSender<Result<proto::BidiWriteObjectResponse, Status>>,
    ) {
        while let Some(request) = requests.next().await {
            if let Some(WriteFault::DropAfterRequests(n, status)) = &self.fault {
                if *n == self.requests_handled {
                    let _ = tx.send(Err(status.clone()));
                    return;
                }
            }
            self.requests_handled += 1;
            if !self.handle_request(request, &tx) {
                return;
            }
        }
        // Client half-closed without finalizing: staged bytes are simply
        // dropped; only flushed bytes are durable.
    }

    fn handle_request(
        &mut self,
        request: proto::BidiWriteObjectRequest,
        tx: &mpsc::UnboundedSender<Result<proto::BidiWriteObjectResponse, Status>>,
    ) -> bool {
        if let Some(Data::ChecksummedData(data)) = request.data {
            let expected = {
                let inner = self.inner.lock().unwrap();
                inner.objects[&self.key].durable.len() + self.staged.len()
            };
            if request.write_offset != expected as u64 {
                let _ = tx.send(Err(Status::invalid_argument(format!(
                    "write at offset {} but object is at {}",
                    request.write_offset, expected
                ))));
                return false;
            }
            if let Some(crc) = data.crc32c {
                if crc32c::crc32c(&data.content) != crc {
                    let _ = tx.send(Err(Status::data_loss("write checksum mismatch")));
                    return false;
                }
            }
            self.staged.extend_from_slice(&data.content);
        }

        if request.flush || request.finish_write {
            let mut inner = self.inner.lock().unwrap();
            let object = inner.objects.get_mut(&self.key).unwrap();
            object.durable.extend_from_slice(&self.staged);
            self.staged.clear();
            let response = if request.finish_write {
                object.finalized = true;
                proto::BidiWriteObjectResponse {
                    write_handle: None,
                    write_status: Some(WriteStatus::Resource(proto::Object {
                        bucket: format!("projects/_/buckets/{}", self.key.0),
                        name: self.key.1.clone(),
                        generation: object.generation,
                        size: object.durable.len() as u64,
                        finalized: true,
                    })),
                }
            } else {
                proto::BidiWriteObjectResponse {
                    write_handle: None,
                    write_status: Some(WriteStatus::PersistedSize(object.durable.len() as u64)),
                }
            };
            return tx.send(Ok(response)).is_ok();
        }

        if request.state_lookup {
            let inner = self.inner.lock().unwrap();
            let durable = inner.objects[&self.key].durable.len() as u64;
            return tx
                .send(Ok(proto::BidiWriteObjectResponse {
                    write_handle: None,
                    write_status: Some(WriteStatus::PersistedSize(durable)),
                }))
                .is_ok();
        }

        true
    }
}

#[async_trait]
impl MetadataClient for FakeStorage {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap()
            .buckets
            .insert(bucket.to_string());
        Ok(())
    }

    async fn delete_object(
        &self,
        bucket: &str,
        object: &str,
        generation: Option<i64>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (bucket.to_string(), object.to_string());
        match inner.objects.get(&key) {
            Some(existing) if generation.map_or(true, |g| g == existing.generation) => {
                inner.objects.remove(&key);
                Ok(())
            }
            _ => Err(StorageError::Fatal(Status::not_found("no such object"))),
        }
    }

    async fn object_exists(&self, bucket: &str, object: &str) -> Result<bool, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .objects
            .contains_key(&(bucket.to_string(), object.to_string())))
    }
}
