// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A socket-like send/recv façade over a bidi-streaming RPC.
//!
//! gRPC's client interface couples a request iterator with a response
//! iterator. For long-lived, asymmetric streams it is more useful to expose
//! paired `send`/`recv` operations instead: requests go through an unbounded
//! queue that the RPC drains, responses are pulled from the RPC one at a
//! time. An explicit `None` sentinel on the queue marks end-of-input, which
//! lets `close` half-close the request side without dropping the queue out
//! from under a restarted stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::StorageError;
use crate::transport::ResponseStream;

/// Creates a linked request queue and request stream. `initial` is yielded
/// before anything pushed onto the queue, which is how a re-opened stream
/// front-loads its configuration request.
pub(crate) fn request_queue<R>(initial: Option<R>) -> (RequestQueue<R>, RequestStream<R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    let queue = RequestQueue {
        tx,
        depth: Arc::clone(&depth),
    };
    let stream = RequestStream { rx, initial, depth };
    (queue, stream)
}

/// The producer half: enqueues requests for the RPC to send.
#[derive(Debug)]
pub(crate) struct RequestQueue<R> {
    tx: mpsc::UnboundedSender<Option<R>>,
    depth: Arc<AtomicUsize>,
}

impl<R> RequestQueue<R> {
    fn push(&self, req: R) -> Result<(), StorageError> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(Some(req)).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            StorageError::Closed
        })
    }

    /// Enqueues the end-of-input sentinel. Requests already queued are still
    /// delivered first.
    fn close(&self) {
        // An error here means the stream is gone, which is as closed as it
        // gets.
        let _ = self.tx.send(None);
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// The consumer half: a [Stream] of requests handed to the transport.
#[derive(Debug)]
pub struct RequestStream<R> {
    rx: mpsc::UnboundedReceiver<Option<R>>,
    initial: Option<R>,
    depth: Arc<AtomicUsize>,
}

impl<R: Send + Unpin> Stream for RequestStream<R> {
    type Item = R;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R>> {
        let this = self.get_mut();
        if let Some(initial) = this.initial.take() {
            return Poll::Ready(Some(initial));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Some(req))) => {
                this.depth.fetch_sub(1, Ordering::SeqCst);
                Poll::Ready(Some(req))
            }
            // Sentinel or dropped queue: end of input.
            Poll::Ready(Some(None)) | Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The terminal state of a stream, passed to done callbacks.
#[derive(Debug, Clone)]
pub enum StreamDone {
    /// The server completed the stream.
    Eos,
    /// The stream failed with a terminal status.
    Err(tonic::Status),
    /// The client closed the stream.
    Cancelled,
}

impl StreamDone {
    fn to_error(&self) -> StorageError {
        match self {
            StreamDone::Eos => StorageError::Closed,
            StreamDone::Err(status) => StorageError::from_status(status.clone()),
            StreamDone::Cancelled => StorageError::Cancelled,
        }
    }
}

type DoneCallback = Box<dyn FnOnce(&StreamDone) + Send>;

/// Paired send/recv over one open bidi RPC.
///
/// Requests are delivered to the server in enqueue order. If the RPC ends
/// with requests still queued, those requests are abandoned; the layers above
/// rebuild their protocol state from watermarks rather than replaying the
/// queue.
pub(crate) struct BidiStream<Req, S> {
    queue: RequestQueue<Req>,
    call: Option<S>,
    done: Option<StreamDone>,
    callbacks: Vec<DoneCallback>,
}

impl<Req, S> BidiStream<Req, S>
where
    S: ResponseStream,
{
    pub fn new(queue: RequestQueue<Req>, call: S) -> Self {
        BidiStream {
            queue,
            call: Some(call),
            done: None,
            callbacks: Vec::new(),
        }
    }

    /// Enqueues a request. Fails fast if the RPC has already terminated; the
    /// caller should `recv` to observe the terminal state.
    pub fn send(&mut self, req: Req) -> Result<(), StorageError> {
        match &self.done {
            Some(done) => Err(done.to_error()),
            None => self.queue.push(req),
        }
    }

    /// Awaits the next inbound message. Returns `Ok(None)` exactly once on a
    /// clean end of stream; after any terminal state, further calls yield the
    /// corresponding error.
    pub async fn recv(&mut self) -> Result<Option<S::Message>, StorageError> {
        if let Some(done) = &self.done {
            return match done {
                StreamDone::Eos => Err(StorageError::Closed),
                other => Err(other.to_error()),
            };
        }
        let call = self.call.as_mut().ok_or(StorageError::NotOpen)?;
        match call.next_message().await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => {
                self.finish(StreamDone::Eos);
                Ok(None)
            }
            Err(status) => {
                self.finish(StreamDone::Err(status.clone()));
                Err(StorageError::from_status(status))
            }
        }
    }

    /// Half-closes the request side and cancels the call. Idempotent.
    pub fn close(&mut self) {
        self.queue.close();
        // Dropping the response stream cancels the underlying RPC.
        self.call = None;
        self.finish(StreamDone::Cancelled);
    }

    /// Advisory depth of the outbound queue.
    pub fn pending_requests(&self) -> usize {
        self.queue.depth()
    }

    /// Registers `cb` to run exactly once when the RPC terminates. If it
    /// already has, `cb` runs immediately.
    pub fn add_done_callback(&mut self, cb: impl FnOnce(&StreamDone) + Send + 'static) {
        match &self.done {
            Some(done) => cb(done),
            None => self.callbacks.push(Box::new(cb)),
        }
    }

    fn finish(&mut self, done: StreamDone) {
        if self.done.is_none() {
            for cb in self.callbacks.drain(..) {
                cb(&done);
            }
            self.done = Some(done);
        }
    }
}
