// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Byte sinks that downloaded ranges are written into.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// An appendable byte target for downloaded range data.
///
/// The downloader appends received frames in order but never closes or
/// otherwise manages the sink; ownership stays with the caller. A sink must
/// not be shared between ranges of concurrently running batches unless the
/// caller serializes those batches externally.
pub trait ByteSink: Send {
    /// Appends `chunk` to the sink.
    fn push_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;
}

impl ByteSink for Vec<u8> {
    fn push_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// Adapts any [std::io::Write] (a file, a cursor) into a [ByteSink].
#[derive(Debug)]
pub struct WriterSink<W>(pub W);

impl<W: Write + Send> ByteSink for WriterSink<W> {
    fn push_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.0.write_all(chunk)
    }
}

/// A cheaply cloneable in-memory sink.
///
/// Clones share the same buffer, so the caller can hand one clone to
/// `download_ranges` and inspect the bytes through another afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().expect("lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ByteSink for MemorySink {
    fn push_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.0
            .lock()
            .expect("lock poisoned")
            .extend_from_slice(chunk);
        Ok(())
    }
}
