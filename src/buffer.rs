//! Byte windows over pool memory.
//!
//! A [`ByteWindow`] is a head/tail cursor pair over a [`PoolSlice`]. The same
//! type backs both directions of a connection: the read window is filled from
//! the transport and consumed by the parser, the write window is extended by
//! the serializer and drained to the transport. Compaction preserves
//! unconsumed bytes byte-exactly, which is what keeps pipelined requests
//! intact across a keep-alive reset.

use crate::arena::{MemoryPool, PoolSlice};
use crate::util::{Classify, IoStatus};
use std::io;
use std::io::{Read, Write};

/// Result of one attempt to fill a window from a stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum FillOutcome {
    /// `n > 0` bytes were appended.
    Read(usize),
    /// The stream had nothing to offer without blocking.
    NoProgress,
    /// The peer closed its end.
    Eof,
    /// The window is at its limit and nothing could be consumed to make room.
    Full,
}

#[derive(Debug)]
pub(crate) struct ByteWindow {
    slice: PoolSlice,
    head: usize,
    tail: usize,
}

impl ByteWindow {
    /// Carves a window of `initial` bytes out of `pool`.
    pub(crate) fn new(pool: &mut MemoryPool, initial: usize) -> Option<ByteWindow> {
        Some(Self {
            slice: pool.alloc(initial)?,
            head: 0,
            tail: 0,
        })
    }

    #[inline]
    pub(crate) const fn available(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub(crate) fn view<'a>(&self, pool: &'a MemoryPool) -> &'a [u8] {
        &pool.bytes(self.slice)[self.head..self.tail]
    }

    /// Advances the head past `len` consumed bytes.
    #[inline]
    pub(crate) fn consume(&mut self, len: usize) {
        debug_assert!(len <= self.available());
        self.head += len;
    }

    pub(crate) fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Moves unconsumed bytes to the front of the window. The relative order
    /// and content of the bytes are untouched.
    pub(crate) fn compact(&mut self, pool: &mut MemoryPool) {
        if self.head == 0 {
            return;
        }
        if self.head == self.tail {
            self.clear();
            return;
        }
        let len = self.available();
        let bytes = pool.bytes_mut(self.slice);
        bytes.copy_within(self.head..self.tail, 0);
        self.head = 0;
        self.tail = len;
    }

    /// Reads once from `stream` into the free tail space, compacting first
    /// and growing the backing slice (within `limit` and what the pool can
    /// spare) when the tail is jammed against the end.
    pub(crate) fn fill_from<S: Read + ?Sized>(
        &mut self,
        pool: &mut MemoryPool,
        stream: &mut S,
        limit: usize,
    ) -> io::Result<FillOutcome> {
        if self.tail == self.slice.len() {
            self.compact(pool);
        }
        if self.tail == self.slice.len() {
            // head is already 0; the only way forward is a bigger slice
            if self.slice.len() >= limit {
                return Ok(FillOutcome::Full);
            }
            let want = (self.slice.len() * 2).min(limit);
            match pool.resize(self.slice, want) {
                Some(grown) => self.slice = grown,
                None => return Ok(FillOutcome::Full),
            }
        }
        let tail = self.tail;
        let free = &mut pool.bytes_mut(self.slice)[tail..];
        match stream.read(free).classify_read()? {
            IoStatus::Ready(n) => {
                self.tail += n;
                Ok(FillOutcome::Read(n))
            }
            IoStatus::NoProgress => Ok(FillOutcome::NoProgress),
            IoStatus::Eof => Ok(FillOutcome::Eof),
        }
    }

    /// Appends as much of `data` as fits, returning the number of bytes
    /// actually copied.
    pub(crate) fn extend(&mut self, pool: &mut MemoryPool, data: &[u8]) -> usize {
        if self.head > 0 && data.len() > self.slice.len() - self.tail {
            self.compact(pool);
        }
        let tail = self.tail;
        let free = &mut pool.bytes_mut(self.slice)[tail..];
        let n = free.len().min(data.len());
        free[..n].copy_from_slice(&data[..n]);
        self.tail += n;
        n
    }

    #[inline]
    pub(crate) fn free_space(&self) -> usize {
        self.slice.len() - self.available()
    }

    /// Writes the unconsumed bytes to `stream` once, consuming what was
    /// accepted.
    pub(crate) fn drain_to<S: Write + ?Sized>(
        &mut self,
        pool: &mut MemoryPool,
        stream: &mut S,
    ) -> io::Result<IoStatus> {
        if self.is_empty() {
            return Ok(IoStatus::Ready(0));
        }
        match stream.write(self.view(pool)).classify_write()? {
            IoStatus::Ready(n) => {
                self.consume(n);
                if self.is_empty() {
                    self.clear();
                }
                Ok(IoStatus::Ready(n))
            }
            other => Ok(other),
        }
    }
}
