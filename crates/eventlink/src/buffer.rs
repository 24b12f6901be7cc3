// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A growable byte buffer shared between producer and consumer tasks.
//!
//! Every operation on [`SharedBuffer`] takes one internal lock for its whole
//! duration, so no two operations ever interleave their effects.
//!
//! # Borrowed views
//!
//! [`SharedBuffer::bytes`] and [`SharedBuffer::next`] hand out views into the
//! buffer's storage without copying. A view *is* the lock guard: the data it
//! shows stays valid because no other operation can run until the view is
//! dropped. Two consequences follow:
//!
//! - keep views short-lived, every other reader and writer waits on them;
//! - calling another method on the same buffer while holding a view, on the
//!   same thread, deadlocks.
//!
//! Copy the view (`to_vec()`) when the data has to outlive it.

use std::io::{self, Read, Write};
use std::ops::Range;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::errors::BufferError;

// Bytes reserved ahead of each read in `read_from`.
const MIN_READ: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LastRead {
    #[default]
    Invalid,
    Read,
    Char(usize),
}

/// Unsynchronized storage behind [`SharedBuffer`]. Unread data lives in
/// `buf[off..]`.
#[derive(Debug, Default)]
struct ByteBuffer {
    buf: Vec<u8>,
    off: usize,
    last_read: LastRead,
}

impl ByteBuffer {
    fn unread(&self) -> &[u8] {
        &self.buf[self.off..]
    }

    fn len(&self) -> usize {
        self.buf.len() - self.off
    }

    fn is_empty(&self) -> bool {
        self.buf.len() <= self.off
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.off = 0;
        self.last_read = LastRead::Invalid;
    }

    // Reclaims consumed space before `n` more bytes are appended.
    fn make_room(&mut self, n: usize) {
        if self.is_empty() && self.off > 0 {
            self.reset();
        } else if self.off > 0 && self.buf.len() + n > self.buf.capacity() {
            self.buf.drain(..self.off);
            self.off = 0;
        }
    }

    fn write(&mut self, p: &[u8]) -> usize {
        self.last_read = LastRead::Invalid;
        self.make_room(p.len());
        self.buf.extend_from_slice(p);
        p.len()
    }

    fn read(&mut self, p: &mut [u8]) -> usize {
        self.last_read = LastRead::Invalid;
        if self.is_empty() {
            self.reset();
            return 0;
        }
        let n = p.len().min(self.len());
        p[..n].copy_from_slice(&self.buf[self.off..self.off + n]);
        self.off += n;
        if n > 0 {
            self.last_read = LastRead::Read;
        }
        n
    }

    fn next(&mut self, n: usize) -> Range<usize> {
        self.last_read = LastRead::Invalid;
        let m = n.min(self.len());
        let start = self.off;
        self.off += m;
        if m > 0 {
            self.last_read = LastRead::Read;
        }
        start..start + m
    }

    fn read_byte(&mut self) -> Result<u8, BufferError> {
        if self.is_empty() {
            self.reset();
            return Err(BufferError::Eof);
        }
        let b = self.buf[self.off];
        self.off += 1;
        self.last_read = LastRead::Read;
        Ok(b)
    }

    fn read_char(&mut self) -> Result<(char, usize), BufferError> {
        if self.is_empty() {
            self.reset();
            return Err(BufferError::Eof);
        }
        let unread = self.unread();
        let (c, size) = decode_char(unread);
        self.off += size;
        self.last_read = LastRead::Char(size);
        Ok((c, size))
    }

    fn read_until(&mut self, delim: u8) -> Result<Range<usize>, BufferError> {
        if self.is_empty() {
            self.reset();
            return Err(BufferError::Eof);
        }
        let end = match self.unread().iter().position(|&b| b == delim) {
            Some(i) => self.off + i + 1,
            None => self.buf.len(),
        };
        let start = self.off;
        self.off = end;
        self.last_read = LastRead::Read;
        Ok(start..end)
    }

    fn unread_byte(&mut self) -> Result<(), BufferError> {
        if self.last_read == LastRead::Invalid {
            return Err(BufferError::InvalidUnread);
        }
        self.last_read = LastRead::Invalid;
        if self.off > 0 {
            self.off -= 1;
        }
        Ok(())
    }

    fn unread_char(&mut self) -> Result<(), BufferError> {
        let LastRead::Char(size) = self.last_read else {
            return Err(BufferError::InvalidUnread);
        };
        self.last_read = LastRead::Invalid;
        self.off = self.off.saturating_sub(size);
        Ok(())
    }

    fn truncate(&mut self, n: usize) -> Result<(), BufferError> {
        if n == 0 {
            self.reset();
            return Ok(());
        }
        self.last_read = LastRead::Invalid;
        if n > self.len() {
            return Err(BufferError::OutOfRange {
                requested: n,
                len: self.len(),
            });
        }
        self.buf.truncate(self.off + n);
        Ok(())
    }

    fn grow(&mut self, n: usize) {
        self.make_room(n);
        self.buf.reserve(n);
    }
}

/// Decodes the first UTF-8 scalar of `bytes`. Invalid or truncated input
/// yields U+FFFD with a width of one byte, so the reader always advances.
fn decode_char(bytes: &[u8]) -> (char, usize) {
    let first = bytes[0];
    if first < 0x80 {
        return (first as char, 1);
    }
    let width = match first {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return (char::REPLACEMENT_CHARACTER, 1),
    };
    if bytes.len() < width {
        return (char::REPLACEMENT_CHARACTER, 1);
    }
    match std::str::from_utf8(&bytes[..width])
        .ok()
        .and_then(|s| s.chars().next())
    {
        Some(c) => (c, width),
        None => (char::REPLACEMENT_CHARACTER, 1),
    }
}

/// Byte buffer with serialized access from any number of threads or tasks.
#[derive(Debug, Default)]
pub struct SharedBuffer {
    inner: Mutex<ByteBuffer>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_vec(Vec::with_capacity(capacity))
    }

    /// Takes ownership of `buf`; its contents become the unread data.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(ByteBuffer {
                buf,
                ..ByteBuffer::default()
            }),
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total space allocated for the buffer's data.
    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.capacity()
    }

    /// View of the unread bytes. Holds the buffer lock until dropped.
    pub fn bytes(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.inner.lock(), |inner| {
            let off = inner.off;
            &mut inner.buf[off..]
        })
    }

    /// Consumes up to `n` bytes and returns a view of them. Holds the buffer
    /// lock until dropped.
    pub fn next(&self, n: usize) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.inner.lock(), |inner| {
            let range = inner.next(n);
            &mut inner.buf[range]
        })
    }

    /// Copy of the unread bytes as text, with invalid UTF-8 replaced.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.inner.lock().unread()).into_owned()
    }

    pub fn write_bytes(&self, p: &[u8]) -> usize {
        self.inner.lock().write(p)
    }

    pub fn write_byte(&self, b: u8) {
        self.inner.lock().write(&[b]);
    }

    pub fn write_char(&self, c: char) -> usize {
        let mut encoded = [0u8; 4];
        self.inner.lock().write(c.encode_utf8(&mut encoded).as_bytes())
    }

    pub fn write_str(&self, s: &str) -> usize {
        self.inner.lock().write(s.as_bytes())
    }

    /// Reads into `p`; returns 0 once the buffer is drained.
    pub fn read_into(&self, p: &mut [u8]) -> usize {
        self.inner.lock().read(p)
    }

    pub fn read_byte(&self) -> Result<u8, BufferError> {
        self.inner.lock().read_byte()
    }

    /// Reads one UTF-8 character and returns it with its encoded width.
    pub fn read_char(&self) -> Result<(char, usize), BufferError> {
        self.inner.lock().read_char()
    }

    /// Reads through the first `delim`, inclusive. When `delim` is absent the
    /// remaining data is returned without it; `Eof` means there was no data.
    pub fn read_bytes(&self, delim: u8) -> Result<Vec<u8>, BufferError> {
        let mut inner = self.inner.lock();
        let range = inner.read_until(delim)?;
        Ok(inner.buf[range].to_vec())
    }

    /// [`read_bytes`](Self::read_bytes) as text, with invalid UTF-8 replaced.
    pub fn read_string(&self, delim: u8) -> Result<String, BufferError> {
        let mut inner = self.inner.lock();
        let range = inner.read_until(delim)?;
        Ok(String::from_utf8_lossy(&inner.buf[range]).into_owned())
    }

    /// Removes one complete `\n`-terminated line, without the terminator.
    /// Returns `None` while no full line is buffered, leaving partial data in
    /// place.
    pub fn take_line(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let i = inner.unread().iter().position(|&b| b == b'\n')?;
        let start = inner.off;
        let line = inner.buf[start..start + i].to_vec();
        inner.off += i + 1;
        inner.last_read = LastRead::Read;
        Some(line)
    }

    /// Steps back one byte after a successful read.
    pub fn unread_byte(&self) -> Result<(), BufferError> {
        self.inner.lock().unread_byte()
    }

    /// Steps back over the character returned by the previous `read_char`.
    pub fn unread_char(&self) -> Result<(), BufferError> {
        self.inner.lock().unread_char()
    }

    /// Keeps the first `n` unread bytes and discards the rest.
    pub fn truncate(&self, n: usize) -> Result<(), BufferError> {
        self.inner.lock().truncate(n)
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    /// Guarantees room for `n` more bytes without another allocation.
    pub fn grow(&self, n: usize) {
        self.inner.lock().grow(n);
    }

    /// Appends everything `reader` yields until end of stream. The lock is
    /// held throughout, so concurrent writers land before or after the whole
    /// transfer.
    pub fn read_from<R: Read + ?Sized>(&self, reader: &mut R) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.last_read = LastRead::Invalid;
        let mut total = 0;
        loop {
            inner.make_room(MIN_READ);
            let start = inner.buf.len();
            inner.buf.resize(start + MIN_READ, 0);
            match reader.read(&mut inner.buf[start..]) {
                Ok(0) => {
                    inner.buf.truncate(start);
                    return Ok(total);
                }
                Ok(n) => {
                    inner.buf.truncate(start + n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    inner.buf.truncate(start);
                }
                Err(e) => {
                    inner.buf.truncate(start);
                    return Err(e);
                }
            }
        }
    }

    /// Drains the unread bytes into `writer`. Bytes the writer accepted are
    /// consumed even if a later write fails.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.last_read = LastRead::Invalid;
        let mut written = 0;
        while !inner.is_empty() {
            match writer.write(inner.unread()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    inner.off += n;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        inner.reset();
        Ok(written)
    }
}

impl Read for &SharedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf))
    }
}

impl Write for &SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
