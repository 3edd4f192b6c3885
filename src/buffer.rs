//! Bounds-checked response writer
//!
//! Every synthesized response is built into a zeroed scratch buffer through a
//! [`ResponseBuf`]. Running past the end of the scratch buffer fails the
//! command with a communication failure instead of corrupting memory.

use crate::sense::SenseReason;
use byteorder::{BigEndian, ByteOrder};
use log::error;

/// Size of the scratch buffer handed to INQUIRY and MODE SENSE emulation
pub const SCRATCH_BUF_LEN: usize = 512;

/// Cursor over a zeroed output buffer
pub struct ResponseBuf<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ResponseBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        buf.fill(0);
        ResponseBuf { buf, pos: 0 }
    }

    /// Bytes written so far
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Claim the next `len` bytes and return them zeroed
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8], SenseReason> {
        if len > self.remaining() {
            error!(
                "response overflow: {} bytes requested at offset {} of {}",
                len,
                self.pos,
                self.buf.len()
            );
            return Err(SenseReason::LogicalUnitCommunicationFailure);
        }
        let start = self.pos;
        self.pos += len;
        let out = &mut self.buf[start..self.pos];
        out.fill(0);
        Ok(out)
    }

    /// Skip `len` bytes, leaving them zero
    pub fn skip(&mut self, len: usize) -> Result<(), SenseReason> {
        self.reserve(len).map(|_| ())
    }

    pub fn put_u8(&mut self, val: u8) -> Result<(), SenseReason> {
        self.reserve(1)?[0] = val;
        Ok(())
    }

    pub fn put_u16(&mut self, val: u16) -> Result<(), SenseReason> {
        BigEndian::write_u16(self.reserve(2)?, val);
        Ok(())
    }

    pub fn put_u32(&mut self, val: u32) -> Result<(), SenseReason> {
        BigEndian::write_u32(self.reserve(4)?, val);
        Ok(())
    }

    pub fn put_u64(&mut self, val: u64) -> Result<(), SenseReason> {
        BigEndian::write_u64(self.reserve(8)?, val);
        Ok(())
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> Result<(), SenseReason> {
        self.reserve(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Write `data` into a fixed-width field, padding with `pad`
    pub fn put_padded(&mut self, data: &[u8], width: usize, pad: u8) -> Result<(), SenseReason> {
        let field = self.reserve(width)?;
        field.fill(pad);
        let n = data.len().min(width);
        field[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    /// Mutable access to bytes that have already been written
    pub fn written_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], SenseReason> {
        match offset.checked_add(len) {
            Some(end) if end <= self.pos => Ok(&mut self.buf[offset..end]),
            _ => Err(SenseReason::LogicalUnitCommunicationFailure),
        }
    }

    pub fn set_u8(&mut self, offset: usize, val: u8) -> Result<(), SenseReason> {
        self.written_mut(offset, 1)?[0] = val;
        Ok(())
    }

    pub fn set_u16(&mut self, offset: usize, val: u16) -> Result<(), SenseReason> {
        BigEndian::write_u16(self.written_mut(offset, 2)?, val);
        Ok(())
    }

    /// Drop everything written after `mark`
    pub fn rewind(&mut self, mark: usize) {
        if mark < self.pos {
            self.buf[mark..self.pos].fill(0);
            self.pos = mark;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}
