// Incremental frame reader
//
// Bytes may arrive split at any offset. The header is collected into a fixed
// 24-byte buffer; once complete its start checks run, then the payload is
// collected until `length` bytes are present. Only then is a frame emitted.

use std::collections::VecDeque;

use crate::net::message::{HEADER_SIZE, MessageHeader};
use crate::net::validation::{FrameError, HeaderValidator};

/// Payload buffer growth step; a declared length never reserves more than this up front
const PAYLOAD_RESERVE_STEP: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Bytes this frame occupied on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

pub struct FrameReader {
    validator: HeaderValidator,
    hdr_buf: [u8; HEADER_SIZE],
    hdr_pos: usize,
    header: Option<MessageHeader>,
    payload: Vec<u8>,
    ready: VecDeque<RawFrame>,
}

impl FrameReader {
    pub fn new(validator: HeaderValidator) -> Self {
        FrameReader {
            validator,
            hdr_buf: [0u8; HEADER_SIZE],
            hdr_pos: 0,
            header: None,
            payload: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn validator(&self) -> &HeaderValidator {
        &self.validator
    }

    /// Append a chunk. Returns the number of frames completed by this chunk.
    /// A fatal start check stops consumption; the reader must not be fed again.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<usize, FrameError> {
        let mut completed = 0;
        while !data.is_empty() {
            let consumed = match self.header {
                None => self.read_header(data)?,
                Some(header) => self.read_payload(header.length as usize, data),
            };
            data = &data[consumed..];
            if self.try_complete() {
                completed += 1;
            }
        }
        Ok(completed)
    }

    fn read_header(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        let n = (HEADER_SIZE - self.hdr_pos).min(data.len());
        self.hdr_buf[self.hdr_pos..self.hdr_pos + n].copy_from_slice(&data[..n]);
        self.hdr_pos += n;
        if self.hdr_pos == HEADER_SIZE {
            let header = MessageHeader::from_bytes(&self.hdr_buf);
            self.validator.check_start(&header)?;
            self.payload = Vec::with_capacity((header.length as usize).min(PAYLOAD_RESERVE_STEP));
            self.header = Some(header);
        }
        Ok(n)
    }

    fn read_payload(&mut self, length: usize, data: &[u8]) -> usize {
        let n = (length - self.payload.len()).min(data.len());
        if self.payload.capacity() - self.payload.len() < n {
            let want = (self.payload.len() + n).max(self.payload.len() + PAYLOAD_RESERVE_STEP);
            self.payload.reserve(want.min(length) - self.payload.len());
        }
        self.payload.extend_from_slice(&data[..n]);
        n
    }

    fn try_complete(&mut self) -> bool {
        match self.header {
            Some(header) if self.payload.len() == header.length as usize => {
                let payload = std::mem::take(&mut self.payload);
                self.ready.push_back(RawFrame { header, payload });
                self.header = None;
                self.hdr_pos = 0;
                true
            }
            _ => false,
        }
    }

    pub fn pop_frame(&mut self) -> Option<RawFrame> {
        self.ready.pop_front()
    }

    #[cfg(test)]
    pub fn has_frame(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Bytes held for the frame currently being assembled
    pub fn partial_len(&self) -> usize {
        if self.header.is_some() {
            HEADER_SIZE + self.payload.len()
        } else {
            self.hdr_pos
        }
    }
}
