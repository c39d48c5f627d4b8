// Header validation
//
// Checks run in a fixed order: magic, declared length, message type, checksum.
// The first two run the moment the 24 header bytes are buffered, before any
// payload is accepted; a peer with the wrong magic may not share our framing
// at all, so nothing past the magic is interpreted in that case.

use crate::crypto::hash::checksum;
use crate::net::frame::RawFrame;
use crate::net::message::MessageHeader;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid message start {msgtype}")]
    InvalidMessageStart { msgtype: String, magic: [u8; 4] },
    #[error("oversized message {msgtype} ({length} bytes, max {max})")]
    Oversized { msgtype: String, length: u32, max: u32 },
    #[error("errors in header {msgtype}")]
    BadMessageType { msgtype: String },
    #[error(
        "checksum error ({msgtype}, {length} bytes), expected {} was {}",
        hex::encode(.expected),
        hex::encode(.actual)
    )]
    ChecksumMismatch {
        msgtype: String,
        length: u32,
        expected: [u8; 4],
        actual: [u8; 4],
    },
}

impl FrameError {
    /// Transport-fatal errors drop the connection; the rest drop one message
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::InvalidMessageStart { .. } | FrameError::Oversized { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderValidator {
    magic: [u8; 4],
    max_length: u32,
}

impl HeaderValidator {
    pub fn new(magic: [u8; 4], max_length: u32) -> Self {
        HeaderValidator { magic, max_length }
    }

    /// Checks that must pass before the payload is buffered
    pub fn check_start(&self, header: &MessageHeader) -> Result<(), FrameError> {
        if header.magic != self.magic {
            return Err(FrameError::InvalidMessageStart {
                msgtype: header.msgtype_lossy(),
                magic: header.magic,
            });
        }
        if header.length > self.max_length {
            return Err(FrameError::Oversized {
                msgtype: header.msgtype_lossy(),
                length: header.length,
                max: self.max_length,
            });
        }
        Ok(())
    }

    /// Checks on a fully buffered frame: message type, then checksum
    pub fn check_frame(&self, frame: &RawFrame) -> Result<(), FrameError> {
        let header = &frame.header;
        if !header.is_msgtype_valid() {
            return Err(FrameError::BadMessageType {
                msgtype: header.msgtype_lossy(),
            });
        }
        let expected = checksum(&frame.payload);
        if expected != header.checksum {
            return Err(FrameError::ChecksumMismatch {
                msgtype: header.msgtype_lossy(),
                length: header.length,
                expected,
                actual: header.checksum,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn validate(&self, frame: &RawFrame) -> Result<(), FrameError> {
        self.check_start(&frame.header)?;
        self.check_frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{HEADER_SIZE, build_raw_frame};

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    fn frame_from(bytes: &[u8]) -> RawFrame {
        let mut hdr = [0u8; HEADER_SIZE];
        hdr.copy_from_slice(&bytes[..HEADER_SIZE]);
        RawFrame {
            header: MessageHeader::from_bytes(&hdr),
            payload: bytes[HEADER_SIZE..].to_vec(),
        }
    }

    #[test]
    fn test_valid_frame_passes() {
        let v = HeaderValidator::new(MAGIC, 4_000_000);
        let f = frame_from(&build_raw_frame(MAGIC, "badmsg", &[1, 0x64]));
        assert_eq!(v.validate(&f), Ok(()));
    }

    #[test]
    fn test_magic_checked_before_everything() {
        let v = HeaderValidator::new(MAGIC, 4_000_000);
        let mut bytes = build_raw_frame(MAGIC, "badmsg", &[1, 0x64]);
        bytes[0..4].copy_from_slice(&[0xff; 4]);
        // also break length and checksum: magic must still be what is reported
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes[20..24].copy_from_slice(&[0xff; 4]);
        let err = v.validate(&frame_from(&bytes)).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessageStart { ref msgtype, .. } if msgtype == "badmsg"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_oversized_is_fatal() {
        let v = HeaderValidator::new(MAGIC, 4_000_000);
        let mut h = MessageHeader::new(MAGIC, "badmsg", b"");
        h.length = 4_000_001;
        let err = v.check_start(&h).unwrap_err();
        assert!(matches!(err, FrameError::Oversized { length: 4_000_001, .. }));
        assert!(err.is_fatal());

        h.length = 4_000_000;
        assert!(v.check_start(&h).is_ok());
    }

    #[test]
    fn test_checksum_error_message() {
        let v = HeaderValidator::new(MAGIC, 4_000_000);
        let mut bytes = build_raw_frame(MAGIC, "badmsg", &[1, 0x64]);
        bytes[20..24].copy_from_slice(&[0xff; 4]);
        let err = v.validate(&frame_from(&bytes)).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "checksum error (badmsg, 2 bytes), expected 78df0a04 was ffffffff"
        );
    }

    #[test]
    fn test_bad_msgtype_before_checksum() {
        let v = HeaderValidator::new(MAGIC, 4_000_000);
        let mut bytes = build_raw_frame(MAGIC, "badmsg", &[1, 0x64]);
        bytes[4..16].copy_from_slice(&[0xff; 12]);
        bytes[7] = 0;
        bytes[20..24].copy_from_slice(&[0xff; 4]);
        let err = v.validate(&frame_from(&bytes)).unwrap_err();
        assert!(matches!(err, FrameError::BadMessageType { .. }));
        assert!(!err.is_fatal());
    }
}
