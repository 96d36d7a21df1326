//! Worker Protocol: dispatcher <-> analyzer worker process
//!
//! Frames travel over the worker's stdin (calls) and stdout (replies).
//!
//! # Frame Format
//!
//! Header (16 bytes, Network Byte Order / Big Endian):
//! ```text
//! [VER:1][OP:1][RES:2][CALL_ID:8][LEN:4]
//! ```
//!
//! - VER (u8): Protocol version (0x01)
//! - OP (u8): OpCode
//! - RES (u16): Reserved
//! - CALL_ID (u64): Correlates a reply with its call
//! - LEN (u32): JSON payload length in bytes
//!
//! A worker answers every `Call` with exactly one `Result` or `Failed`
//! carrying the same call id, in order.

pub mod attributes;
pub mod defaults;
pub mod error;
pub mod http_types;
pub mod ids;
pub mod types;

pub use attributes::{
    combine, AttributeMapping, AuthorDetection, CopyrightDetection, HolderDetection,
    LicenseDetection, LicenseMatch, ResourceAttributes, Truthy,
};
pub use error::{ProtocolError, Result};
pub use http_types::{
    ActiveScansResponse, ErrorResponse, HealthResponse, ScanAccepted, ScanRequest, TaskState,
    TaskStatusResponse,
};
pub use ids::{IdParseError, TaskId};
pub use types::{AnalyzerCall, AnalyzerOptions, Deadline, FailureKind, FailurePayload};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Cursor, Read, Write};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest accepted payload (64 MB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Dispatcher -> Worker
    Call = 1, // "Run this analyzer on this file."

    // Worker -> Dispatcher
    Result = 2, // "Here is the attribute mapping."
    Failed = 3, // "The analyzer raised."
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Call),
            2 => Ok(OpCode::Result),
            3 => Ok(OpCode::Failed),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub call_id: u64,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, call_id: u64, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            call_id,
            payload_len,
        }
    }

    /// Pack header into a 16-byte buffer.
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_u64::<BigEndian>(self.call_id)?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;

        Ok(buf)
    }

    /// Unpack header from a buffer of at least 16 bytes.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let call_id = cursor.read_u64::<BigEndian>()?;
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            version,
            opcode: OpCode::from_u8(op_raw)?,
            reserved,
            call_id,
            payload_len,
        })
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: OpCode, call_id: u64, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = Header::new(opcode, call_id, payload.len() as u32);
        Ok(Self { header, payload })
    }

    fn encode<T: Serialize>(opcode: OpCode, call_id: u64, body: &T) -> Result<Self> {
        Self::new(opcode, call_id, serde_json::to_vec(body)?)
    }

    pub fn call(call_id: u64, call: &AnalyzerCall) -> Result<Self> {
        Self::encode(OpCode::Call, call_id, call)
    }

    pub fn result(call_id: u64, mapping: &AttributeMapping) -> Result<Self> {
        Self::encode(OpCode::Result, call_id, mapping)
    }

    pub fn failed(call_id: u64, failure: &FailurePayload) -> Result<Self> {
        Self::encode(OpCode::Failed, call_id, failure)
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    pub fn call_id(&self) -> u64 {
        self.header.call_id
    }

    /// Deserialize the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Header and payload as one buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.pack()?);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Write the frame and flush.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one frame. `Ok(None)` on a clean end of stream before a header.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(ProtocolError::HeaderTooShort {
                        expected: HEADER_SIZE,
                        got: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let header = Header::unpack(&buf)?;
        let mut payload = vec![0u8; header.payload_len as usize];
        reader.read_exact(&mut payload)?;
        Ok(Some(Self { header, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_call() -> AnalyzerCall {
        AnalyzerCall {
            analyzer: "copyrights".to_string(),
            location: PathBuf::from("/src/lib.rs"),
            deadline: Deadline::none(),
            options: AnalyzerOptions::default(),
        }
    }

    #[test]
    fn test_header_layout() {
        let header = Header::new(OpCode::Result, 0x0102_0304_0506_0708, 42);
        let packed = header.pack().unwrap();

        assert_eq!(packed[0], PROTOCOL_VERSION);
        assert_eq!(packed[1], OpCode::Result.as_u8());
        assert_eq!(&packed[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&packed[12..16], &[0, 0, 0, 42]);
        assert_eq!(Header::unpack(&packed).unwrap(), header);
    }

    #[test]
    fn test_stream_of_frames() {
        let mut wire = Vec::new();
        Frame::call(1, &sample_call()).unwrap().write_to(&mut wire).unwrap();
        Frame::failed(
            1,
            &FailurePayload {
                analyzer: "copyrights".to_string(),
                message: "boom".to_string(),
                kind: FailureKind::Analyzer,
            },
        )
        .unwrap()
        .write_to(&mut wire)
        .unwrap();

        let mut reader = Cursor::new(wire);
        let call = Frame::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(call.opcode(), OpCode::Call);
        assert_eq!(call.decode::<AnalyzerCall>().unwrap(), sample_call());

        let failed = Frame::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(failed.opcode(), OpCode::Failed);
        assert_eq!(failed.decode::<FailurePayload>().unwrap().message, "boom");

        assert!(Frame::read_from(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_truncated_header_is_error() {
        let mut reader = Cursor::new(vec![PROTOCOL_VERSION, 1, 0]);
        let err = Frame::read_from(&mut reader).unwrap_err();
        assert!(matches!(err, ProtocolError::HeaderTooShort { got: 3, .. }));
    }

    #[test]
    fn test_rejects_unknown_version_and_opcode() {
        let mut packed = Header::new(OpCode::Call, 7, 0).pack().unwrap();
        packed[0] = 0x09;
        assert!(matches!(
            Header::unpack(&packed),
            Err(ProtocolError::VersionMismatch { got: 0x09, .. })
        ));

        let mut packed = Header::new(OpCode::Call, 7, 0).pack().unwrap();
        packed[1] = 99;
        assert!(matches!(
            Header::unpack(&packed),
            Err(ProtocolError::InvalidOpCode(99))
        ));
    }
}
