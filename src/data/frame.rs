//! Raw visibility payload from one correlator rank for one cycle, and its
//! length-prefixed wire framing.
//!
//! # Wire Layout
//! ```text
//! u32  payload length (big-endian, excludes itself)
//! u32  magic 0x5649_5346 ("VISF")
//! u32  rank
//! u64  timestamp (µs since MJD 0)
//! u32  rows, u32 channels, u32 polarisations
//! f32  re, f32 im   × rows·channels·polarisations   (row-major)
//! u8   flag         × rows·channels·polarisations
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_complex::Complex32;
use std::io::{ErrorKind, Read, Write};

use crate::error::{IngestError, IngestResult};

const FRAME_MAGIC: u32 = 0x5649_5346;
const HEADER_BYTES: usize = 4 + 4 + 8 + 4 * 3;

/// Largest accepted payload (256 MiB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// One rank's visibilities for one integration cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityFrame {
    /// Rank that produced this frame
    pub rank: u32,
    /// Integration midpoint, microseconds since MJD 0
    pub timestamp: u64,
    /// Rows in the payload
    pub n_rows: usize,
    /// Channels contributed by this rank
    pub n_channels: usize,
    /// Polarisation products per sample
    pub n_pols: usize,
    /// Samples, row-major `[row][channel][pol]`
    pub samples: Vec<Complex32>,
    /// Correlator flags, same layout as `samples`
    pub flags: Vec<bool>,
}

impl VisibilityFrame {
    /// Number of samples implied by the header dimensions.
    #[must_use]
    pub fn expected_len(&self) -> usize {
        self.n_rows * self.n_channels * self.n_pols
    }

    /// Check that the payload matches the header dimensions.
    pub fn check_dimensions(&self) -> IngestResult<()> {
        let expected = self.expected_len();
        if self.samples.len() != expected || self.flags.len() != expected {
            return Err(IngestError::DataIntegrity(format!(
                "Rank {} frame carries {} samples / {} flags, header implies {}",
                self.rank,
                self.samples.len(),
                self.flags.len(),
                expected
            )));
        }
        Ok(())
    }

    /// Encode into a length-prefixed buffer.
    pub fn encode(&self) -> IngestResult<Bytes> {
        self.check_dimensions()?;
        let n = self.expected_len();
        let payload_len = HEADER_BYTES + n * 8 + n;
        if payload_len > MAX_FRAME_BYTES {
            return Err(IngestError::Codec(format!(
                "Frame payload of {} bytes exceeds limit",
                payload_len
            )));
        }

        let mut buf = BytesMut::with_capacity(4 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u32(FRAME_MAGIC);
        buf.put_u32(self.rank);
        buf.put_u64(self.timestamp);
        buf.put_u32(self.n_rows as u32);
        buf.put_u32(self.n_channels as u32);
        buf.put_u32(self.n_pols as u32);
        for sample in &self.samples {
            buf.put_f32(sample.re);
            buf.put_f32(sample.im);
        }
        for &flag in &self.flags {
            buf.put_u8(u8::from(flag));
        }
        Ok(buf.freeze())
    }

    /// Decode a payload (without the length prefix).
    pub fn decode(mut payload: Bytes) -> IngestResult<Self> {
        if payload.len() < HEADER_BYTES {
            return Err(IngestError::Codec(format!(
                "Frame payload of {} bytes is shorter than the header",
                payload.len()
            )));
        }
        let magic = payload.get_u32();
        if magic != FRAME_MAGIC {
            return Err(IngestError::Codec(format!(
                "Invalid frame magic: expected 0x{:08X}, got 0x{:08X}",
                FRAME_MAGIC, magic
            )));
        }
        let rank = payload.get_u32();
        let timestamp = payload.get_u64();
        let n_rows = payload.get_u32() as usize;
        let n_channels = payload.get_u32() as usize;
        let n_pols = payload.get_u32() as usize;

        let n = n_rows
            .checked_mul(n_channels)
            .and_then(|v| v.checked_mul(n_pols))
            .ok_or_else(|| IngestError::Codec("Frame dimensions overflow".into()))?;
        let body_len = n
            .checked_mul(9)
            .ok_or_else(|| IngestError::Codec("Frame dimensions overflow".into()))?;
        if payload.remaining() != body_len {
            return Err(IngestError::Codec(format!(
                "Rank {} frame body is {} bytes, dimensions {}x{}x{} need {}",
                rank,
                payload.remaining(),
                n_rows,
                n_channels,
                n_pols,
                body_len
            )));
        }

        let samples = (0..n)
            .map(|_| {
                let re = payload.get_f32();
                let im = payload.get_f32();
                Complex32::new(re, im)
            })
            .collect();
        let flags = (0..n).map(|_| payload.get_u8() != 0).collect();

        Ok(Self {
            rank,
            timestamp,
            n_rows,
            n_channels,
            n_pols,
            samples,
            flags,
        })
    }
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> IngestResult<Option<VisibilityFrame>> {
    let Some(payload) = read_length_prefixed(reader)? else {
        return Ok(None);
    };
    VisibilityFrame::decode(payload).map(Some)
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &VisibilityFrame) -> IngestResult<()> {
    writer.write_all(&frame.encode()?)?;
    Ok(())
}

/// Read a `u32` big-endian length prefix and the payload that follows.
///
/// Shared by the visibility and metadata transports.
pub fn read_length_prefixed<R: Read>(reader: &mut R) -> IngestResult<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(IngestError::Codec(format!(
            "Announced payload of {} bytes exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Bytes::from(payload)))
}

/// Write `payload` behind a `u32` big-endian length prefix.
pub fn write_length_prefixed<W: Write>(writer: &mut W, payload: &[u8]) -> IngestResult<()> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(IngestError::Codec(format!(
            "Payload of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}
