//! WavStream reader
//!
//! Random-access PCM reads from RIFF, RF64 and BW64 files. Only the header is
//! parsed; sample data is handed out as raw little-endian bytes because the
//! hashing and comparison layers never look at sample values.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::{Result, WavCheckError};

// ═══════════════════════════════════════════════════════════════════════════════
// CHUNK IDS
// ═══════════════════════════════════════════════════════════════════════════════

mod chunks {
    pub const RIFF: [u8; 4] = *b"RIFF";
    pub const RF64: [u8; 4] = *b"RF64";
    pub const BW64: [u8; 4] = *b"BW64";
    pub const WAVE: [u8; 4] = *b"WAVE";
    pub const DS64: [u8; 4] = *b"ds64";
    pub const FMT: [u8; 4] = *b"fmt ";
    pub const DATA: [u8; 4] = *b"data";
}

const FORMAT_PCM: u16 = 0x0001;
const FORMAT_IEEE_FLOAT: u16 = 0x0003;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// 32-bit size field value meaning "look in ds64"
const SIZE_IN_DS64: u32 = 0xFFFF_FFFF;

/// Largest ds64 or fmt body read into memory
const MAX_HEADER_CHUNK: u32 = 64 * 1024;

// ═══════════════════════════════════════════════════════════════════════════════
// WAV STREAM
// ═══════════════════════════════════════════════════════════════════════════════

/// An open PCM stream
///
/// Positions and counts are in PCM sample frames (one sample for every
/// channel), not video frames.
#[derive(Debug)]
pub struct WavStream<R = BufReader<File>> {
    reader: R,
    channels: u16,
    sample_rate: u32,
    sample_width: usize,
    data_offset: u64,
    data_len: u64,
    /// Byte position relative to `data_offset`
    pos: u64,
}

impl WavStream<BufReader<File>> {
    /// Open a WAV file from disk
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::from_reader(BufReader::with_capacity(1 << 20, file)).map_err(|e| match e {
            WavCheckError::Format(msg) => {
                WavCheckError::Format(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }
}

impl<R: Read + Seek> WavStream<R> {
    /// Parse the header and leave the stream positioned at the first sample
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut id = [0u8; 4];
        let mut size = [0u8; 4];
        read_or_format(&mut reader, &mut id, "missing RIFF header")?;
        read_or_format(&mut reader, &mut size, "missing RIFF size")?;
        let is_64 = match id {
            chunks::RIFF => false,
            chunks::RF64 | chunks::BW64 => true,
            _ => return Err(WavCheckError::Format("not a RIFF/RF64 file".into())),
        };
        read_or_format(&mut reader, &mut id, "missing WAVE tag")?;
        if id != chunks::WAVE {
            return Err(WavCheckError::Format("not a WAVE file".into()));
        }

        let mut ds64_data_len: Option<u64> = None;
        let mut format: Option<(u16, u32, u16)> = None;
        let mut data: Option<(u64, u64)> = None;

        while data.is_none() {
            match reader.read_exact(&mut id) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            read_or_format(&mut reader, &mut size, "truncated chunk header")?;
            let chunk_size = u32::from_le_bytes(size);

            match id {
                chunks::DS64 => {
                    let mut body = header_body(chunk_size, "ds64")?;
                    read_or_format(&mut reader, &mut body, "truncated ds64 chunk")?;
                    if body.len() < 24 {
                        return Err(WavCheckError::Format("ds64 chunk too short".into()));
                    }
                    ds64_data_len = Some(le_u64(&body[8..16]));
                }
                chunks::FMT => {
                    let mut body = header_body(chunk_size, "fmt")?;
                    read_or_format(&mut reader, &mut body, "truncated fmt chunk")?;
                    format = Some(parse_fmt(&body)?);
                }
                chunks::DATA => {
                    let offset = reader.stream_position()?;
                    let declared = if chunk_size == SIZE_IN_DS64 && is_64 {
                        ds64_data_len.ok_or_else(|| {
                            WavCheckError::Format("RF64 data chunk without ds64 size".into())
                        })?
                    } else {
                        chunk_size as u64
                    };
                    // Streaming writers leave placeholder sizes behind
                    let available = file_len.saturating_sub(offset);
                    data = Some((offset, declared.min(available)));
                }
                _ => {
                    reader.seek(SeekFrom::Current(chunk_size as i64))?;
                }
            }

            if id != chunks::DATA && chunk_size % 2 == 1 {
                reader.seek(SeekFrom::Current(1))?;
            }
        }

        let (channels, sample_rate, bits) =
            format.ok_or_else(|| WavCheckError::Format("no fmt chunk before data".into()))?;
        let (data_offset, data_len) =
            data.ok_or_else(|| WavCheckError::Format("no data chunk".into()))?;

        let sample_width = match bits {
            16 => 2,
            24 => 3,
            32 => 4,
            other => {
                return Err(WavCheckError::Format(format!("unsupported bit depth {other}")));
            }
        };
        if channels == 0 || sample_rate == 0 {
            return Err(WavCheckError::Format("zero channels or sample rate".into()));
        }

        let block = sample_width as u64 * channels as u64;
        let data_len = data_len - data_len % block;

        reader.seek(SeekFrom::Start(data_offset))?;
        log::debug!(
            "wav: {}ch {}Hz {}-bit, {} bytes of PCM at offset {}{}",
            channels,
            sample_rate,
            bits,
            data_len,
            data_offset,
            if is_64 { " (RF64)" } else { "" }
        );

        Ok(Self {
            reader,
            channels,
            sample_rate,
            sample_width,
            data_offset,
            data_len,
            pos: 0,
        })
    }

    /// Bytes per single-channel sample (2, 3 or 4)
    pub fn sample_width(&self) -> usize {
        self.sample_width
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bytes per PCM sample frame across all channels
    pub fn sample_bytes(&self) -> usize {
        self.sample_width * self.channels as usize
    }

    /// Total PCM sample frames in the data chunk
    pub fn total_frames(&self) -> u64 {
        self.data_len / self.sample_bytes() as u64
    }

    /// Size of the PCM payload in bytes
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Current read position in sample frames
    pub fn position(&self) -> u64 {
        self.pos / self.sample_bytes() as u64
    }

    pub fn remaining_frames(&self) -> u64 {
        (self.data_len - self.pos) / self.sample_bytes() as u64
    }

    /// Move the read position, clamped to the end of the data
    pub fn seek_to(&mut self, frame: u64) -> Result<()> {
        let target = frame
            .saturating_mul(self.sample_bytes() as u64)
            .min(self.data_len);
        self.reader.seek(SeekFrom::Start(self.data_offset + target))?;
        self.pos = target;
        Ok(())
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.seek_to(0)
    }

    /// Skip forward, returning how many frames were actually skipped
    pub fn skip(&mut self, frames: u64) -> Result<u64> {
        let start = self.position();
        self.seek_to(start.saturating_add(frames))?;
        Ok(self.position() - start)
    }

    /// Read up to `frames` sample frames into `buf` (replacing its contents)
    ///
    /// Returns the number of bytes read; 0 means end of data.
    pub fn read_frames(&mut self, frames: u64, buf: &mut Vec<u8>) -> Result<usize> {
        buf.clear();
        let want = frames
            .saturating_mul(self.sample_bytes() as u64)
            .min(self.data_len - self.pos);
        if want == 0 {
            return Ok(0);
        }
        let got = (&mut self.reader).take(want).read_to_end(buf)?;
        self.pos += got as u64;
        Ok(got)
    }

    /// The last `frames` sample frames of the stream, without moving the cursor
    pub fn read_tail(&mut self, frames: u64) -> Result<Vec<u8>> {
        let saved = self.position();
        let start = self.total_frames().saturating_sub(frames);
        self.seek_to(start)?;
        let mut tail = Vec::new();
        self.read_frames(frames, &mut tail)?;
        self.seek_to(saved)?;
        Ok(tail)
    }
}

fn read_or_format<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => WavCheckError::Format(what.to_string()),
        _ => WavCheckError::Io(e),
    })
}

fn header_body(chunk_size: u32, name: &str) -> Result<Vec<u8>> {
    if chunk_size > MAX_HEADER_CHUNK {
        return Err(WavCheckError::Format(format!(
            "{name} chunk declares {chunk_size} bytes"
        )));
    }
    Ok(vec![0u8; chunk_size as usize])
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}

/// (channels, sample_rate, bits_per_sample) from a fmt chunk body
fn parse_fmt(body: &[u8]) -> Result<(u16, u32, u16)> {
    if body.len() < 16 {
        return Err(WavCheckError::Format("fmt chunk too short".into()));
    }
    let mut tag = le_u16(&body[0..2]);
    let channels = le_u16(&body[2..4]);
    let sample_rate = le_u32(&body[4..8]);
    let bits = le_u16(&body[14..16]);

    if tag == FORMAT_EXTENSIBLE {
        // cbSize(2) validBits(2) channelMask(4) then the SubFormat GUID
        if body.len() < 26 {
            return Err(WavCheckError::Format("WAVE_FORMAT_EXTENSIBLE without SubFormat".into()));
        }
        tag = le_u16(&body[24..26]);
    }

    match tag {
        FORMAT_PCM => Ok((channels, sample_rate, bits)),
        FORMAT_IEEE_FLOAT => Err(WavCheckError::Format(
            "IEEE float samples are not supported".into(),
        )),
        other => Err(WavCheckError::Format(format!(
            "format tag 0x{other:04X} is not linear PCM"
        ))),
    }
}
