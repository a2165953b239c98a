//! Stream compression for the carbon connection.
//!
//! The write path only needs an encoder that consumes arbitrary bytes and
//! emits a self-delimited stream, and a matching decoder for receivers and
//! tests. Both sit behind [`Compressor`] so the transport does not care
//! which codec is configured.
//!
//! - [`Plain`] copies bytes through unchanged.
//! - [`Lz4`] writes one LZ4 frame per call, configured from
//!   [`Lz4Preferences`].

use std::fmt;
use std::io::{self, Read, Write};

use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};

use crate::config::{CompressType, Lz4BlockSize, Lz4Preferences};

/// Chunk size fed to the encoder when `auto_flush` is set.
const AUTO_FLUSH_CHUNK: usize = 64 * 1024;

/// A streaming encoder/decoder pair.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Codec name, for logs.
    fn name(&self) -> &'static str;

    /// Encodes `input` into `sink`. All pending output is flushed into
    /// `sink` before this returns.
    ///
    /// Returns the number of input bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised by `sink` or by the encoder.
    fn compress(&self, input: &[u8], sink: &mut dyn Write) -> io::Result<u64>;

    /// Decodes a stream produced by [`compress`](Self::compress).
    ///
    /// Returns the number of decoded bytes written to `sink`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the stream is corrupt or truncated.
    fn decompress(&self, input: &mut dyn Read, sink: &mut dyn Write) -> io::Result<u64>;
}

/// Builds the compressor selected by the configuration.
pub fn from_config(kind: CompressType, preferences: &Lz4Preferences) -> Box<dyn Compressor> {
    match kind {
        CompressType::Plain => Box::new(Plain),
        CompressType::Lz4 => Box::new(Lz4::new(preferences)),
    }
}

/// Pass-through codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain;

impl Compressor for Plain {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn compress(&self, input: &[u8], sink: &mut dyn Write) -> io::Result<u64> {
        sink.write_all(input)?;
        sink.flush()?;
        Ok(input.len() as u64)
    }

    fn decompress(&self, input: &mut dyn Read, sink: &mut dyn Write) -> io::Result<u64> {
        io::copy(input, sink)
    }
}

/// LZ4 frame codec.
#[derive(Debug, Clone)]
pub struct Lz4 {
    frame_info: FrameInfo,
    auto_flush: bool,
}

impl Lz4 {
    /// Creates an LZ4 codec from the configured preferences.
    ///
    /// `compression_level` and `decompression_speed` are not used: the frame
    /// encoder always runs the fast mode.
    pub fn new(preferences: &Lz4Preferences) -> Self {
        let frame = &preferences.frame;
        let block_size = match frame.block_size {
            Lz4BlockSize::Default => BlockSize::Auto,
            Lz4BlockSize::Max64Kb => BlockSize::Max64KB,
            Lz4BlockSize::Max256Kb => BlockSize::Max256KB,
            Lz4BlockSize::Max1Mb => BlockSize::Max1MB,
            Lz4BlockSize::Max4Mb => BlockSize::Max4MB,
        };
        let block_mode = if frame.block_mode {
            BlockMode::Linked
        } else {
            BlockMode::Independent
        };

        Self {
            frame_info: FrameInfo::new()
                .block_size(block_size)
                .block_mode(block_mode)
                .content_checksum(frame.content_checksum)
                .block_checksums(frame.block_checksum),
            auto_flush: preferences.auto_flush,
        }
    }
}

impl Compressor for Lz4 {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, input: &[u8], sink: &mut dyn Write) -> io::Result<u64> {
        let mut encoder = FrameEncoder::with_frame_info(self.frame_info.clone(), sink);
        if self.auto_flush {
            for chunk in input.chunks(AUTO_FLUSH_CHUNK) {
                encoder.write_all(chunk)?;
                encoder.flush()?;
            }
        } else {
            encoder.write_all(input)?;
        }
        let sink = encoder.finish()?;
        sink.flush()?;
        Ok(input.len() as u64)
    }

    fn decompress(&self, input: &mut dyn Read, sink: &mut dyn Write) -> io::Result<u64> {
        let mut decoder = FrameDecoder::new(input);
        io::copy(&mut decoder, sink)
    }
}
