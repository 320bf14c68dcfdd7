//! Binary trajectory frame encoder.
//!
//! Each frame is one self-delimiting block: a big-endian header
//! `{magic, natoms, step, time, box[3][3], precision}` followed by a
//! length-prefixed deflate-compressed payload of fixed-point coordinates
//! (`round(x * precision)` as `i32`). The writer is append-only, bound to
//! one sink, and not thread-safe; `append` writes exactly one block.

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::ZlibEncoder;

/// Block magic, `"GTRJ"`.
pub const FRAME_MAGIC: u32 = 0x4754_524A;

/// Default coordinate precision (nm are stored as thousandths).
pub const DEFAULT_PRECISION: f32 = 1000.0;

/// Append-only frame writer over one sink.
pub struct FrameWriter<W: Write> {
    sink: W,
    precision: f32,
}

impl<W: Write> FrameWriter<W> {
    /// Binds a writer to `sink` with the default precision.
    #[must_use]
    pub fn new(sink: W) -> Self {
        Self::with_precision(sink, DEFAULT_PRECISION)
    }

    /// Binds a writer to `sink` with an explicit precision.
    #[must_use]
    pub fn with_precision(sink: W, precision: f32) -> Self {
        Self { sink, precision }
    }

    /// Writes exactly one frame block.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the sink rejects the write.
    #[allow(clippy::cast_possible_truncation)]
    pub fn append(
        &mut self,
        step: u64,
        time_ps: f32,
        box_vectors: &[[f32; 3]; 3],
        positions: &[[f32; 3]],
    ) -> io::Result<()> {
        let mut header = Vec::with_capacity(64);
        header.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        header.extend_from_slice(&(positions.len() as u32).to_be_bytes());
        header.extend_from_slice(&step.to_be_bytes());
        header.extend_from_slice(&time_ps.to_be_bytes());
        for row in box_vectors {
            for component in row {
                header.extend_from_slice(&component.to_be_bytes());
            }
        }
        header.extend_from_slice(&self.precision.to_be_bytes());

        let mut fixed = Vec::with_capacity(positions.len() * 12);
        for position in positions {
            for component in position {
                let scaled = (component * self.precision).round() as i32;
                fixed.extend_from_slice(&scaled.to_be_bytes());
            }
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&fixed)?;
        let compressed = encoder.finish()?;

        self.sink.write_all(&header)?;
        self.sink
            .write_all(&(compressed.len() as u32).to_be_bytes())?;
        self.sink.write_all(&compressed)?;
        Ok(())
    }

    /// Releases the sink.
    pub fn into_inner(self) -> W {
        self.sink
    }
}
