//! Multi-page 16-bit TIFF stacks.
//!
//! Every write job becomes one file holding one grayscale page per frame, in
//! capture order. Reading a stack back yields the pages as frames numbered
//! from zero.
//!
//! # Usage
//!
//! ```rust,ignore
//! use calcium_daq::storage::{StackWriter, TiffStackWriter};
//!
//! TiffStackWriter.write_stack(Path::new("session/burst_001.tif"), &frames)?;
//! let pages = calcium_daq::storage::read_stack("session/burst_001.tif")?;
//! ```

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::Path;
use std::sync::Arc;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};

use crate::data::Frame;
use crate::error::{DaqError, DaqResult};

/// Destination for sealed frame stacks.
///
/// Implementations are called from the writer's blocking context, one job at
/// a time.
pub trait StackWriter: Send + Sync + 'static {
    /// Persist `frames` as a single stack at `path`.
    fn write_stack(&self, path: &Path, frames: &[Arc<Frame>]) -> Result<()>;
}

/// Writes stacks as multi-page 16-bit grayscale TIFF files.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiffStackWriter;

impl StackWriter for TiffStackWriter {
    fn write_stack(&self, path: &Path, frames: &[Arc<Frame>]) -> Result<()> {
        let first = frames
            .first()
            .ok_or_else(|| anyhow!("Cannot write empty frame stack"))?;

        for (i, frame) in frames.iter().enumerate() {
            if !frame.same_shape(first) {
                return Err(anyhow!(
                    "Frame {} has inconsistent dimensions: {}x{} vs expected {}x{}",
                    i,
                    frame.width(),
                    frame.height(),
                    first.width(),
                    first.height()
                ));
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut out = BufWriter::new(file);
        {
            let mut encoder = TiffEncoder::new(&mut out)
                .with_context(|| format!("Failed to start TIFF {:?}", path))?;
            for (i, frame) in frames.iter().enumerate() {
                write_page(&mut encoder, frame)
                    .with_context(|| format!("Failed to encode page {} of {:?}", i, path))?;
            }
        }
        finish(out).with_context(|| format!("Failed to flush {:?}", path))?;

        tracing::info!(
            path = ?path,
            num_frames = frames.len(),
            dimensions = format!("{}x{}", first.width(), first.height()),
            "Wrote TIFF stack"
        );
        Ok(())
    }
}

/// Append one frame as a 16-bit grayscale page.
pub(crate) fn write_page<W: Write + Seek>(
    encoder: &mut TiffEncoder<W>,
    frame: &Frame,
) -> DaqResult<()> {
    encoder.write_image::<colortype::Gray16>(frame.width(), frame.height(), frame.pixels())?;
    Ok(())
}

/// Flush buffered output and push it to stable storage.
pub(crate) fn finish(mut out: BufWriter<File>) -> DaqResult<()> {
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

/// Load every page of a 16-bit grayscale TIFF stack.
pub fn read_stack(path: impl AsRef<Path>) -> DaqResult<Vec<Frame>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))?;

    let mut frames = Vec::new();
    loop {
        let (width, height) = decoder.dimensions()?;
        match decoder.read_image()? {
            DecodingResult::U16(pixels) => {
                frames.push(Frame::from_pixels(width, height, frames.len() as u64, pixels));
            }
            _ => {
                return Err(DaqError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{:?} page {} is not 16-bit grayscale", path, frames.len()),
                )));
            }
        }
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }
    Ok(frames)
}
