//! Post-run merge of fixed-interval batch files.
//!
//! Batches are concatenated in timestamp order into one stack. The merged
//! stack is written to a temporary file and renamed into place before any
//! input is deleted, so an interrupted merge never loses frames.

use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tiff::encoder::TiffEncoder;
use tracing::{info, warn};

use crate::error::{DaqError, DaqResult};
use crate::storage::layout::OutputLayout;
use crate::storage::tiff_stack::{finish, read_stack, write_page};

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Final merged stack
    pub output: PathBuf,
    /// Batches merged, in merge order
    pub inputs: Vec<PathBuf>,
    /// Pages in the merged stack
    pub frames: usize,
}

/// Batch files of `layout`, oldest first.
pub fn list_batches(layout: &OutputLayout) -> DaqResult<Vec<PathBuf>> {
    let mut batches = Vec::new();
    for entry in std::fs::read_dir(layout.dir())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(stamp) = name.to_str().and_then(|n| layout.batch_stamp(n)) {
            batches.push((stamp, entry.path()));
        }
    }
    batches.sort();
    Ok(batches.into_iter().map(|(_, path)| path).collect())
}

/// Merge every batch of `layout` into a single stack.
///
/// Returns `Ok(None)` when there is nothing to merge. Inputs are deleted only
/// after the merged file has been renamed into place.
pub fn merge_batches(layout: &OutputLayout) -> DaqResult<Option<MergeReport>> {
    let inputs = list_batches(layout)?;
    if inputs.is_empty() {
        return Ok(None);
    }

    let tmp = layout.dir().join(format!(".{}_merge.tmp", layout.stem()));
    let frames = match write_merged(&tmp, &inputs) {
        Ok(frames) => frames,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    };

    let output = layout.unique_merged_path();
    std::fs::rename(&tmp, &output)?;
    info!(
        output = ?output,
        batches = inputs.len(),
        frames,
        "Merged batch stacks"
    );

    for input in &inputs {
        if let Err(e) = std::fs::remove_file(input) {
            warn!("Could not delete merged batch {:?}: {}", input, e);
        }
    }

    Ok(Some(MergeReport {
        output,
        inputs,
        frames,
    }))
}

fn write_merged(tmp: &std::path::Path, inputs: &[PathBuf]) -> DaqResult<usize> {
    let mut out = BufWriter::new(File::create(tmp)?);
    let mut frames = 0;
    let mut shape = None;
    {
        let mut encoder = TiffEncoder::new(&mut out)?;
        for input in inputs {
            for page in read_stack(input)? {
                let dims = (page.width(), page.height());
                match shape {
                    None => shape = Some(dims),
                    Some(expected) if expected != dims => {
                        return Err(DaqError::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!(
                                "{:?} is {}x{}, earlier batches are {}x{}",
                                input, dims.0, dims.1, expected.0, expected.1
                            ),
                        )));
                    }
                    Some(_) => {}
                }
                write_page(&mut encoder, &page)?;
                frames += 1;
            }
        }
    }
    finish(out)?;
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Frame;
    use crate::storage::tiff_stack::{StackWriter, TiffStackWriter};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_batch(layout: &OutputLayout, stamp: i64, values: &[u16]) {
        let frames: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| Arc::new(Frame::from_pixels(4, 4, i as u64, vec![v; 16])))
            .collect();
        TiffStackWriter
            .write_stack(&layout.batch_path(stamp), &frames)
            .unwrap();
    }

    #[test]
    fn merges_in_timestamp_order_and_removes_inputs() {
        let tmp = TempDir::new().unwrap();
        let layout = OutputLayout::new(tmp.path(), "m1");
        write_batch(&layout, 3_000, &[5, 6]);
        write_batch(&layout, 1_000, &[1, 2]);
        write_batch(&layout, 2_000, &[3, 4]);

        let report = merge_batches(&layout).unwrap().unwrap();

        assert_eq!(report.output, tmp.path().join("m1.tif"));
        assert_eq!(report.frames, 6);
        let firsts: Vec<u16> = read_stack(&report.output)
            .unwrap()
            .iter()
            .map(|f| f.pixels()[0])
            .collect();
        assert_eq!(firsts, vec![1, 2, 3, 4, 5, 6]);
        assert!(list_batches(&layout).unwrap().is_empty());
    }

    #[test]
    fn second_merge_gets_unique_name() {
        let tmp = TempDir::new().unwrap();
        let layout = OutputLayout::new(tmp.path(), "m1");
        write_batch(&layout, 1_000, &[1]);
        merge_batches(&layout).unwrap();
        write_batch(&layout, 2_000, &[2]);

        let report = merge_batches(&layout).unwrap().unwrap();
        assert_eq!(report.output, tmp.path().join("m1_E1.tif"));
        assert!(tmp.path().join("m1.tif").exists());
    }

    #[test]
    fn nothing_to_merge() {
        let tmp = TempDir::new().unwrap();
        let layout = OutputLayout::new(tmp.path(), "m1");
        assert_eq!(merge_batches(&layout).unwrap(), None);
    }

    #[test]
    fn unreadable_batch_keeps_inputs() {
        let tmp = TempDir::new().unwrap();
        let layout = OutputLayout::new(tmp.path(), "m1");
        write_batch(&layout, 1_000, &[1]);
        std::fs::write(layout.batch_path(2_000), b"not a tiff").unwrap();

        assert!(merge_batches(&layout).is_err());
        assert_eq!(list_batches(&layout).unwrap().len(), 2);
        assert!(!tmp.path().join("m1.tif").exists());
    }
}
