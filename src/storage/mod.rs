//! Persistence: the ordered frame writer, TIFF stacks, file naming, and the
//! post-run batch merge.

pub mod frame_sink;
pub mod layout;
pub mod merge;
pub mod tiff_stack;

pub use frame_sink::{FrameSink, SinkSummary, WriteJob, DEFAULT_QUEUE_DEPTH};
pub use layout::{BatchStamper, OutputLayout};
pub use merge::{list_batches, merge_batches, MergeReport};
pub use tiff_stack::{read_stack, StackWriter, TiffStackWriter};
