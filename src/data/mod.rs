//! Frame data types shared by every stage of the pipeline.
pub mod frame;

pub use frame::{Frame, RawImage};
