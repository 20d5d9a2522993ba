//! Convolutional classifier for postage-stamp image artifacts, trained with
//! candle on contiguous wrap-around batches of an in-memory design matrix.

pub mod data;
pub mod error;
pub mod model;
pub mod source;
pub mod train;

pub use data::{CyclicCursor, ExampleSet, OneHotIndexing, StampGeometry};
pub use error::{Operation, Result, StampNetError};
pub use model::{ConvNet, ConvNetConfig};
pub use source::{GzCsvSource, StampSource};
pub use train::{ProgressSink, StdoutSink, TrainConfig, TrainingSession};
