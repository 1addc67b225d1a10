pub mod handlers;
mod recorder;
mod registry;

pub use recorder::{Recorder, RecorderFactory, RecorderSnapshot, RecordingMeta, RecordingParams};
pub use registry::Registry;
