pub mod proxy;
pub mod tail;
pub mod upstream;

pub use tail::{CommandTailer, LogTailer};
pub use upstream::{UpstreamManager, UpstreamSubscription};
