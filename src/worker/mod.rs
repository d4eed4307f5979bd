pub mod consumer;
pub mod reclaimer;

pub use consumer::{Consumer, ConsumerMetrics, ConsumerOptions, MessageHandler};
pub use reclaimer::{Reclaimer, ReclaimerOptions};
