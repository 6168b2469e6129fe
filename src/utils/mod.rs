pub mod image_ops;
pub mod metrics;

pub use image_ops::{decode_rgb, decode_rgb_async, open_rgb, open_rgb_async};
pub use metrics::{Metrics, MetricsSnapshot, Stage};
