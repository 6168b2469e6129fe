pub mod pipeline;

pub use pipeline::{ScanOutcome, ScanPipeline, ScanPipelineBuilder, ScanReport};
