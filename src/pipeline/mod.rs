pub mod coordinator;
pub mod feed;
pub mod filters;
pub mod stats;
pub mod transform;

pub use coordinator::{Coordinator, PipelineState, PipelineStateKind, StatsReader};
pub use feed::{FeedMessage, FeedPayload, FeedPublisher, FramePayload};
pub use filters::EdgeDetector;
pub use stats::{FpsCounter, Stats, StatsSnapshot};
pub use transform::{
    DrainOutcome, FrameTransform, LatestResult, ModeFlag, ProcessingMode, TransformBoundary,
    TransformError, TransformInput, TransformOptions, TransformOutput, TransformResult,
};
