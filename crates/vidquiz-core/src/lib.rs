//! Video to quiz pipeline: validation, media extraction, model stages and
//! the task orchestrator that ties them together.

pub mod archive;
pub mod config;
pub mod media;
pub mod model;
pub mod runtime;
pub mod source;
pub mod stages;
pub mod store;

pub use config::PipelineConfig;
pub use model::{Quiz, QuizKind, Segment, VideoMetadata};
pub use runtime::events::{EventSink, SubscriberId, TaskEvent};
pub use runtime::governor::HardwareProfile;
pub use runtime::orchestrator::{Orchestrator, PipelineDeps, Submission, TaskRequest};
pub use runtime::storage::{TaskSnapshot, TaskSource};
pub use runtime::types::{ProcessingStage, RuntimeError, TaskId, TaskStatus};
pub use store::{DurableStore, StoreError, StoredTask};
