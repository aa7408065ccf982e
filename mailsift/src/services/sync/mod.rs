pub mod change_set;
pub mod coordinator;
pub mod epoch;
pub mod helpers;
pub mod pipeline;
pub mod worker;

pub use coordinator::{commit, purge};
pub use epoch::EpochCheck;
pub use pipeline::{BatchPipeline, ChunkCommit, ChunkFailure, ChunkOutcome};
pub use worker::{run_sync, SyncContext, SyncOptions, SyncReport};
