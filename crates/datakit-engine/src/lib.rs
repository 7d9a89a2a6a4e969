//! Dataset compiler: transforms, validation, sharded storage, index queries
//! and secondary export for robot-trajectory datasets.

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod errors;
pub mod export;
pub mod index;
pub mod orchestrator;
pub mod provenance;
pub mod result;
pub mod source;
pub mod split;
pub mod storage;
pub mod transform;
pub mod validate;

// Re-export public API for convenience
pub use cancel::CancelToken;
pub use context::CompileContext;
pub use errors::{CompileError, ExitStatus};
pub use export::{export_dataset, ExportInfo, ExportOptions};
pub use index::{slice_dataset, EpisodeIndex, Predicate, SliceMode, SliceRequest};
pub use orchestrator::{compile, compile_source, validate_only, validate_source};
pub use result::{CompileResult, DispositionTally, ValidateResult};
