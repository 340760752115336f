//! On-disk output: the JSONL record tree, the progress report, and the
//! resume state.

mod progress;
mod resume;
mod writer;

pub use progress::{ProgressReport, ProgressReporter, ReportedError, ResourceCounters};
pub use resume::{ResumeState, ResumeStore};
pub use writer::{HierarchicalWriter, file_stem, sanitize_component};
