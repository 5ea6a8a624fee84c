//! Data model of the transfer engine: nodes, jobs, tasks and queue entries

pub mod job;
pub mod node;
pub mod queue;
pub mod result;
pub mod task;
pub mod validate;

pub use job::{evaluate_post_process, DicomJob, JobKind, JobStatus, PostProcess};
pub use node::{DicomNode, FolderNode};
pub use queue::QueuedEntry;
pub use result::QueryResult;
pub use task::{DicomTask, TaskStatus, TransferSpec};
