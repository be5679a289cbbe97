pub mod downloader;
pub mod logging;
pub mod manager;
pub mod models;
pub mod preferences;
pub mod queue;
pub mod relay;
pub mod resolver;
pub mod task;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::downloader::HttpResolver;
    pub use crate::manager::{DownloadManager, ManagerError, DEFAULT_CONCURRENCY};
    pub use crate::models::{Progress, Request, TaskId, TaskSnapshot, TaskState};
    pub use crate::preferences::{PreferenceStore, SqlitePreferences, StaticPreferences};
    pub use crate::relay::{EventKind, FailureKind, ProgressSink, RelayStream, TaskEvent};
    pub use crate::resolver::{ResolveError, Resolver, TransferEvent, TransferHandle, TransferSender};
    pub use crate::task::TaskError;
}
