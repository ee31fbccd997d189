//! Directory watching and run aggregation.
//!
//! - [`PathRegistry`] tracks watched paths over a [`WatchBackend`]
//! - [`scan_file`] counts marker occurrences
//! - [`Dispatcher`] applies events one at a time on a dedicated thread
//! - [`Aggregator`] folds activity into task runs
//! - [`Engine`] starts and stops the whole thing

mod aggregator;
mod backend;
mod dispatch;
mod engine;
mod events;
mod registry;
mod scanner;

pub use aggregator::Aggregator;
pub use backend::{BackendFactory, ManualBackend, ManualSource, NotifyBackend, WatchBackend};
pub use dispatch::{Command, DispatchStats, DispatchStatsSnapshot, Dispatcher, LoopExit};
pub use engine::Engine;
pub use events::{EventKind, FileEvent, SourceEvent};
pub use registry::{PathRegistry, Registration, WatchTarget};
pub use scanner::{count_marker, scan_file, walk_directory, DiscoveredPath, ScanOutcome, WalkStats};
