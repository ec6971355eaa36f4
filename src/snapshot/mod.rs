pub mod builder;
pub mod lifecycle;
pub mod poller;

pub use builder::{BuildFailure, BuiltSnapshot, SnapshotBuilder};
pub use lifecycle::SnapshotLifecycle;
pub use poller::spawn_poller;
