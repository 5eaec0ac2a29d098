// Client synchronization: catch-up decisions and live broadcast.

pub mod coordinator;

pub use coordinator::{ClientSession, SyncCoordinator, GAP_THRESHOLD};
