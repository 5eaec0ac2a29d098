// slotsync-daemon library entry point.

pub mod config;
pub mod engine;
pub mod runtime;
pub mod startup;
pub mod store;
pub mod sync;
pub mod transport;
