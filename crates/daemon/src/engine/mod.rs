// Versioned workspace state: the single write path for every mutation.

pub mod state_store;

pub use state_store::{
    DeltaRange, MutationSink, StateChange, StateChangeListener, StateStoreError,
    VersionedStateStore,
};
