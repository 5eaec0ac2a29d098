// slotsync-common: state model, mutations and wire types shared by the daemon and clients.

pub mod mutation;
pub mod protocol;
pub mod types;
