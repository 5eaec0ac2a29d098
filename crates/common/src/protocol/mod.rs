// Wire protocol spoken between the daemon and sync clients.

pub mod ws;
