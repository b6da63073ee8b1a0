// callsync-common: shared call-state types, events and media-server naming

pub mod events;
pub mod sfu;
pub mod types;
