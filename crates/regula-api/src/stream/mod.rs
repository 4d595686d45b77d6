//! Real-time status streams.
//!
//! [`StatusSnapshot`] recomputes frames from the scan queue and the store;
//! [`StreamFanout`] runs one actor per open connection and turns pushed change
//! notifications, poll ticks and heartbeats into an ordered, deduplicated
//! sequence of [`Outbound`] items.

pub mod fanout;
pub mod snapshot;

pub use fanout::{
    CloseReason, Outbound, StreamConfig, StreamConnection, StreamFanout, StreamScope,
};
pub use snapshot::{
    CheckView, Frame, OrganizationView, QueueView, ServerLoad, StatusSnapshot, SystemView,
};
