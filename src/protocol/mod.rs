//! JSON text frames exchanged with the dispatch server.
//!
//! Every frame carries a `type` discriminator. Outbound frames are wrapped in
//! a driver envelope (`role`, `driverId`); inbound frames are validated before
//! they reach any subscriber.

pub mod inbound;
pub mod outbound;

pub use inbound::{decode, DispatchEvent, FrameError};
pub use outbound::{encode, OutboundFrame, PresenceData};
