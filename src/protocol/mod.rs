//! Glacier wire protocol.

pub mod messages;
pub mod sticky;

pub use messages::{Envelope, KnownHolder, Message, StatusReport};
pub use sticky::{StickyEntry, StickyQueue};
