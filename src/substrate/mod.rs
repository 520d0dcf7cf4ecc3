//! External collaborators: DHT overlay, primary store, fragment storage.

pub mod mock;
pub mod traits;

pub use traits::{
    Clock, FragmentStore, ManualClock, Overlay, PrimaryStore, StoredFragment, SubstrateError,
    SystemClock, Timestamp,
};
