pub mod error;
pub mod types;

pub mod channel;
pub mod diff;
pub mod modifier;
pub mod notification;
pub mod observer;
pub mod projection;
pub mod query;
pub mod registry;
pub mod signature;
pub mod store;

pub use channel::{LocalMessenger, Messenger, NotificationSink};
pub use error::{LiveQueryError, Result};
pub use notification::{Method, Notification};
pub use observer::listener::{Callbacks, Listener, ListenerId};
pub use observer::{Observer, Snapshot};
pub use registry::{ObserveHandle, Registry};
pub use signature::Signature;
pub use store::{DocumentStore, MemoryStore};
pub use types::ObserveOptions;
