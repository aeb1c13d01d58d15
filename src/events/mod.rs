//! # Events Module
//!
//! Notification plumbing between the registration worker, the wizard
//! model, and its observers.
//!
//! ## Design
//! Background work never touches observers. It sends small markers over a
//! channel; the foreground drains them, coalesces them in an
//! [`EventBucket`], and notifies each observer once per distinct entry.
//!
//! ## Example
//! ```rust,ignore
//! let (sender, receiver) = EventChannel::new();
//! let mut bucket = EventBucket::new();
//!
//! for event in receiver.drain() {
//!     bucket.put_event(event.kind(), Some(event.source()));
//! }
//! for record in bucket.drain() {
//!     observer.notify(record.kind(), record.source());
//! }
//! ```

mod bucket;
mod channel;
mod types;

pub use bucket::{EventBucket, EventRecord};
pub use channel::{null_sender, EventChannel, EventReceiver, EventSender};
pub use types::*;
