//! In-process publish/subscribe for session streams.

pub mod dispatcher;

pub use dispatcher::{Dispatcher, Subscription};
