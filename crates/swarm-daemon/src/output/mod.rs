//! Output buffer store.
//!
//! Bounded, append-only line buffers per project (combined) and per agent,
//! read through offset-based pagination or a polling subscription.

mod buffer;
mod store;
mod stream;

pub use buffer::{OutputBuffer, OutputLine, OutputPage, StreamKind};
pub use store::{OutputSinks, OutputStore, SharedBuffer};
pub use stream::{OutputEvent, OutputStream, StreamOptions, subscribe};
