//! Blocking IO for the save and restore paths.
//!
//! Saved state is read and written through the [`ByteSource`] and [`ByteSink`] traits, backed
//! by files, memory or a [`Channel`] to another process. When a model is distributed over
//! several processes only the coordinator touches the file; payload is fanned out to the
//! owning workers in chunks through an [`Outbox`] and reassembled by an [`Inbox`].

pub use channel::*;
pub use chunked::*;
pub use partition::*;
pub use source::*;

mod channel;
mod chunked;
mod partition;
mod source;
