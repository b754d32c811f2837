//! Input side of the pipeline: channel receivers and the stream merger.
//!
//! ```text
//! metadata bus ──> MetadataChannel ──┐
//!                                    ├──> StreamMerger::next() ──> VisChunk
//! rank sockets ──> VisibilityChannel ┘
//! ```
pub mod backoff;
pub mod layout;
pub mod merger;
pub mod metadata_channel;
pub mod visibility_channel;

pub use layout::{RowDescriptor, RowLayout};
pub use merger::StreamMerger;
pub use metadata_channel::{MetadataChannel, MetadataSubscriber};
pub use visibility_channel::{VisibilityChannel, VisibilityReceiver};
