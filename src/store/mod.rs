pub mod stream_store;
pub mod string_store;

pub use stream_store::{Stream, StreamEntry, StreamEntryId, StreamStore};
pub use string_store::StringStore;
