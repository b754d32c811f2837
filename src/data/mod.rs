//! Data records and the queue that carries them between threads.
pub mod bounded_queue;
pub mod frame;
pub mod metadata;
pub mod vis_chunk;
