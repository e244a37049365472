//! Memory primitives used by the connection layer
//!
//! - [`ring_buffer`]: fixed-capacity byte FIFO for socket buffering
//! - [`arena`]: chunked bump allocator for per-session data

pub mod arena;
pub mod ring_buffer;

pub use arena::{Arena, Region, RegionList};
pub use ring_buffer::RingBuffer;
