//! Hardware-backed frame buffers shared with the video server

pub mod allocator;
pub mod pool;
pub mod semaphore;

pub use allocator::{MemfdAllocator, PlaneAllocator, PlaneMapping, open_allocator};
pub use pool::{BufferPool, DrmBuffer, acquire};
pub use semaphore::Semaphore;
