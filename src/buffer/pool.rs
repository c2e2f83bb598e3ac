//! Fixed-size pool of multi-plane frame buffers
//!
//! A buffer may be held by the local display and by the video server at the
//! same time; `lock_count` tracks the holders and the buffer only goes back to
//! the free list once every holder let go and [`BufferPool::release`] ran.
//! The number of buffers handed out is bounded by a [`Semaphore`] of size N.

use crate::assets::ACQUIRE_POLL_MS;
use crate::buffer::allocator::{Plane, PlaneAllocator, PlaneMapping};
use crate::buffer::semaphore::Semaphore;
use crate::error::{Result, SinkError};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct DrmBuffer {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Luma plane first, interleaved chroma second.
    pub planes: Vec<Plane>,
    pub lock_count: u32,
    /// Set between acquire and release.
    pub acquired: bool,
    pub buffer_id: u32,
    /// Presentation time in microseconds.
    pub frame_time: i64,
    pub frame_number: u64,
}

impl DrmBuffer {
    fn empty(index: usize) -> Self {
        Self {
            index,
            width: 0,
            height: 0,
            planes: Vec::new(),
            lock_count: 0,
            acquired: false,
            buffer_id: index as u32,
            frame_time: 0,
            frame_number: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        !self.acquired && self.lock_count == 0
    }

    /// Duplicates every plane handle for hand-off to another process.
    pub fn dup_fds(&self) -> Result<Vec<OwnedFd>> {
        self.planes
            .iter()
            .map(|p| p.fd.try_clone().map_err(SinkError::from))
            .collect()
    }

    pub fn pitch(&self, plane: usize) -> u32 {
        self.planes.get(plane).map(|p| p.pitch).unwrap_or(0)
    }

    pub fn size(&self, plane: usize) -> u64 {
        self.planes.get(plane).map(|p| p.size).unwrap_or(0)
    }
}

pub struct BufferPool {
    buffers: Vec<DrmBuffer>,
    allocator: Option<Box<dyn PlaneAllocator>>,
    semaphore: Arc<Semaphore>,
}

impl BufferPool {
    pub fn new(count: usize) -> Self {
        Self {
            buffers: (0..count).map(DrmBuffer::empty).collect(),
            allocator: None,
            semaphore: Arc::new(Semaphore::new(count)),
        }
    }

    pub fn with_allocator(count: usize, allocator: Box<dyn PlaneAllocator>) -> Self {
        let mut pool = Self::new(count);
        pool.allocator = Some(allocator);
        pool
    }

    pub fn set_allocator(&mut self, allocator: Box<dyn PlaneAllocator>) {
        self.teardown();
        self.allocator = Some(allocator);
    }

    pub fn has_allocator(&self) -> bool {
        self.allocator.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub fn buffer(&self, index: usize) -> Option<&DrmBuffer> {
        self.buffers.get(index)
    }

    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut DrmBuffer> {
        self.buffers.get_mut(index)
    }

    /// Number of buffers currently held by somebody.
    pub fn outstanding(&self) -> usize {
        self.buffers.iter().filter(|b| !b.is_free()).count()
    }

    pub fn locked(&self) -> usize {
        self.buffers.iter().filter(|b| b.lock_count > 0).count()
    }

    /// Takes the first free buffer, (re)allocating its planes when the stored
    /// dimensions differ. The caller must already own a semaphore permit.
    pub fn claim(&mut self, width: u32, height: u32) -> Result<usize> {
        let index = self
            .buffers
            .iter()
            .position(DrmBuffer::is_free)
            .ok_or(SinkError::Allocation {
                width,
                height,
                reason: "no free buffer".to_string(),
            })?;

        let needs_alloc = {
            let buffer = &self.buffers[index];
            buffer.planes.is_empty() || buffer.width != width || buffer.height != height
        };

        if needs_alloc {
            self.free_planes(index);
            let allocator = self.allocator.as_mut().ok_or(SinkError::Allocation {
                width,
                height,
                reason: "no plane allocator".to_string(),
            })?;

            let luma = allocator.alloc_plane(width, height)?;
            let chroma = match allocator.alloc_plane(width, height / 2) {
                Ok(plane) => plane,
                Err(e) => {
                    allocator.free_plane(luma);
                    return Err(e);
                }
            };

            let buffer = &mut self.buffers[index];
            buffer.planes = vec![luma, chroma];
            buffer.width = width;
            buffer.height = height;
            log::debug!(
                "buffer {} allocated {}x{} pitch {}/{}",
                index,
                width,
                height,
                buffer.pitch(0),
                buffer.pitch(1)
            );
        }

        self.buffers[index].acquired = true;
        Ok(index)
    }

    /// Maps every plane of the buffer for writing.
    pub fn map(&self, index: usize) -> Result<Vec<PlaneMapping>> {
        let buffer = self
            .buffers
            .get(index)
            .ok_or(SinkError::BadBufferIndex(index))?;
        let allocator = self.allocator.as_ref().ok_or(SinkError::Allocation {
            width: buffer.width,
            height: buffer.height,
            reason: "no plane allocator".to_string(),
        })?;

        buffer
            .planes
            .iter()
            .map(|plane| allocator.map_plane(plane))
            .collect()
    }

    pub fn lock(&mut self, index: usize) -> Result<u32> {
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or(SinkError::BadBufferIndex(index))?;
        buffer.lock_count += 1;
        Ok(buffer.lock_count)
    }

    /// Drops one holder. Returns `true` only when the last holder went away.
    pub fn unlock(&mut self, index: usize) -> bool {
        match self.buffers.get_mut(index) {
            Some(buffer) if buffer.lock_count > 0 => {
                buffer.lock_count -= 1;
                buffer.lock_count == 0
            }
            Some(_) => {
                log::error!("unlock of buffer {} which is not locked", index);
                false
            }
            None => {
                log::error!("unlock of bad buffer index {}", index);
                false
            }
        }
    }

    /// Returns an unlocked buffer to the free list and posts its permit.
    /// Releasing a buffer that is not acquired is a no-op.
    pub fn release(&mut self, index: usize) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or(SinkError::BadBufferIndex(index))?;

        if buffer.lock_count > 0 {
            return Err(SinkError::BufferLocked(index));
        }
        if buffer.acquired {
            buffer.acquired = false;
            self.semaphore.release();
        }
        Ok(())
    }

    /// Clears every holder and restores the full set of permits.
    pub fn unlock_all(&mut self) {
        for buffer in self.buffers.iter_mut() {
            buffer.lock_count = 0;
            buffer.acquired = false;
        }
        self.semaphore.reset();
    }

    /// Frees all plane storage regardless of holders.
    pub fn teardown(&mut self) {
        for index in 0..self.buffers.len() {
            self.free_planes(index);
            let buffer = &mut self.buffers[index];
            buffer.lock_count = 0;
            buffer.acquired = false;
        }
        self.semaphore.reset();
    }

    fn free_planes(&mut self, index: usize) {
        let buffer = &mut self.buffers[index];
        let planes = std::mem::take(&mut buffer.planes);
        buffer.width = 0;
        buffer.height = 0;
        if let Some(allocator) = self.allocator.as_mut() {
            for plane in planes {
                allocator.free_plane(plane);
            }
        }
    }
}

impl AsMut<BufferPool> for BufferPool {
    fn as_mut(&mut self) -> &mut BufferPool {
        self
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Blocks until a buffer of the requested size is available.
///
/// The pool lock is only held to claim the slot; while waiting for a permit
/// `pump` runs every poll interval so inbound release messages keep flowing.
/// Returns `None` when `cancelled` reports true or allocation fails, in which
/// case no permit is kept.
pub fn acquire<T, P, C>(
    shared: &Mutex<T>,
    width: u32,
    height: u32,
    mut pump: P,
    cancelled: C,
) -> Option<usize>
where
    T: AsMut<BufferPool>,
    P: FnMut(),
    C: Fn() -> bool,
{
    let semaphore = {
        let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().semaphore()
    };

    loop {
        if cancelled() {
            return None;
        }
        if semaphore.acquire_timeout(Duration::from_millis(ACQUIRE_POLL_MS)) {
            break;
        }
        pump();
    }

    let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_mut().claim(width, height) {
        Ok(index) => Some(index),
        Err(e) => {
            log::error!("unable to get buffer: {}", e);
            semaphore.release();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::allocator::MemfdAllocator;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    fn memfd_pool(count: usize) -> BufferPool {
        BufferPool::with_allocator(count, Box::new(MemfdAllocator::new()))
    }

    #[test]
    fn test_claim_allocates_two_planes() {
        let mut pool = memfd_pool(2);
        let index = pool.claim(320, 240).unwrap();
        let buffer = pool.buffer(index).unwrap();
        assert_eq!(buffer.planes.len(), 2);
        assert_eq!(buffer.size(0), 320 * 240);
        assert_eq!(buffer.size(1), 320 * 120);
        assert!(buffer.acquired);
    }

    #[test]
    fn test_claim_reuses_matching_planes() {
        let mut pool = memfd_pool(1);
        let index = pool.claim(128, 64).unwrap();
        pool.release(index).unwrap();
        let index = pool.claim(256, 64).unwrap();
        assert_eq!(pool.buffer(index).unwrap().pitch(0), 256);
    }

    #[test]
    fn test_lock_counts() {
        let mut pool = memfd_pool(2);
        let index = pool.claim(64, 64).unwrap();

        for _ in 0..3 {
            pool.lock(index).unwrap();
        }
        assert!(matches!(pool.release(index), Err(SinkError::BufferLocked(_))));
        assert!(!pool.unlock(index));
        assert!(!pool.unlock(index));
        assert!(pool.release(index).is_err());
        assert!(pool.unlock(index));
        assert!(pool.release(index).is_ok());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_unlock_unlocked_is_harmless() {
        let mut pool = memfd_pool(1);
        assert!(!pool.unlock(0));
        assert!(!pool.unlock(7));
        assert_eq!(pool.buffer(0).unwrap().lock_count, 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = Mutex::new(memfd_pool(2));
        let semaphore = pool.lock().unwrap().semaphore();

        let index = acquire(&pool, 64, 64, || {}, || false).unwrap();
        assert_eq!(semaphore.available(), 1);
        pool.lock().unwrap().release(index).unwrap();
        pool.lock().unwrap().release(index).unwrap();
        assert_eq!(semaphore.available(), 2);
    }

    #[test]
    fn test_fifth_acquire_blocks_until_release() {
        let pool = Arc::new(Mutex::new(memfd_pool(4)));

        let held: Vec<usize> = (0..4)
            .map(|_| acquire(&*pool, 64, 32, || {}, || false).unwrap())
            .collect();
        assert_eq!(pool.lock().unwrap().outstanding(), 4);

        let worker_pool = Arc::clone(&pool);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let index = acquire(&*worker_pool, 64, 32, || {}, || false);
            (index, start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        pool.lock().unwrap().release(held[2]).unwrap();
        let (index, elapsed) = handle.join().unwrap();
        assert_eq!(index, Some(held[2]));
        assert!(elapsed >= Duration::from_millis(50));
    }

    #[test]
    fn test_acquire_pumps_and_cancels() {
        let pool = Mutex::new(memfd_pool(1));
        acquire(&pool, 64, 32, || {}, || false).unwrap();

        let stop = AtomicBool::new(false);
        let mut pumped = 0;
        let index = acquire(
            &pool,
            64,
            32,
            || {
                pumped += 1;
                if pumped == 5 {
                    stop.store(true, Ordering::SeqCst);
                }
            },
            || stop.load(Ordering::SeqCst),
        );
        assert_eq!(index, None);
        assert_eq!(pumped, 5);
    }

    #[test]
    fn test_allocation_failure_returns_permit() {
        let pool = Mutex::new(BufferPool::new(2));
        let semaphore = pool.lock().unwrap().semaphore();
        assert_eq!(acquire(&pool, 64, 32, || {}, || false), None);
        assert_eq!(semaphore.available(), 2);
    }

    #[test]
    fn test_unlock_all_restores_pool() {
        let pool = Mutex::new(memfd_pool(2));
        let a = acquire(&pool, 64, 32, || {}, || false).unwrap();
        let b = acquire(&pool, 64, 32, || {}, || false).unwrap();
        {
            let mut guard = pool.lock().unwrap();
            guard.lock(a).unwrap();
            guard.lock(b).unwrap();
            guard.lock(b).unwrap();
            guard.unlock_all();
            assert_eq!(guard.outstanding(), 0);
            assert_eq!(guard.semaphore().available(), 2);
        }
    }

    #[test]
    fn test_outstanding_never_exceeds_capacity() {
        let pool = Mutex::new(memfd_pool(3));
        let mut held = Vec::new();
        for round in 0..20 {
            if let Some(index) = acquire(&pool, 32, 32, || {}, || held.len() >= 3) {
                pool.lock().unwrap().lock(index).unwrap();
                held.push(index);
            }
            assert!(pool.lock().unwrap().locked() <= 3);

            if round % 2 == 1 && !held.is_empty() {
                let index = held.remove(0);
                let mut guard = pool.lock().unwrap();
                assert!(guard.unlock(index));
                guard.release(index).unwrap();
            }
        }
    }

    #[test]
    fn test_mapping_covers_planes() {
        let mut pool = memfd_pool(1);
        let index = pool.claim(64, 4).unwrap();
        let mut maps = pool.map(index).unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].len(), 64 * 4);
        assert_eq!(maps[1].len(), 64 * 2);
        maps[1].as_mut_slice().fill(0x80);
    }
}
