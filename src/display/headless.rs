use crate::display::{DispatchStatus, DisplayClient, PlanarBuffer, ReleaseCallback};
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Display that keeps the last attached buffer as "on screen".
///
/// Attaching a new buffer (or detaching) queues the release of the previous
/// one; queued releases run on the next [`DisplayClient::dispatch`], the way a
/// compositor returns buffers through its event queue.
#[derive(Default)]
pub struct HeadlessDisplay {
    inner: Mutex<HeadlessInner>,
    cond: Condvar,
}

#[derive(Default)]
struct HeadlessInner {
    current: Option<(usize, ReleaseCallback)>,
    releases: VecDeque<ReleaseCallback>,
    attached: u64,
    detached: u64,
    last_size: Option<(u32, u32)>,
    woken: bool,
    closed: bool,
}

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeadlessInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of buffers attached so far.
    pub fn attached(&self) -> u64 {
        self.lock().attached
    }

    pub fn detached(&self) -> u64 {
        self.lock().detached
    }

    /// Pool index of the buffer currently on screen.
    pub fn showing(&self) -> Option<usize> {
        self.lock().current.as_ref().map(|(index, _)| *index)
    }

    pub fn last_size(&self) -> Option<(u32, u32)> {
        self.lock().last_size
    }

    pub fn pending_releases(&self) -> usize {
        self.lock().releases.len()
    }
}

impl DisplayClient for HeadlessDisplay {
    fn dispatch(&self, timeout: Duration) -> Result<DispatchStatus> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        while inner.releases.is_empty() && !inner.closed && !inner.woken {
            let now = Instant::now();
            if now >= deadline {
                return Ok(DispatchStatus::Continue);
            }
            inner = match self.cond.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        if inner.closed {
            return Ok(DispatchStatus::Closed);
        }
        inner.woken = false;

        let releases: Vec<ReleaseCallback> = inner.releases.drain(..).collect();
        drop(inner);

        // release callbacks take the session lock
        for release in releases {
            release();
        }
        Ok(DispatchStatus::Continue)
    }

    fn wake(&self) {
        let mut inner = self.lock();
        inner.woken = true;
        self.cond.notify_all();
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        self.cond.notify_all();
    }

    fn attach_planar(&self, buffer: PlanarBuffer, on_release: ReleaseCallback) -> bool {
        let mut inner = self.lock();
        if inner.closed || buffer.fds.is_empty() {
            return false;
        }

        if let Some((_, previous)) = inner.current.take() {
            inner.releases.push_back(previous);
        }
        inner.current = Some((buffer.index, on_release));
        inner.attached += 1;
        inner.last_size = Some((buffer.width, buffer.height));
        self.cond.notify_all();
        true
    }

    fn detach(&self) {
        let mut inner = self.lock();
        if let Some((_, previous)) = inner.current.take() {
            inner.releases.push_back(previous);
            self.cond.notify_all();
        }
        inner.detached += 1;
    }
}
