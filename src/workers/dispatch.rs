use crate::assets::DISPATCH_POLL_MS;
use crate::display::{DispatchStatus, DisplayClient};
use crate::error::Result;
use crate::utils::sos::SignalOfStop;
use crate::workers::{WorkerClose, join_worker};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const THREAD_NAME: &str = "plane_sink_dispatch";

/// Pumps the display event queue until stopped or the connection dies.
pub struct DispatchWorker {
    handle: Option<JoinHandle<()>>,
    sos: SignalOfStop,
    display: Arc<dyn DisplayClient>,
}

impl DispatchWorker {
    pub fn spawn(display: Arc<dyn DisplayClient>) -> Result<Self> {
        let sos = SignalOfStop::new();
        let thread_sos = sos.clone();
        let thread_display = Arc::clone(&display);

        log::debug!("starting {} thread", THREAD_NAME);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(thread_display, thread_sos))?;

        Ok(Self {
            handle: Some(handle),
            sos,
            display,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

fn run(display: Arc<dyn DisplayClient>, sos: SignalOfStop) {
    log::debug!("dispatch thread: enter");
    while !sos.cancelled() {
        match display.dispatch(Duration::from_millis(DISPATCH_POLL_MS)) {
            Ok(DispatchStatus::Continue) => {}
            Ok(DispatchStatus::Closed) => {
                log::debug!("display connection closed");
                break;
            }
            Err(e) => {
                log::error!("display dispatch failed: {}", e);
                break;
            }
        }
    }
    log::debug!("dispatch thread: exit");
}

impl WorkerClose for DispatchWorker {
    fn close(&mut self) {
        self.sos.cancel();
        self.display.wake();
        join_worker(THREAD_NAME, self.handle.take());
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::HeadlessDisplay;
    use std::time::Instant;

    #[test]
    fn test_close_joins_promptly() {
        let display = Arc::new(HeadlessDisplay::new());
        let mut worker = DispatchWorker::spawn(display).unwrap();
        assert!(worker.is_running());

        let start = Instant::now();
        worker.close();
        assert!(!worker.is_running());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_exits_when_display_closes() {
        let display = Arc::new(HeadlessDisplay::new());
        let worker = DispatchWorker::spawn(Arc::clone(&display) as Arc<dyn DisplayClient>).unwrap();
        display.shutdown();

        let start = Instant::now();
        while worker.is_running() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_running());
    }
}
