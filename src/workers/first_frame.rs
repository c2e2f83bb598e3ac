use crate::error::Result;
use crate::workers::{WorkerClose, join_worker};
use std::thread::{self, JoinHandle};

const THREAD_NAME: &str = "plane_sink_first_frame";

/// One-shot thread emitting the first-frame event outside the render call.
pub struct FirstFrameWorker {
    handle: Option<JoinHandle<()>>,
}

impl FirstFrameWorker {
    pub fn spawn<F>(emit: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                log::debug!("emit first frame signal");
                emit();
            })?;

        Ok(Self {
            handle: Some(handle),
        })
    }
}

impl WorkerClose for FirstFrameWorker {
    fn close(&mut self) {
        join_worker(THREAD_NAME, self.handle.take());
    }
}

impl Drop for FirstFrameWorker {
    fn drop(&mut self) {
        self.close();
    }
}
