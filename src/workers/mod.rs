//! Background threads of a sink session
//!
//! - [`dispatch`]: pumps the local display's event queue
//! - [`eos`]: raises end-of-stream when output stalls after upstream EOS
//! - [`first_frame`]: emits the first-frame event off the render path
//!
//! Every worker is started lazily and joined through [`WorkerClose`].

pub mod dispatch;
pub mod eos;
pub mod first_frame;

pub use dispatch::DispatchWorker;
pub use eos::{EosDetector, EosSample, EosWorker};
pub use first_frame::FirstFrameWorker;

/// Trait for workers that need graceful shutdown.
pub trait WorkerClose {
    /// Signals the worker to stop and waits for its thread.
    fn close(&mut self);
}

pub(crate) fn join_worker(name: &str, handle: Option<std::thread::JoinHandle<()>>) {
    if let Some(handle) = handle
        && handle.join().is_err()
    {
        log::error!("{} thread panicked", name);
    }
}
