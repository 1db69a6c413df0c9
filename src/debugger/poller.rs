use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runs a task periodically on a dedicated thread.
pub struct Poller {
    interval: Duration,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Spawn polling thread. The task is called once per interval until the handle is stopped.
    pub fn run(self, mut task: impl FnMut() + Send + 'static) -> std::io::Result<PollerHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("livebreak-poller".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(self.interval) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;

        Ok(PollerHandle {
            stop_tx,
            thread: Some(thread),
        })
    }
}

pub struct PollerHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Wake the polling thread and wait until it exits.
    /// A task running at this moment is completed first.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            _ = thread.join();
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
