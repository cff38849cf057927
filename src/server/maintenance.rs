//! Periodic housekeeping of a client connection
//!
//! Runs on a fixed interval, independent of request traffic: flushes the
//! responses waiting for compression and expires idle query cursors. The
//! thread holds a `Weak` reference so it never keeps a connection alive.

use super::handler::ClientConnectionHandler;
use crate::Result;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct MaintenanceThread {
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceThread {
    pub fn start(connection: Weak<ClientConnectionHandler>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("connection-maintenance".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                let Some(connection) = connection.upgrade() else {
                    break;
                };
                connection.run_maintenance();
            })?;

        Ok(Self {
            stop: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        self.stop.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
