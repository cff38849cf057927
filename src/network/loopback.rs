//! In-process connection to a server context
//!
//! Requests and responses go through the real package encoding, so the
//! loopback behaves like a socket without the framing layer.

use super::connection::{ClientConnection, PendingCalls, ResponseListener};
use super::package::{Request, RequestPackage, ResponseFrame, SequenceId};
use crate::server::{ClientConnectionHandler, ResponseWriter, ServerContext};
use crate::{Result, StorageError};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct ChannelWriter {
    sender: Mutex<Option<Sender<Vec<u8>>>>,
}

impl ResponseWriter for ChannelWriter {
    fn write_frame(&self, frame: &ResponseFrame) -> Result<()> {
        let bytes = frame.to_bytes()?;
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(bytes).map_err(|_| StorageError::Shutdown),
            None => Err(StorageError::Shutdown),
        }
    }

    fn close(&self) {
        self.sender.lock().take();
    }
}

pub struct LoopbackConnection {
    name: String,
    calls: Arc<PendingCalls>,
    handler: Arc<ClientConnectionHandler>,
    open: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackConnection {
    pub fn connect(name: impl Into<String>, context: Arc<ServerContext>) -> Result<Arc<Self>> {
        let name = name.into();
        let (sender, receiver) = channel::unbounded::<Vec<u8>>();
        let writer = Arc::new(ChannelWriter {
            sender: Mutex::new(Some(sender)),
        });
        let handler = ClientConnectionHandler::new(context, writer)?;
        let calls = Arc::new(PendingCalls::new());

        let reader_calls = calls.clone();
        let reader_name = name.clone();
        let reader = thread::Builder::new()
            .name(format!("loopback-{}", name))
            .spawn(move || {
                for bytes in receiver.iter() {
                    let packages = ResponseFrame::from_bytes(&bytes).and_then(|f| f.into_packages());
                    match packages {
                        Ok(packages) => packages.into_iter().for_each(|p| reader_calls.complete(p)),
                        Err(e) => tracing::error!(connection = %reader_name, error = %e, "undecodable response frame"),
                    }
                }
                reader_calls.fail_all("connection closed");
            })?;

        Ok(Arc::new(Self {
            name,
            calls,
            handler,
            open: AtomicBool::new(true),
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// Server side of this connection
    pub fn handler(&self) -> &Arc<ClientConnectionHandler> {
        &self.handler
    }

    /// Push raw bytes to the server, bypassing the encoder
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let result = self.handler.handle_bytes(bytes);
        if result.is_err() {
            self.close();
        }
        result
    }

    pub fn pending_requests(&self) -> usize {
        self.calls.len()
    }
}

impl ClientConnection for LoopbackConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.handler.is_open()
    }

    fn send_request(
        &self,
        request: Request,
        compress_response: bool,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<SequenceId> {
        if !self.is_open() {
            return Err(StorageError::Shutdown);
        }

        let sequence = self.calls.register(listener);
        let package = RequestPackage {
            sequence,
            compress_response,
            body: request,
        };

        let sent = package.to_bytes().and_then(|bytes| self.handler.handle_bytes(&bytes));
        if let Err(e) = sent {
            self.calls.fail(sequence, &e.to_string());
            return Err(e);
        }
        Ok(sequence)
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.handler.close();
        if let Some(reader) = self.reader.lock().take() {
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                tracing::error!(connection = %self.name, "loopback reader panicked");
            }
        }
        self.calls.fail_all("connection closed");
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.close();
    }
}
