//! Worker pool
//!
//! Each worker blocks on the shared work queue. A frame item is served by
//! building the input/output protocol stacks and invoking the processor; a
//! shutdown item ends the thread. Processor failures of any kind stop at the
//! worker.

use std::any::Any;
use std::backtrace::Backtrace;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossfire::MRx;

use crate::dispatch::Processor;
use crate::net::Connection;
use crate::server::ServerFactory;
use crate::transport::{Channel, ProtocolFactory, TransportFactory};

pub(crate) enum WorkItem {
    /// A complete de-framed request. The connection may already have left the
    /// reactor set by the time the worker runs; the response write then just
    /// fails and is logged.
    Frame { conn: Arc<Connection>, payload: Bytes },
    /// Terminate the receiving worker.
    Shutdown,
}

pub(crate) struct Worker<F: ServerFactory> {
    name: String,
    facts: Arc<F>,
    logger: F::Logger,
    queue: MRx<WorkItem>,
}

impl<F: ServerFactory> Worker<F> {
    pub(crate) fn spawn_pool(
        facts: &Arc<F>, queue: &MRx<WorkItem>,
    ) -> io::Result<Vec<JoinHandle<()>>> {
        let count = facts.get_config().num_workers.max(1);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("rpc-worker-{}", i);
            let worker = Worker {
                name: name.clone(),
                facts: facts.clone(),
                logger: facts.new_logger(),
                queue: queue.clone(),
            };
            handles.push(std::thread::Builder::new().name(name).spawn(move || worker.run())?);
        }
        Ok(handles)
    }

    fn run(self) {
        loop {
            match self.queue.recv() {
                Ok(WorkItem::Frame { conn, payload }) => self.serve_frame(conn, payload),
                Ok(WorkItem::Shutdown) => {
                    logger_trace!(self.logger, "{} exits", self.name);
                    return;
                }
                // all senders gone, the reactor is torn down
                Err(_) => return,
            }
        }
    }

    fn serve_frame(&self, conn: Arc<Connection>, payload: Bytes) {
        let transports = self.facts.transport_factory();
        let protocols = self.facts.protocol_factory();
        let mut input = protocols.get_protocol(transports.get_transport(Channel::frame(payload)));
        let mut output = protocols.get_protocol(transports.get_transport(Channel::conn(conn)));
        let res = catch_unwind(AssertUnwindSafe(|| {
            self.facts.processor().process(&mut input, &mut output)
        }));
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{}: processor error: {}", self.name, e);
            }
            Err(cause) => {
                error!(
                    "{}: processor panic: {}\n{}",
                    self.name,
                    panic_message(&cause),
                    Backtrace::capture()
                );
            }
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(s) = cause.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.as_str()
    } else {
        "opaque panic payload"
    }
}
