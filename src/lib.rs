//! # pithy-rpc
//!
//! A nonblocking, framed-RPC server core.
//!
//! One listener accepts client connections; a dedicated reactor thread
//! multiplexes reads across every open connection and reassembles
//! length-prefixed request frames; a fixed pool of worker threads decodes
//! and dispatches each complete frame to a user-supplied request processor.
//! Shutdown is cooperative, with a bounded drain budget for in-flight work.
//!
//! ## Components
//!
//! - [`frame`]: the length-prefixed framing rule (`u32` big-endian prefix).
//! - [`net`]: TCP / Unix-domain listeners and streams behind one interface.
//! - [`transport`]: the factory seams that build the input/output byte
//!   stacks a processor is handed, with framed defaults.
//! - [`Processor`]: the per-frame dispatch hook.
//! - [`Server`]: the accept loop, worker pool, and shutdown protocol,
//!   configured through a [`ServerFactory`] hub.
//!
//! The processor gets no ordering between frames of one connection; they may
//! be served concurrently by different workers. Response frames themselves
//! never interleave: the default output transport writes each flushed frame
//! under a per-connection lock.
//!
//! ## Example
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//! use pithy_rpc::{
//!     DefaultProtocol, ProcessError, Processor, Server, ServerConfig, ServerDefault,
//! };
//!
//! struct Echo;
//!
//! impl Processor<DefaultProtocol> for Echo {
//!     fn process(
//!         &self, input: &mut DefaultProtocol, output: &mut DefaultProtocol,
//!     ) -> Result<(), ProcessError> {
//!         let mut req = Vec::new();
//!         input.read_to_end(&mut req)?;
//!         output.write_all(&req)?;
//!         output.flush()?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let facts = Arc::new(ServerDefault::new(ServerConfig::default(), Echo));
//!     let server = Server::new(facts);
//!     server.listen("127.0.0.1:9090")?;
//!     server.serve()
//! }
//! ```

#[macro_use]
extern crate captains_log;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod net;
mod reactor;
pub mod server;
pub mod transport;
mod worker;

pub use config::{ServerConfig, ShutdownSetting};
pub use dispatch::Processor;
pub use error::ProcessError;
pub use net::{Connection, UnifyAddr, UnifyListener, UnifyStream};
pub use server::{Server, ServerDefault, ServerFactory};
pub use transport::{
    Channel, DefaultProtocol, FramedTransport, FramedTransportFactory, ProtocolFactory,
    RawProtocol, RawProtocolFactory, TransportFactory,
};
