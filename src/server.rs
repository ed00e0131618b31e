//! Server front end: the accept loop and the shutdown protocol.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use captains_log::filter::{Filter, LogFilter};

use crate::config::ServerConfig;
use crate::dispatch::Processor;
use crate::net::UnifyListener;
use crate::reactor::ReactorHandle;
use crate::transport::{
    FramedTransport, FramedTransportFactory, ProtocolFactory, RawProtocol, RawProtocolFactory,
    TransportFactory,
};

/// A central hub defined by the user, wiring the pluggable pieces together:
/// the logger, the transport and protocol factories, and the processor.
///
/// For the common case use [`ServerDefault`].
pub trait ServerFactory: Send + Sync + Sized + 'static {
    /// A [captains-log](https://docs.rs/captains-log) filter implementation,
    /// maybe a `Arc<LogFilter>` or `KeyFilter<Arc<LogFilter>>`.
    type Logger: Filter + Send + Sync + 'static;

    type TransportFactory: TransportFactory;

    type ProtocolFactory: ProtocolFactory<
        <Self::TransportFactory as TransportFactory>::Transport,
    >;

    type Processor: Processor<
        <Self::ProtocolFactory as ProtocolFactory<
            <Self::TransportFactory as TransportFactory>::Transport,
        >>::Protocol,
    >;

    fn get_config(&self) -> &ServerConfig;

    /// Construct a logger filter to organize the log of one component.
    fn new_logger(&self) -> Self::Logger;

    fn transport_factory(&self) -> &Self::TransportFactory;

    fn protocol_factory(&self) -> &Self::ProtocolFactory;

    fn processor(&self) -> &Self::Processor;
}

/// The stock [`ServerFactory`]: framed transports, raw byte protocols, one
/// shared log filter.
pub struct ServerDefault<P> {
    config: ServerConfig,
    logger: Arc<LogFilter>,
    transports: FramedTransportFactory,
    protocols: RawProtocolFactory,
    processor: P,
}

impl<P> ServerDefault<P>
where
    P: Processor<RawProtocol<FramedTransport>>,
{
    pub fn new(config: ServerConfig, processor: P) -> Self {
        Self {
            config,
            logger: Arc::new(LogFilter::new()),
            transports: FramedTransportFactory,
            protocols: RawProtocolFactory,
            processor,
        }
    }
}

impl<P> ServerFactory for ServerDefault<P>
where
    P: Processor<RawProtocol<FramedTransport>>,
{
    type Logger = Arc<LogFilter>;
    type TransportFactory = FramedTransportFactory;
    type ProtocolFactory = RawProtocolFactory;
    type Processor = P;

    #[inline]
    fn get_config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    fn new_logger(&self) -> Self::Logger {
        self.logger.clone()
    }

    #[inline]
    fn transport_factory(&self) -> &Self::TransportFactory {
        &self.transports
    }

    #[inline]
    fn protocol_factory(&self) -> &Self::ProtocolFactory {
        &self.protocols
    }

    #[inline]
    fn processor(&self) -> &Self::Processor {
        &self.processor
    }
}

struct ServerInner<F: ServerFactory> {
    facts: Arc<F>,
    logger: F::Logger,
    listener: Mutex<Option<Arc<UnifyListener>>>,
    reactor: Mutex<Option<Arc<ReactorHandle>>>,
    /// Guards the shutdown-once contract.
    shut: Mutex<bool>,
}

/// The acceptor. Cheap to clone; every clone drives the same server, so a
/// clone can be parked on a signal handler or another thread to call
/// [`shutdown`](Server::shutdown) while [`serve`](Server::serve) blocks.
pub struct Server<F: ServerFactory> {
    inner: Arc<ServerInner<F>>,
}

impl<F: ServerFactory> Clone for Server<F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<F: ServerFactory> Server<F> {
    pub fn new(facts: Arc<F>) -> Self {
        let logger = facts.new_logger();
        Self {
            inner: Arc::new(ServerInner {
                facts,
                logger,
                listener: Mutex::new(None),
                reactor: Mutex::new(None),
                shut: Mutex::new(false),
            }),
        }
    }

    /// Bind the listening socket. Returns the actual local address, so a
    /// `:0` bind reports its ephemeral port.
    pub fn listen(&self, addr: &str) -> io::Result<String> {
        match UnifyListener::bind(addr) {
            Err(e) => {
                error!("bind addr {:?} err: {}", addr, e);
                Err(e)
            }
            Ok(listener) => {
                let local_addr = listener.local_addr()?;
                debug!("listening on {:?}", listener);
                self.inner.listener.lock().unwrap().replace(Arc::new(listener));
                Ok(local_addr)
            }
        }
    }

    /// Run the accept loop on the calling thread.
    ///
    /// Spawns the reactor (which spins the worker pool), then accepts until
    /// the listener errors, which is the expected way out: `shutdown` closes
    /// the listener. Never returns an error to the caller after the loop is
    /// entered.
    pub fn serve(&self) -> io::Result<()> {
        let listener = match self.inner.listener.lock().unwrap().clone() {
            Some(l) => l,
            None => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "serve before listen"));
            }
        };
        let reactor = Arc::new(ReactorHandle::spawn(self.inner.facts.clone())?);
        self.inner.reactor.lock().unwrap().replace(reactor.clone());
        loop {
            match listener.accept() {
                Ok(stream) => {
                    logger_trace!(self.inner.logger, "accepted {:?}", stream);
                    reactor.add_connection(stream);
                }
                Err(e) => {
                    logger_info!(self.inner.logger, "accept loop exits: {}", e);
                    break;
                }
            }
        }
        listener.close();
        reactor.ensure_closed();
        Ok(())
    }

    /// Shut down with the configured drain budget and blocking mode.
    pub fn shutdown(&self) {
        let setting = self.inner.facts.get_config().shutdown;
        self.shutdown_with(setting.timeout, setting.block);
    }

    /// Drain the worker pool within `timeout`, then break the accept loop.
    ///
    /// The first call wins; later calls (from any thread) are no-ops. With
    /// `block = false` the same steps run on a background thread and the
    /// call returns at once.
    pub fn shutdown_with(&self, timeout: Duration, block: bool) {
        if !block {
            let this = self.clone();
            let _ = std::thread::Builder::new()
                .name("rpc-shutdown".to_string())
                .spawn(move || this.shutdown_inner(timeout));
            return;
        }
        self.shutdown_inner(timeout);
    }

    fn shutdown_inner(&self, timeout: Duration) {
        {
            let mut shut = self.inner.shut.lock().unwrap();
            if *shut {
                return;
            }
            *shut = true;
        }
        logger_info!(self.inner.logger, "server shutting down, budget {:?}", timeout);
        // drain the reactor first, then break our own accept loop
        let reactor = self.inner.reactor.lock().unwrap().clone();
        if let Some(reactor) = reactor {
            reactor.shutdown(timeout);
        }
        let listener = self.inner.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.close();
        }
    }
}
