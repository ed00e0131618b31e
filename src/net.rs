//! Socket layer, abstracting the common interface for Tcp & Unix

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::str::FromStr;
use std::sync::Mutex;
use std::{
    fmt, fs,
    net::{AddrParseError, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    path::PathBuf,
};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::frame::FRAME_HEADER_LEN;

/// Unify behavior of tcp & unix addr
pub enum UnifyAddr {
    Socket(SocketAddr),
    Path(PathBuf),
}

impl fmt::Display for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(s) => write!(f, "{}", s),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl fmt::Debug for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Clone for UnifyAddr {
    #[inline]
    fn clone(&self) -> Self {
        match self {
            Self::Socket(s) => UnifyAddr::Socket(s.clone()),
            Self::Path(p) => UnifyAddr::Path(p.clone()),
        }
    }
}

impl FromStr for UnifyAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.as_bytes()[0] as char == '/' {
            return Ok(Self::Path(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => Ok(Self::Socket(a)),
            // Can't directly resolve the IP, try to resolve it through the domain name.
            // If multiple IP addresses are resolved, only the first result is taken
            Err(e) => match s.to_socket_addrs() {
                Ok(mut _v) => match _v.next() {
                    Some(a) => Ok(Self::Socket(a)),
                    None => Err(e),
                },
                Err(_) => Err(e),
            },
        }
    }
}

/// Unify behavior of tcp & unix socket listener
///
/// `accept` blocks; `close` interrupts a concurrent `accept`, which then
/// returns an I/O error.
pub enum UnifyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl UnifyListener {
    pub fn bind(addr: &str) -> io::Result<Self> {
        match UnifyAddr::from_str(addr) {
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("addr {:?} invalid: {:?}", addr, e),
                ));
            }
            Ok(UnifyAddr::Socket(_addr)) => match TcpListener::bind(_addr) {
                Ok(l) => Ok(UnifyListener::Tcp(l)),
                Err(e) => Err(e),
            },
            Ok(UnifyAddr::Path(ref path)) => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
                match UnixListener::bind(path) {
                    Ok(l) => Ok(UnifyListener::Unix(l)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Wait for the next client. The accepted stream is switched to
    /// nonblocking mode for the reactor.
    pub fn accept(&self) -> io::Result<UnifyStream> {
        match self {
            UnifyListener::Tcp(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nonblocking(true)?;
                Ok(UnifyStream::Tcp(stream))
            }
            UnifyListener::Unix(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nonblocking(true)?;
                Ok(UnifyStream::Unix(stream))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            UnifyListener::Tcp(l) => {
                let addr = l.local_addr()?;
                Ok(addr.to_string())
            }
            UnifyListener::Unix(l) => {
                let addr = l.local_addr()?;
                match addr.as_pathname() {
                    Some(p) => Ok(p.display().to_string()),
                    None => Err(io::ErrorKind::AddrNotAvailable.into()),
                }
            }
        }
    }

    /// Break a blocked `accept` on another thread. The fd itself is released
    /// when the listener drops.
    pub fn close(&self) {
        unsafe {
            libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

impl AsRawFd for UnifyListener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(l) => l.as_raw_fd(),
            Self::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl fmt::Debug for UnifyListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(l) => match l.local_addr() {
                Ok(addr) => write!(f, "listener {}", addr),
                Err(_) => write!(f, "tcp listener unknown"),
            },
            Self::Unix(l) => match l.local_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(p) => write!(f, "listener {}", p.display()),
                    None => write!(f, "unix listener unnamed"),
                },
                Err(_) => write!(f, "unix listener unknown"),
            },
        }
    }
}

/// Unify behavior of tcp & unix stream
pub enum UnifyStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl UnifyStream {
    #[inline]
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            UnifyStream::Tcp(s) => (&*s).read(buf),
            UnifyStream::Unix(s) => (&*s).read(buf),
        }
    }

    #[inline]
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            UnifyStream::Tcp(s) => (&*s).write(buf),
            UnifyStream::Unix(s) => (&*s).write(buf),
        }
    }
}

impl AsFd for UnifyStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for UnifyStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl fmt::Debug for UnifyStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(s) => match s.local_addr() {
                Ok(addr) => {
                    if let Ok(peer_addr) = s.peer_addr() {
                        write!(f, "{}->{}", addr, peer_addr)
                    } else {
                        write!(f, "{}", addr)
                    }
                }
                Err(_) => write!(f, "tcp addr unknown"),
            },
            Self::Unix(s) => match s.local_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(p) => write!(f, "{}", p.display()),
                    None => write!(f, "unix stream unnamed"),
                },
                Err(_) => write!(f, "unix addr unknown"),
            },
        }
    }
}

/// A live client connection.
///
/// The reactor is the only reader. Workers write responses through
/// [`write_frame`](Connection::write_frame), which holds the per-connection
/// lock for the whole frame so that responses to concurrently served frames
/// never interleave on the wire.
pub struct Connection {
    stream: UnifyStream,
    wlock: Mutex<()>,
}

impl Connection {
    pub(crate) fn new(stream: UnifyStream) -> Self {
        Self { stream, wlock: Mutex::new(()) }
    }

    #[inline]
    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Nonblocking read; `WouldBlock` marks the end of currently available
    /// bytes, `Ok(0)` is end of stream.
    #[inline]
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// One nonblocking write attempt, for transports that do their own
    /// framing and flow control.
    #[inline]
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    /// Write one complete length-prefixed frame, blocking on writability
    /// until every byte is out.
    pub fn write_frame(&self, payload: &[u8]) -> io::Result<()> {
        let mut head = [0u8; FRAME_HEADER_LEN];
        head.copy_from_slice(&(payload.len() as u32).to_be_bytes());
        let _guard = self.wlock.lock().unwrap();
        self.write_all(&head)?;
        self.write_all(payload)
    }

    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_writable()?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn wait_writable(&self) -> io::Result<()> {
        loop {
            let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLOUT)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.stream, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_addr_parse() {
        match UnifyAddr::from_str("127.0.0.1:18555").expect("parse") {
            UnifyAddr::Socket(s) => assert_eq!(s.port(), 18555),
            UnifyAddr::Path(_) => panic!("expected socket addr"),
        }
        match UnifyAddr::from_str("/tmp/pithy_test.sock").expect("parse") {
            UnifyAddr::Path(p) => assert_eq!(p, Path::new("/tmp/pithy_test.sock")),
            UnifyAddr::Socket(_) => panic!("expected path addr"),
        }
        assert!(UnifyAddr::from_str("definitely not an address").is_err());
    }

    #[test]
    fn test_listener_close_interrupts_accept() {
        use std::sync::Arc;
        let listener = Arc::new(UnifyListener::bind("127.0.0.1:0").expect("bind"));
        let l2 = listener.clone();
        let t = std::thread::spawn(move || l2.accept());
        std::thread::sleep(std::time::Duration::from_millis(50));
        listener.close();
        let res = t.join().expect("join");
        assert!(res.is_err());
    }
}
