use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use captains_log::recipe;
use log::*;

use pithy_rpc::frame;
use pithy_rpc::{
    DefaultProtocol, ProcessError, Processor, Server, ServerConfig, ServerDefault,
};

fn setup() {
    let _ = recipe::raw_file_logger("/tmp/pithy_rpc_test.log", Level::Debug).test().build();
}

struct TestServer<P: Processor<DefaultProtocol>> {
    server: Server<ServerDefault<P>>,
    addr: String,
    serve_thread: thread::JoinHandle<io::Result<()>>,
}

fn start_server<P: Processor<DefaultProtocol>>(
    config: ServerConfig, processor: P, bind: &str,
) -> TestServer<P> {
    setup();
    let facts = Arc::new(ServerDefault::new(config, processor));
    let server = Server::new(facts);
    let addr = server.listen(bind).expect("listen");
    let acceptor = server.clone();
    let serve_thread = thread::spawn(move || acceptor.serve());
    TestServer { server, addr, serve_thread }
}

impl<P: Processor<DefaultProtocol>> TestServer<P> {
    fn stop(self, timeout: Duration) {
        self.server.shutdown_with(timeout, true);
        self.serve_thread.join().expect("serve thread").expect("serve");
    }
}

fn send_frame<S: Write>(stream: &mut S, payload: &[u8]) {
    let mut buf = BytesMut::new();
    frame::encode_frame(payload, &mut buf);
    stream.write_all(&buf).expect("send frame");
}

fn read_frame<S: Read>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut head = [0u8; frame::FRAME_HEADER_LEN];
    stream.read_exact(&mut head)?;
    let len = u32::from_be_bytes(head) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn connect(addr: &str) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("read timeout");
    stream
}

struct Echo;

impl Processor<DefaultProtocol> for Echo {
    fn process(
        &self, input: &mut DefaultProtocol, output: &mut DefaultProtocol,
    ) -> Result<(), ProcessError> {
        let mut req = Vec::new();
        input.read_to_end(&mut req)?;
        output.write_all(&req)?;
        output.flush()?;
        Ok(())
    }
}

struct Counting(Arc<AtomicUsize>);

impl Processor<DefaultProtocol> for Counting {
    fn process(
        &self, input: &mut DefaultProtocol, _output: &mut DefaultProtocol,
    ) -> Result<(), ProcessError> {
        let mut req = Vec::new();
        input.read_to_end(&mut req)?;
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct SlowEcho(Duration);

impl Processor<DefaultProtocol> for SlowEcho {
    fn process(
        &self, input: &mut DefaultProtocol, output: &mut DefaultProtocol,
    ) -> Result<(), ProcessError> {
        let mut req = Vec::new();
        input.read_to_end(&mut req)?;
        thread::sleep(self.0);
        output.write_all(&req)?;
        output.flush()?;
        Ok(())
    }
}

/// Panics on "boom", errors on "err", echoes anything else.
struct Moody;

impl Processor<DefaultProtocol> for Moody {
    fn process(
        &self, input: &mut DefaultProtocol, output: &mut DefaultProtocol,
    ) -> Result<(), ProcessError> {
        let mut req = Vec::new();
        input.read_to_end(&mut req)?;
        match req.as_slice() {
            b"boom" => panic!("boom requested"),
            b"err" => Err("err requested".into()),
            _ => {
                output.write_all(&req)?;
                output.flush()?;
                Ok(())
            }
        }
    }
}

#[test]
fn test_single_frame_roundtrip() {
    let ts = start_server(ServerConfig::default(), Echo, "127.0.0.1:0");
    let mut client = connect(&ts.addr);
    send_frame(&mut client, b"hello");
    let resp = read_frame(&mut client).expect("response");
    assert_eq!(resp, b"hello");
    drop(client);
    ts.stop(Duration::from_secs(1));
}

#[test]
fn test_pipelined_frames_one_segment() {
    let ts = start_server(ServerConfig::default(), Echo, "127.0.0.1:0");
    let mut client = connect(&ts.addr);
    let mut wire = BytesMut::new();
    frame::encode_frame(b"A", &mut wire);
    frame::encode_frame(b"B", &mut wire);
    client.write_all(&wire).expect("send both frames");
    // no ordering between frames of one connection
    let mut got = vec![
        read_frame(&mut client).expect("first response"),
        read_frame(&mut client).expect("second response"),
    ];
    got.sort();
    assert_eq!(got, vec![b"A".to_vec(), b"B".to_vec()]);
    ts.stop(Duration::from_secs(1));
}

#[test]
fn test_zero_length_frame() {
    let ts = start_server(ServerConfig::default(), Echo, "127.0.0.1:0");
    let mut client = connect(&ts.addr);
    send_frame(&mut client, b"");
    let resp = read_frame(&mut client).expect("response");
    assert!(resp.is_empty());
    ts.stop(Duration::from_secs(1));
}

#[test]
fn test_frame_split_across_reads() {
    let ts = start_server(ServerConfig::default(), Echo, "127.0.0.1:0");
    let mut client = connect(&ts.addr);
    let mut wire = BytesMut::new();
    frame::encode_frame(b"trickle", &mut wire);
    for b in wire.as_ref() {
        client.write_all(&[*b]).expect("send byte");
        thread::sleep(Duration::from_millis(2));
    }
    let resp = read_frame(&mut client).expect("response");
    assert_eq!(resp, b"trickle");
    // dispatched exactly once: no second response frame shows up
    client.set_read_timeout(Some(Duration::from_millis(100))).expect("read timeout");
    assert!(read_frame(&mut client).is_err());
    ts.stop(Duration::from_secs(1));
}

#[test]
fn test_partial_frame_then_close() {
    let hits = Arc::new(AtomicUsize::new(0));
    let ts =
        start_server(ServerConfig::default(), Counting(hits.clone()), "127.0.0.1:0");
    let mut client = connect(&ts.addr);
    // length prefix promises 4 bytes, only 2 arrive
    client.write_all(&4u32.to_be_bytes()).expect("send prefix");
    client.write_all(b"ab").expect("send partial payload");
    drop(client);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    ts.stop(Duration::from_secs(1));
}

#[test]
fn test_processor_failures_do_not_kill_worker() {
    let mut config = ServerConfig::default();
    // one worker, so the frame after the failures proves the loop survived
    config.num_workers = 1;
    let ts = start_server(config, Moody, "127.0.0.1:0");
    let mut client = connect(&ts.addr);
    send_frame(&mut client, b"boom");
    send_frame(&mut client, b"err");
    send_frame(&mut client, b"still alive");
    let resp = read_frame(&mut client).expect("response");
    assert_eq!(resp, b"still alive");
    ts.stop(Duration::from_secs(1));
}

#[test]
fn test_shutdown_with_drain_budget() {
    let mut config = ServerConfig::default();
    config.num_workers = 2;
    let ts = start_server(config, SlowEcho(Duration::from_millis(50)), "127.0.0.1:0");
    let mut client = connect(&ts.addr);
    for i in 0..6u8 {
        send_frame(&mut client, &[i]);
    }
    // let the workers pick up some of the frames
    thread::sleep(Duration::from_millis(30));
    let start = Instant::now();
    ts.stop(Duration::from_secs(2));
    let elapsed = start.elapsed();
    info!("drained shutdown took {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "shutdown took {:?}", elapsed);
}

#[test]
fn test_shutdown_nonblocking_and_idempotent() {
    let ts = start_server(ServerConfig::default(), Echo, "127.0.0.1:0");
    let start = Instant::now();
    ts.server.shutdown_with(Duration::from_secs(0), false);
    assert!(start.elapsed() < Duration::from_millis(100));
    ts.serve_thread.join().expect("serve thread").expect("serve");
    // later calls are no-ops
    ts.server.shutdown_with(Duration::from_secs(0), true);
    ts.server.shutdown();
}

#[test]
fn test_shutdown_unblocks_accept() {
    let ts = start_server(ServerConfig::default(), Echo, "127.0.0.1:0");
    // no client ever connects; the accept loop must still exit
    ts.stop(Duration::from_secs(1));
}

#[test]
fn test_unix_socket_roundtrip() {
    let path = format!("/tmp/pithy_rpc_test_{}.sock", std::process::id());
    let ts = start_server(ServerConfig::default(), Echo, &path);
    assert_eq!(ts.addr, path);
    let mut client = UnixStream::connect(&path).expect("connect");
    client.set_read_timeout(Some(Duration::from_secs(5))).expect("read timeout");
    send_frame(&mut client, b"over unix");
    let resp = read_frame(&mut client).expect("response");
    assert_eq!(resp, b"over unix");
    drop(client);
    ts.stop(Duration::from_secs(1));
    let _ = std::fs::remove_file(&path);
}
