//! End-to-end scenarios driven over a real `AF_UNIX` socket, exercising
//! the full acceptor/worker/dispatch stack together.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use storaged::codec::reader::{read_framed, FrameBuffer};
use storaged::codec::request::{emit_request, Command};
use storaged::codec::response::{parse_response, Response};
use storaged::codec::{parse_data_field, ParseOutcome};
use storaged::config::Config;
use storaged::service::Service;

struct TestServer {
    socket_path: PathBuf,
}

impl TestServer {
    fn start(files_max_num: u32, storage_max_size: u64, max_conn: u32) -> (Arc<Service>, TestServer) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.socket_file_name = dir.path().join("storaged.sk");
        config.log_file_name = dir.path().join("storaged.log");
        config.files_max_num = files_max_num;
        config.storage_max_size = storage_max_size;
        config.max_conn = max_conn;
        config.worker_threads_num = 2;

        let service = Arc::new(Service::new_foreground(config).unwrap());
        let (mut acceptor, return_pipe) = storaged::acceptor::Acceptor::bind(service.socket_path()).unwrap();
        let _workers = storaged::worker::spawn_pool(Arc::clone(&service), return_pipe);

        let service_for_acceptor = Arc::clone(&service);
        thread::spawn(move || acceptor.run(&service_for_acceptor));

        // Let the acceptor's first poll iteration bind and start listening.
        thread::sleep(Duration::from_millis(50));
        // Keep the tempdir alive for the lifetime of the returned handle.
        let socket_path = service.socket_path().to_path_buf();
        std::mem::forget(dir);
        (service, TestServer { socket_path })
    }

    fn connect(&self) -> Client {
        let mut stream = UnixStream::connect(&self.socket_path).unwrap();
        let greeting = read_one_response(&mut stream);
        assert_eq!(greeting.code, 220);
        Client {
            stream,
            buf: FrameBuffer::new(),
        }
    }
}

struct Client {
    stream: UnixStream,
    buf: FrameBuffer,
}

impl Client {
    fn send(&mut self, cmd: Command, arg: &[u8], data: &[u8]) -> Response {
        let bytes = emit_request(cmd, arg, data).unwrap();
        self.stream.write_all(&bytes).unwrap();
        read_framed(&mut self.stream, &mut self.buf, parse_response).unwrap()
    }
}

fn read_one_response(stream: &mut UnixStream) -> Response {
    let mut buf = FrameBuffer::new();
    read_framed(stream, &mut buf, parse_response).unwrap()
}

#[test]
fn create_write_read_round_trip() {
    let (_service, server) = TestServer::start(10, 1_000, 4);
    let mut c = server.connect();

    let resp = c.send(Command::OpenCl, b"/greeting", b"");
    assert_eq!(resp.code, 200);

    let resp = c.send(Command::Write, b"/greeting", b"hello, world");
    assert_eq!(resp.code, 200);

    let resp = c.send(Command::Read, b"/greeting", b"");
    assert_eq!(resp.code, 200);
    let ParseOutcome::Complete(records, _) = parse_data_field(&resp.data).unwrap() else {
        panic!("expected a complete record");
    };
    assert_eq!(records[0].bytes, b"hello, world");
}

#[test]
fn eviction_returns_the_evicted_file_to_the_writer() {
    let (_service, server) = TestServer::start(2, 100, 4);
    let mut c = server.connect();

    c.send(Command::OpenCl, b"/a", b"");
    c.send(Command::Write, b"/a", &vec![b'A'; 60]);
    c.send(Command::Close, b"/a", b"");

    c.send(Command::OpenCl, b"/b", b"");
    let resp = c.send(Command::Write, b"/b", &vec![b'B'; 50]);
    assert_eq!(resp.code, 200);

    let ParseOutcome::Complete(records, _) = parse_data_field(&resp.data).unwrap() else {
        panic!("expected a complete record");
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].pathname, b"/a");
}

#[test]
fn lock_contention_blocks_until_release() {
    let (_service, server) = TestServer::start(10, 1_000, 4);
    let mut holder = server.connect();
    let mut waiter = server.connect();

    holder.send(Command::OpenCl, b"/shared", b"");
    waiter.send(Command::Open, b"/shared", b"");

    let unlock_thread = {
        let socket_path = server.socket_path.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            let mut c = Client {
                stream: UnixStream::connect(&socket_path).unwrap(),
                buf: FrameBuffer::new(),
            };
            let _greeting = read_one_response(&mut c.stream);
            // Just proves the socket stays responsive while /shared is locked.
            let resp = c.send(Command::OpenCl, b"/other", b"");
            assert_eq!(resp.code, 200);
        })
    };

    thread::sleep(Duration::from_millis(50));
    let resp = holder.send(Command::Unlock, b"/shared", b"");
    assert_eq!(resp.code, 200);

    let resp = waiter.send(Command::Lock, b"/shared", b"");
    assert_eq!(resp.code, 200);

    unlock_thread.join().unwrap();
}

#[test]
fn remove_while_referenced_hides_until_last_close() {
    let (_service, server) = TestServer::start(10, 1_000, 4);
    let mut owner = server.connect();
    let mut reader = server.connect();

    owner.send(Command::OpenCl, b"/doomed", b"");
    reader.send(Command::Open, b"/doomed", b"");

    let resp = owner.send(Command::Remove, b"/doomed", b"");
    assert_eq!(resp.code, 200);

    let resp = reader.send(Command::Read, b"/doomed", b"");
    assert_eq!(resp.code, 550, "pending-delete entries are invisible to READ");

    let resp = reader.send(Command::Close, b"/doomed", b"");
    assert_eq!(resp.code, 200);

    let mut fresh = server.connect();
    let resp = fresh.send(Command::OpenC, b"/doomed", b"");
    assert_eq!(resp.code, 200, "pathname is free again once the last reference closes");
}

#[test]
fn append_grows_size_and_is_rejected_past_quota() {
    let (_service, server) = TestServer::start(10, 20, 4);
    let mut c = server.connect();

    c.send(Command::OpenCl, b"/log", b"");
    let resp = c.send(Command::Write, b"/log", b"0123456789");
    assert_eq!(resp.code, 200);

    let resp = c.send(Command::Append, b"/log", b"0123456789");
    assert_eq!(resp.code, 200);

    let resp = c.send(Command::Append, b"/log", b"one-byte-too-many!!");
    assert_eq!(resp.code, 552, "growing past bytes_cap is a quota error");
}

#[test]
fn admission_is_rejected_once_max_connections_is_reached() {
    let (_service, server) = TestServer::start(10, 1_000, 1);
    let _first = server.connect();

    let mut second = UnixStream::connect(&server.socket_path).unwrap();
    let greeting = read_one_response(&mut second);
    assert_eq!(greeting.code, 421);
}
