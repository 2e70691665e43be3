//! End-to-end tests of the echo protocol over real sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nbsock::protocols::echo::{EchoHandler, EchoMode};
use nbsock::{IoContext, RuntimeConfig, Server, Shared};

fn start(mode: EchoMode) -> (Arc<IoContext>, Server) {
    let context = IoContext::new(RuntimeConfig {
        dispatchers: 2,
        ..RuntimeConfig::default()
    })
    .unwrap();
    let server = Server::builder(Arc::clone(&context), Shared::new(EchoHandler::new(mode)))
        .name("echo-test")
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    (context, server)
}

fn client(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn echoes_lines() {
    let (context, server) = start(EchoMode::Line);
    let mut stream = client(&server);

    stream.write_all(b"hello\n").unwrap();
    assert_eq!(read_exact(&mut stream, 6), b"hello\n");

    stream.write_all(b"one\ntwo\n").unwrap();
    assert_eq!(read_exact(&mut stream, 8), b"one\ntwo\n");

    context.shutdown();
}

#[test]
fn reassembles_split_lines() {
    let (context, server) = start(EchoMode::Line);
    let mut stream = client(&server);

    stream.write_all(b"hel").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"lo\n").unwrap();
    assert_eq!(read_exact(&mut stream, 6), b"hello\n");

    context.shutdown();
}

#[test]
fn quit_closes_the_connection() {
    let (context, server) = start(EchoMode::Line);
    let mut stream = client(&server);

    stream.write_all(b"QUIT\n").unwrap();
    assert_eq!(read_exact(&mut stream, 4), b"OK\r\n");
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    context.shutdown();
}

#[test]
fn echoes_length_prefixed_payloads() {
    let (context, server) = start(EchoMode::LengthPrefixed);
    let mut stream = client(&server);

    stream.write_all(b"5\r\nhel").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"lo").unwrap();
    assert_eq!(read_exact(&mut stream, 8), b"5\r\nhello");

    // Payloads may contain the header delimiter.
    stream.write_all(b"4\r\na\r\nb").unwrap();
    assert_eq!(read_exact(&mut stream, 7), b"4\r\na\r\nb");

    context.shutdown();
}

#[test]
fn rejects_bad_length_headers() {
    let (context, server) = start(EchoMode::LengthPrefixed);
    let mut stream = client(&server);

    stream.write_all(b"abc\r\n").unwrap();
    let expected = b"ERROR invalid length\r\n";
    assert_eq!(read_exact(&mut stream, expected.len()), expected);

    // The connection stays usable.
    stream.write_all(b"2\r\nok").unwrap();
    assert_eq!(read_exact(&mut stream, 5), b"2\r\nok");

    context.shutdown();
}

#[test]
fn serves_many_clients() {
    let (context, server) = start(EchoMode::Line);

    let addr = server.local_addr();
    let clients: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let line = format!("client {i}\n");
                for _ in 0..10 {
                    stream.write_all(line.as_bytes()).unwrap();
                    assert_eq!(read_exact(&mut stream, line.len()), line.as_bytes());
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
    assert_eq!(server.accepted(), 8);

    context.shutdown();
}

#[test]
fn throttled_server_paces_replies() {
    let context = IoContext::new(RuntimeConfig {
        dispatchers: 1,
        tick: Duration::from_millis(5),
        ..RuntimeConfig::default()
    })
    .unwrap();
    let server = Server::builder(
        Arc::clone(&context),
        Shared::new(EchoHandler::new(EchoMode::Line)),
    )
    .throttled(Some(2000))
    .bind("127.0.0.1:0".parse().unwrap())
    .unwrap();
    let mut stream = client(&server);

    // 400 bytes at 2000 B/s take at least 200 ms.
    let mut line = vec![b'z'; 399];
    line.push(b'\n');
    let start = Instant::now();
    stream.write_all(&line).unwrap();
    assert_eq!(read_exact(&mut stream, line.len()), line);
    assert!(start.elapsed() >= Duration::from_millis(190));

    context.shutdown();
}
