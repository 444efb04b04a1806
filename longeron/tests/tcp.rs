//! TCP socket round-trip against a loopback HTTP fixture.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;

use longeron::{Executor, SequenceBuffer, TcpSocket};

/// One-shot HTTP server: accepts a single connection, reads until the
/// header terminator, answers 200, closes.
fn spawn_http_fixture() -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .unwrap();
    });
    (addr, handle)
}

#[test]
fn http_get_round_trip() {
    longeron::dev_tracing::init_tracing();

    let (addr, server) = spawn_http_fixture();
    let executor = Executor::new();
    let socket = Arc::new(TcpSocket::new(&executor));
    let response = Arc::new(Mutex::new(Vec::new()));

    {
        let socket_send = Arc::clone(&socket);
        let response = Arc::clone(&response);
        socket.async_connect(addr, move |result| {
            result.unwrap();

            let mut request = SequenceBuffer::new();
            request.append(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
            let socket_recv = Arc::clone(&socket_send);
            socket_send.async_send(request, move |result, _buf| {
                result.unwrap();

                let response = Arc::clone(&response);
                let inbuf = SequenceBuffer::with_capacity(4096);
                socket_recv.async_recv(inbuf, move |result, buf| {
                    result.unwrap();
                    response.lock().unwrap().extend_from_slice(buf.read_head());
                });
            });
        });
    }

    executor.run();
    server.join().unwrap();

    let response = response.lock().unwrap();
    assert!(
        response.len() >= 15,
        "short response: {:?}",
        String::from_utf8_lossy(&response)
    );
    assert_eq!(&response[..15], b"HTTP/1.1 200 OK");
    socket.shutdown();
}
