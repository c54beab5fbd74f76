//! End-to-end exercises over the loopback interface: accept/connect, a
//! send/receive round trip, graceful-close detection, and line framing.

use iocp_socket::{AddressFamily, Protocol, SocketType, TcpSocket, Terminator};
use std::thread;
use std::time::Duration;

fn new_stream_socket() -> TcpSocket {
    TcpSocket::new(AddressFamily::InternetworkV4, SocketType::Stream, Protocol::Tcp)
        .expect("socket creation should not fail on a sane host")
}

#[test]
fn accept_connect_and_echo_round_trip() {
    let port = 53217;
    let server = new_stream_socket();
    server.bind("127.0.0.1", port).unwrap();
    server.listen(8).unwrap();

    let accept_awaiter = server.accept_async();

    let client = new_stream_socket();
    let connect_result = client
        .connect_async("127.0.0.1", port)
        .get_for(Duration::from_secs(5));
    assert!(connect_result.is_ok(), "client failed to connect: {connect_result:?}");

    let peer = accept_awaiter
        .get_for(Duration::from_secs(5))
        .expect("server should accept the pending connection");

    let payload = b"hello over iocp".to_vec();
    let sent = client
        .send_async(payload.clone())
        .get_for(Duration::from_secs(5))
        .unwrap();
    assert_eq!(sent.bytes_transferred, payload.len());

    let received = peer
        .receive_async(vec![0u8; payload.len()])
        .get_for(Duration::from_secs(5))
        .unwrap();
    assert_eq!(received.bytes_transferred, payload.len());
    assert_eq!(&received.buffer[..received.bytes_transferred], &payload[..]);

    client.dispose();
    server.dispose();
    peer.dispose();
}

#[test]
fn receive_after_peer_close_reports_connection_reset() {
    let port = 53218;
    let server = new_stream_socket();
    server.bind("127.0.0.1", port).unwrap();
    server.listen(8).unwrap();

    let accept_awaiter = server.accept_async();
    let client = new_stream_socket();
    client
        .connect_async("127.0.0.1", port)
        .get_for(Duration::from_secs(5))
        .unwrap();
    let peer = accept_awaiter.get_for(Duration::from_secs(5)).unwrap();

    client.dispose();

    let result = peer.receive_async(vec![0u8; 16]).get_for(Duration::from_secs(5));
    assert!(matches!(
        result,
        Err(iocp_socket::sync::TimedGetError::Failed(iocp_socket::Error::ConnectionReset))
    ));

    // The disconnect-on-failure hook should have already disposed `peer`;
    // a further operation on it rejects with `Disposed`, not `NoConnection`.
    let after_close = peer.receive_async(vec![0u8; 1]).get_for(Duration::from_secs(5));
    assert!(matches!(
        after_close,
        Err(iocp_socket::sync::TimedGetError::Failed(iocp_socket::Error::Disposed))
    ));

    server.dispose();
    peer.dispose();
}

#[test]
fn receive_line_async_splits_on_configured_terminator() {
    let port = 53219;
    let server = new_stream_socket();
    server.bind("127.0.0.1", port).unwrap();
    server.listen(8).unwrap();

    let accept_awaiter = server.accept_async();
    let client = new_stream_socket();
    client
        .connect_async("127.0.0.1", port)
        .get_for(Duration::from_secs(5))
        .unwrap();
    let peer = accept_awaiter.get_for(Duration::from_secs(5)).unwrap();

    let writer = client.clone();
    let writer_thread = thread::spawn(move || {
        writer
            .send_async(b"first line\r\nsecond".to_vec())
            .get_for(Duration::from_secs(5))
            .unwrap();
    });

    let line = peer
        .receive_line_async(Terminator::CrLf)
        .get_for(Duration::from_secs(5))
        .unwrap();
    assert_eq!(line, "first line\r\n");

    writer_thread.join().unwrap();
    client.dispose();
    server.dispose();
    peer.dispose();
}

#[test]
fn bind_after_bind_is_a_role_mismatch() {
    let socket = new_stream_socket();
    socket.bind("127.0.0.1", 53220).unwrap();
    let err = socket.bind("127.0.0.1", 53221).unwrap_err();
    assert!(matches!(err, iocp_socket::Error::RoleMismatch(_)));
    socket.dispose();
}

#[test]
fn dispose_is_idempotent_across_clones() {
    let socket = new_stream_socket();
    let clone = socket.clone();
    socket.dispose();
    clone.dispose();
}
