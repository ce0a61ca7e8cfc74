//! End-to-end tests over loopback: sessions, streams, listeners and the
//! address-dispatching network.

use pathlink_core::{SelectorState, StaticResolver};
use pathlink_integration_tests::{
    LOCAL_IA, bind_listener, eventually, ia, init_tracing, insecure_dialer, local_resolver,
    loopback_credential, round_trip, spawn_echo, test_config,
};
use pathlink_transport::{
    ClientTls, Conn, Credential, Dialer, Listener, Network, SessionConfig, StreamConn,
    TransportError,
};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn dial_target(listener: &pathlink_transport::StreamListener) -> String {
    listener.sessions().local_addr().to_string()
}

#[tokio::test]
async fn test_echo_without_verification() {
    init_tracing();
    let credential = loopback_credential();
    let listener = Arc::new(bind_listener(LOCAL_IA, &credential).unwrap());
    let target = dial_target(&listener);
    let server = spawn_echo(Arc::clone(&listener));

    let dialer = insecure_dialer(local_resolver()).with_config(test_config());
    let session = dialer.dial(&target).await.unwrap();
    assert_eq!(session.alpn().as_deref(), Some(&b"hello-quic"[..]));
    assert!(session.path().is_some());

    let mut conn = StreamConn::dial(session).await.unwrap();
    assert_eq!(conn.remote_addr().network(), "scion");
    assert_eq!(conn.remote_addr().to_string(), target);

    let reply = round_trip(&mut conn, b"hello over a path").await.unwrap();
    assert_eq!(reply, b"hello over a path");
    conn.close().await.unwrap();

    listener.sessions().close();
    server.await.unwrap();
}

#[tokio::test]
async fn test_echo_with_verified_certificate() {
    init_tracing();
    let credential = loopback_credential();
    let listener = Arc::new(bind_listener(LOCAL_IA, &credential).unwrap());
    let target = dial_target(&listener);
    let _server = spawn_echo(Arc::clone(&listener));

    let dialer = Dialer::new(Arc::new(local_resolver()), ClientTls::trusting(&credential))
        .with_config(test_config())
        .with_server_name("localhost");
    let mut conn = StreamConn::dial(dialer.dial(&target).await.unwrap())
        .await
        .unwrap();

    let reply = round_trip(&mut conn, b"verified").await.unwrap();
    assert_eq!(reply, b"verified");
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_untrusted_certificate_is_rejected() {
    init_tracing();
    let credential = loopback_credential();
    let listener = Arc::new(bind_listener(LOCAL_IA, &credential).unwrap());
    let target = dial_target(&listener);
    let _server = spawn_echo(Arc::clone(&listener));

    let stranger = Credential::self_signed(["localhost"]).unwrap();
    let dialer = Dialer::new(Arc::new(local_resolver()), ClientTls::trusting(&stranger))
        .with_config(test_config())
        .with_server_name("localhost");
    let err = dialer.dial(&target).await.unwrap_err();
    assert!(
        matches!(err, TransportError::HandshakeRejected { .. }),
        "unexpected error: {err}"
    );
    assert!(err.is_dial_failure());
}

#[tokio::test]
async fn test_alpn_mismatch_is_rejected_and_listener_keeps_serving() {
    init_tracing();
    let credential = loopback_credential();
    let listener = Arc::new(bind_listener(LOCAL_IA, &credential).unwrap());
    let target = dial_target(&listener);
    let _server = spawn_echo(Arc::clone(&listener));

    let wrong = SessionConfig {
        alpn: vec![b"not-hello".to_vec()],
        ..test_config()
    };
    let err = insecure_dialer(local_resolver())
        .with_config(wrong)
        .dial(&target)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::HandshakeRejected { .. }));

    let dialer = insecure_dialer(local_resolver()).with_config(test_config());
    let mut conn = StreamConn::dial(dialer.dial(&target).await.unwrap())
        .await
        .unwrap();
    assert_eq!(round_trip(&mut conn, b"still up").await.unwrap(), b"still up");
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_close_stops_selector() {
    init_tracing();
    let credential = loopback_credential();
    let listener = Arc::new(bind_listener(LOCAL_IA, &credential).unwrap());
    let target = dial_target(&listener);
    let _server = spawn_echo(Arc::clone(&listener));

    let dialer = insecure_dialer(local_resolver()).with_config(test_config());
    let mut conn = StreamConn::dial(dialer.dial(&target).await.unwrap())
        .await
        .unwrap();
    let selector = Arc::clone(conn.session().selector().unwrap());
    assert_ne!(selector.state(), SelectorState::Stopped);

    conn.close().await.unwrap();
    assert_eq!(selector.state(), SelectorState::Stopped);
    assert!(conn.session().is_closed());

    // Idempotent
    conn.close().await.unwrap();
    assert_eq!(selector.state(), SelectorState::Stopped);
}

#[tokio::test]
async fn test_peer_close_stops_selector() {
    init_tracing();
    let credential = loopback_credential();
    let listener = bind_listener(LOCAL_IA, &credential).unwrap();
    let target = dial_target(&listener);

    let dialer = insecure_dialer(local_resolver()).with_config(test_config());
    let (accepted, dialed) = tokio::join!(listener.accept_stream(), async {
        StreamConn::dial(dialer.dial(&target).await.unwrap()).await
    });
    let mut server_side = accepted.unwrap();
    let client_side = dialed.unwrap();

    // Inbound sessions carry no domain information
    let peer = server_side.remote_addr();
    assert!(peer.to_string().starts_with("0-0,"));
    assert_eq!(peer.socket_addr().port(), client_side.local_addr().socket_addr().port());
    assert!(server_side.session().selector().is_none());

    let selector = Arc::clone(client_side.session().selector().unwrap());
    server_side.close().await.unwrap();

    let stopped = eventually(Duration::from_secs(5), || {
        selector.state() == SelectorState::Stopped
    })
    .await;
    assert!(stopped, "selector still {:?}", selector.state());
    assert!(client_side.session().is_closed());
}

#[tokio::test]
async fn test_handshake_timeout_against_silent_peer() {
    init_tracing();
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = format!("{LOCAL_IA},{}", silent.local_addr().unwrap());

    let config = SessionConfig {
        handshake_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let dialer = insecure_dialer(local_resolver()).with_config(config);
    let started = tokio::time::Instant::now();
    let err = dialer.dial(&target).await.unwrap_err();

    match err {
        TransportError::HandshakeTimeout { timeout, .. } => {
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected handshake timeout, got {other}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_listener_close_fails_accept() {
    init_tracing();
    let credential = loopback_credential();
    let listener = bind_listener(LOCAL_IA, &credential).unwrap();
    let as_listener: &dyn Listener = &listener;
    assert_eq!(as_listener.local_addr().network(), "scion");

    as_listener.close().await;
    let err = as_listener.accept().await.err().unwrap();
    assert!(matches!(err, TransportError::AcceptError { .. }));
}

#[tokio::test]
async fn test_listener_close_keeps_established_streams() {
    init_tracing();
    let credential = loopback_credential();
    let listener = Arc::new(bind_listener(LOCAL_IA, &credential).unwrap());
    let target = dial_target(&listener);
    let _server = spawn_echo(Arc::clone(&listener));

    let dialer = insecure_dialer(local_resolver()).with_config(test_config());
    let mut conn = StreamConn::dial(dialer.dial(&target).await.unwrap())
        .await
        .unwrap();
    assert_eq!(round_trip(&mut conn, b"before").await.unwrap(), b"before");

    listener.sessions().close();
    assert_eq!(round_trip(&mut conn, b"after").await.unwrap(), b"after");
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_read_deadline_expires() {
    init_tracing();
    let credential = loopback_credential();
    let listener = Arc::new(bind_listener(LOCAL_IA, &credential).unwrap());
    let target = dial_target(&listener);
    let _server = spawn_echo(Arc::clone(&listener));

    let dialer = insecure_dialer(local_resolver()).with_config(test_config());
    let mut conn = StreamConn::dial(dialer.dial(&target).await.unwrap())
        .await
        .unwrap();

    conn.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 16];
    let err = conn.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);

    // Clearing the deadline makes the stream usable again
    conn.set_read_deadline(None);
    assert_eq!(round_trip(&mut conn, b"late").await.unwrap(), b"late");
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_dial_by_host_name() {
    init_tracing();
    let credential = loopback_credential();
    let listener = Arc::new(bind_listener(LOCAL_IA, &credential).unwrap());
    let port = listener.sessions().local_addr().port;
    let _server = spawn_echo(Arc::clone(&listener));

    let resolver = StaticResolver::new(ia(LOCAL_IA)).with_host(
        "echo.internal",
        ia(LOCAL_IA),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    );
    let dialer = insecure_dialer(resolver).with_config(test_config());
    let session = dialer.dial(&format!("echo.internal:{port}")).await.unwrap();
    assert_eq!(
        session.remote_addr().to_string(),
        format!("{LOCAL_IA},127.0.0.1:{port}")
    );

    let mut conn = StreamConn::dial(session).await.unwrap();
    assert_eq!(round_trip(&mut conn, b"by name").await.unwrap(), b"by name");
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_network_dispatches_by_address() {
    init_tracing();
    let credential = loopback_credential();
    let dialer = insecure_dialer(local_resolver()).with_config(test_config());
    let network = Arc::new(Network::new(dialer, credential));

    let path_bind = format!("{LOCAL_IA},127.0.0.1:0");
    for bind in ["127.0.0.1:0", path_bind.as_str()] {
        let listener = network.listen(bind).await.unwrap();
        let local = listener.local_addr();
        let target = match local.network() {
            "tcp" => local.socket_addr().to_string(),
            _ => local.to_string(),
        };
        assert_eq!(network.is_path_aware(&target), local.network() == "scion");

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut message = Vec::new();
            conn.read_to_end(&mut message).await.unwrap();
            conn.write_all(&message).await.unwrap();
            conn.shutdown().await.unwrap();
            conn.close().await.unwrap();
            listener.close().await;
        });

        let mut conn = network.dial(&target).await.unwrap();
        assert_eq!(conn.remote_addr().network(), local.network());
        conn.write_all(b"dispatched").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"dispatched");
        conn.close().await.unwrap();
        server.await.unwrap();
    }
}

#[tokio::test]
async fn test_session_without_stream_does_not_block_others() {
    init_tracing();
    let credential = loopback_credential();
    let listener = bind_listener(LOCAL_IA, &credential).unwrap();
    let target = dial_target(&listener);
    let dialer = insecure_dialer(local_resolver()).with_config(test_config());

    // Handshakes but never opens its stream
    let idle = dialer.dial(&target).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (accepted, dialed) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(1), listener.accept_stream()),
        async { StreamConn::dial(dialer.dial(&target).await.unwrap()).await }
    );
    let mut server_side = accepted
        .expect("stream held up behind the idle session")
        .unwrap();
    let client_side = dialed.unwrap();
    assert_eq!(
        server_side.remote_addr().socket_addr().port(),
        client_side.local_addr().socket_addr().port()
    );

    server_side.close().await.unwrap();
    idle.close();
}
