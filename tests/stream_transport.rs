//! Calls over the default stream transport against a real TCP echo server.
//!
//! This binary installs no mock messenger, so channels here run the stock
//! length-prefixed TCP transport, covering connect deadlines, per-type
//! connection reuse and response demultiplexing.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use hawser::{
    BufferResponse, Channel, ChannelOptions, ConnectionType, Controller, ErrorCode, ProtocolId,
};

const FRAME_MAGIC: &[u8; 4] = b"HWSR";

/// Accepts connections and answers every frame with `echo:` + payload,
/// keeping the correlation id.
async fn spawn_echo_server() -> u16 {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; 16];
                    if stream.read_exact(&mut header).await.is_err() {
                        return;
                    }
                    assert_eq!(&header[0..4], FRAME_MAGIC);
                    let len = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;
                    let mut payload = vec![0u8; len];
                    if stream.read_exact(&mut payload).await.is_err() {
                        return;
                    }
                    let mut reply_payload = b"echo:".to_vec();
                    reply_payload.extend_from_slice(&payload);

                    let mut reply = Vec::with_capacity(16 + reply_payload.len());
                    reply.extend_from_slice(FRAME_MAGIC);
                    reply.extend_from_slice(&header[4..12]);
                    reply.extend_from_slice(&(reply_payload.len() as u32).to_be_bytes());
                    reply.extend_from_slice(&reply_payload);
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    port
}

fn options_with(connection_type: ConnectionType) -> ChannelOptions {
    let mut opts = ChannelOptions::default();
    opts.timeout_ms = 2000;
    opts.connection_type = connection_type.into();
    opts
}

async fn one_call(channel: &Channel, request: &[u8]) -> (Controller, Option<Vec<u8>>) {
    let cntl = Controller::new();
    let response = Arc::new(BufferResponse::new());
    channel
        .call_method(
            None,
            &cntl,
            &request.to_vec(),
            Some(response.clone()),
            None,
        )
        .await;
    (cntl, response.take())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_connections_round_trip() {
    let port = spawn_echo_server().await;
    let opts = options_with(ConnectionType::Short);
    let channel = Channel::init(&format!("127.0.0.1:{port}"), Some(&opts)).unwrap();

    let (cntl, payload) = one_call(&channel, b"ping").await;
    assert_eq!(cntl.error_code(), ErrorCode::Ok, "{}", cntl.error_text());
    assert_eq!(payload, Some(b"echo:ping".to_vec()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_connection_demultiplexes_concurrent_calls() {
    let port = spawn_echo_server().await;
    let opts = options_with(ConnectionType::Single);
    let channel = Arc::new(Channel::init(&format!("127.0.0.1:{port}"), Some(&opts)).unwrap());

    let a = {
        let channel = channel.clone();
        tokio::spawn(async move { one_call(&channel, b"alpha").await })
    };
    let b = {
        let channel = channel.clone();
        tokio::spawn(async move { one_call(&channel, b"beta").await })
    };

    let (cntl_a, payload_a) = a.await.unwrap();
    let (cntl_b, payload_b) = b.await.unwrap();
    assert_eq!(cntl_a.error_code(), ErrorCode::Ok, "{}", cntl_a.error_text());
    assert_eq!(cntl_b.error_code(), ErrorCode::Ok, "{}", cntl_b.error_text());
    assert_eq!(payload_a, Some(b"echo:alpha".to_vec()));
    assert_eq!(payload_b, Some(b"echo:beta".to_vec()));

    // Reuse across sequential calls on the same shared connection.
    let (cntl_c, payload_c) = one_call(&channel, b"gamma").await;
    assert_eq!(cntl_c.error_code(), ErrorCode::Ok);
    assert_eq!(payload_c, Some(b"echo:gamma".to_vec()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pooled_connections_round_trip() {
    let port = spawn_echo_server().await;
    let opts = options_with(ConnectionType::Pooled);
    let channel = Channel::init(&format!("127.0.0.1:{port}"), Some(&opts)).unwrap();

    for i in 0..3u8 {
        let request = vec![b'p', i];
        let (cntl, payload) = one_call(&channel, &request).await;
        assert_eq!(cntl.error_code(), ErrorCode::Ok, "{}", cntl.error_text());
        let mut expected = b"echo:".to_vec();
        expected.extend_from_slice(&request);
        assert_eq!(payload, Some(expected));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_refused_exhausts_retries() {
    // Grab a port with nothing listening on it.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut opts = options_with(ConnectionType::Short);
    opts.max_retry = 3;
    opts.connect_timeout_ms = 100;
    let channel = Channel::init(&format!("127.0.0.1:{port}"), Some(&opts)).unwrap();

    let (cntl, payload) = one_call(&channel, b"ping").await;
    assert_eq!(cntl.error_code(), ErrorCode::ConnectFailed);
    assert_eq!(cntl.attempts_issued(), 4, "initial attempt plus three retries");
    assert_eq!(payload, None);
    assert!(cntl.failed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn esp_requests_carry_the_credential() {
    let port = spawn_echo_server().await;
    let mut opts = options_with(ConnectionType::Pooled);
    opts.protocol = ProtocolId::ESP;
    let channel = Channel::init(&format!("127.0.0.1:{port}"), Some(&opts)).unwrap();

    let (cntl, payload) = one_call(&channel, b"body").await;
    assert_eq!(cntl.error_code(), ErrorCode::Ok, "{}", cntl.error_text());
    // The echoed payload shows what was on the wire: credential header first.
    let mut expected = b"echo:".to_vec();
    expected.extend_from_slice(&4u32.to_be_bytes());
    expected.extend_from_slice(b"ESPA");
    expected.extend_from_slice(b"body");
    assert_eq!(payload, Some(expected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_health_reflects_socket_state() {
    let port = spawn_echo_server().await;
    let healthy = Channel::init(&format!("127.0.0.1:{port}"), None).unwrap();
    healthy.check_health().unwrap();

    // A channel whose connects fail marks its socket, and health follows.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut opts = options_with(ConnectionType::Short);
    opts.max_retry = 0;
    opts.connect_timeout_ms = 100;
    let dead = Channel::init(&format!("127.0.0.1:{dead_port}"), Some(&opts)).unwrap();
    let (cntl, _) = one_call(&dead, b"ping").await;
    assert_eq!(cntl.error_code(), ErrorCode::ConnectFailed);
    assert_eq!(dead.check_health(), Err(ErrorCode::ConnectFailed));
}
