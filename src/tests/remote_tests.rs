use super::*;
use crate::stream::EOF_MARKER;
use tokio::io::duplex;

/// Full pass through the relay: stream 0 reaches the daemon side, streams
/// 1 and 2 reach the local side with markers intact, and each completed
/// outbound stream is acknowledged on sock.2.
#[tokio::test]
async fn test_relay_forwards_and_acknowledges() {
    let (mut local_in, relay_stdin) = duplex(4096);
    let (relay_stdout, mut local_out) = duplex(4096);
    let (relay_stderr, mut local_err) = duplex(4096);
    let (daemon_sock1, relay_sock1) = duplex(4096);
    let (daemon_sock2, relay_sock2) = duplex(4096);

    let (sock1_r, sock1_w) = tokio::io::split(relay_sock1);
    let (sock2_r, sock2_w) = tokio::io::split(relay_sock2);
    let relay = tokio::spawn(async move {
        Relay::new()
            .run(
                relay_stdin,
                relay_stdout,
                relay_stderr,
                sock1_r,
                sock1_w,
                sock2_r,
                sock2_w,
            )
            .await
    });

    let (mut d1_r, mut d1_w) = tokio::io::split(daemon_sock1);
    let (mut d2_r, mut d2_w) = tokio::io::split(daemon_sock2);

    // Stream 0 flows toward the daemon untouched.
    local_in.write_all(b"ping\n").await.unwrap();
    let mut upstream = [0u8; 5];
    d1_r.read_exact(&mut upstream).await.unwrap();
    assert_eq!(&upstream, b"ping\n");

    // Stream 1 comes back marker and all, then gets acknowledged.
    d1_w.write_all(b"pong").await.unwrap();
    d1_w.write_all(EOF_MARKER).await.unwrap();
    let mut downstream = vec![0u8; 4 + EOF_MARKER.len()];
    local_out.read_exact(&mut downstream).await.unwrap();
    assert_eq!(&downstream[..4], b"pong");
    assert_eq!(&downstream[4..], EOF_MARKER);

    let finack = wire::read_line(&mut d2_r).await.unwrap();
    assert_eq!(finack, "1");

    // Stream 2 closes empty: marker through, second finack back.
    d2_w.write_all(EOF_MARKER).await.unwrap();
    let mut err_marker = vec![0u8; EOF_MARKER.len()];
    local_err.read_exact(&mut err_marker).await.unwrap();
    assert_eq!(err_marker, EOF_MARKER);

    let finack = wire::read_line(&mut d2_r).await.unwrap();
    assert_eq!(finack, "2");

    // The local side going away ends the relay.
    drop(local_in);
    tokio::time::timeout(Duration::from_secs(2), relay)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

/// The daemon side closing a socket aborts the relay so the local proxy
/// can respawn a fresh incarnation.
#[tokio::test]
async fn test_relay_aborts_when_daemon_disconnects() {
    let (_local_in, relay_stdin) = duplex(4096);
    let (relay_stdout, _local_out) = duplex(4096);
    let (relay_stderr, _local_err) = duplex(4096);
    let (daemon_sock1, relay_sock1) = duplex(4096);
    let (_daemon_sock2, relay_sock2) = duplex(4096);

    let (sock1_r, sock1_w) = tokio::io::split(relay_sock1);
    let (sock2_r, sock2_w) = tokio::io::split(relay_sock2);
    let relay = tokio::spawn(async move {
        Relay::new()
            .run(
                relay_stdin,
                relay_stdout,
                relay_stderr,
                sock1_r,
                sock1_w,
                sock2_r,
                sock2_w,
            )
            .await
    });

    drop(daemon_sock1);
    tokio::time::timeout(Duration::from_secs(2), relay)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
