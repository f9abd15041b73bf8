use super::*;
use crate::stream::{BUF_SIZE, EOF_MARKER};
use tokio::task::JoinHandle;

const PATIENCE: Duration = Duration::from_secs(10);

async fn start_daemon(command: &[&str]) -> (tempfile::TempDir, JoinHandle<Result<()>>) {
    let dir = tempfile::Builder::new()
        .prefix("sshim-test-")
        .tempdir()
        .unwrap();
    let sockdir = dir.path().to_path_buf();
    let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
    let handle = tokio::spawn(run(sockdir, Duration::from_secs(2), command));

    // sock.2 is bound second; once it exists the daemon is ready.
    let sock2 = dir.path().join("sock.2");
    while !sock2.exists() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (dir, handle)
}

/// Connects like a remote-proxy incarnation: sock.2 first, epoch on both,
/// then the byte-count exchange on sock.1.
async fn attach(
    dir: &Path,
    epoch: u64,
    received: (u64, u64),
) -> (UnixStream, UnixStream, u64) {
    let mut sock2 = UnixStream::connect(dir.join("sock.2")).await.unwrap();
    let mut sock1 = UnixStream::connect(dir.join("sock.1")).await.unwrap();
    wire::write_line(&mut sock2, &epoch.to_string()).await.unwrap();
    wire::write_line(&mut sock1, &epoch.to_string()).await.unwrap();
    let confirmed = wire::parse_decimal(&wire::read_line(&mut sock1).await.unwrap()).unwrap();
    wire::write_line(&mut sock1, &wire::format_count_pair(received.0, received.1))
        .await
        .unwrap();
    (sock1, sock2, confirmed)
}

async fn read_exactly(sock: &mut UnixStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(PATIENCE, sock.read_exact(&mut buf))
        .await
        .expect("timed out reading stream data")
        .unwrap();
    buf
}

async fn send_finacks(sock2: &mut UnixStream) {
    wire::write_line(sock2, "1").await.unwrap();
    wire::write_line(sock2, "2").await.unwrap();
}

async fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    tokio::time::timeout(PATIENCE, handle)
        .await
        .expect("daemon did not exit")
        .expect("daemon task panicked")
}

#[tokio::test]
async fn test_cat_round_trip() {
    let (dir, handle) = start_daemon(&["cat"]).await;
    let (mut sock1, mut sock2, confirmed) = attach(dir.path(), 1, (0, 0)).await;
    assert_eq!(confirmed, 0);

    sock1.write_all(b"hello\n").await.unwrap();
    sock1.write_all(EOF_MARKER).await.unwrap();

    // cat echoes the line (without the marker) and exits on stdin EOF;
    // its own end-of-stream markers follow.
    let echoed = read_exactly(&mut sock1, 6 + EOF_MARKER.len()).await;
    assert_eq!(&echoed[..6], b"hello\n");
    assert_eq!(&echoed[6..], EOF_MARKER);

    let err_stream = read_exactly(&mut sock2, EOF_MARKER.len()).await;
    assert_eq!(err_stream, EOF_MARKER);

    send_finacks(&mut sock2).await;
    join(handle).await.unwrap();
}

#[tokio::test]
async fn test_stale_epoch_is_dropped_silently() {
    let (dir, handle) = start_daemon(&["cat"]).await;
    let (mut sock1, mut sock2, _) = attach(dir.path(), 3, (0, 0)).await;

    // A zombie incarnation from a superseded epoch connects late.
    let mut stale2 = UnixStream::connect(dir.path().join("sock.2")).await.unwrap();
    let mut stale1 = UnixStream::connect(dir.path().join("sock.1")).await.unwrap();
    wire::write_line(&mut stale2, "2").await.unwrap();
    wire::write_line(&mut stale1, "2").await.unwrap();

    // No reply, just a closed connection.
    let mut probe = [0u8; 1];
    assert_eq!(stale2.read(&mut probe).await.unwrap(), 0);
    assert_eq!(stale1.read(&mut probe).await.unwrap(), 0);

    // The registered peer is unaffected.
    sock1.write_all(b"ok\n").await.unwrap();
    sock1.write_all(EOF_MARKER).await.unwrap();
    let echoed = read_exactly(&mut sock1, 3 + EOF_MARKER.len()).await;
    assert_eq!(&echoed[..3], b"ok\n");

    read_exactly(&mut sock2, EOF_MARKER.len()).await;
    send_finacks(&mut sock2).await;
    join(handle).await.unwrap();
}

#[tokio::test]
async fn test_reconnect_replays_only_unconfirmed_bytes() {
    let (dir, handle) = start_daemon(&["sh", "-c", "printf abcdefgh"]).await;

    let (mut sock1, sock2, confirmed) = attach(dir.path(), 1, (0, 0)).await;
    assert_eq!(confirmed, 0);
    let first = read_exactly(&mut sock1, 8 + EOF_MARKER.len()).await;
    assert_eq!(&first[..8], b"abcdefgh");

    // Transport dies before anything was acknowledged end-to-end; the
    // local side saw only 4 bytes of stream 1 arrive.
    drop(sock1);
    drop(sock2);

    let (mut sock1, mut sock2, _) = attach(dir.path(), 2, (4, 0)).await;
    let replayed = read_exactly(&mut sock1, 4 + EOF_MARKER.len()).await;
    assert_eq!(&replayed[..4], b"efgh");
    assert_eq!(&replayed[4..], EOF_MARKER);

    let err_stream = read_exactly(&mut sock2, EOF_MARKER.len()).await;
    assert_eq!(err_stream, EOF_MARKER);

    send_finacks(&mut sock2).await;
    join(handle).await.unwrap();
}

#[tokio::test]
async fn test_daemon_waits_for_finacks_before_exiting() {
    let (dir, handle) = start_daemon(&["sh", "-c", "echo abc"]).await;
    let (mut sock1, mut sock2, _) = attach(dir.path(), 1, (0, 0)).await;

    let out = read_exactly(&mut sock1, 4 + EOF_MARKER.len()).await;
    assert_eq!(&out[..4], b"abc\n");
    read_exactly(&mut sock2, EOF_MARKER.len()).await;

    // Everything is delivered and the command has exited, but the
    // acknowledgements are still owed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished());

    send_finacks(&mut sock2).await;
    join(handle).await.unwrap();
}

#[tokio::test]
async fn test_resume_outside_retained_window_is_fatal() {
    // Push well past the truncation threshold so the head of stream 1 is
    // no longer retained.
    let total: usize = 3 * BUF_SIZE + 2 * 1024 * 1024;
    let script = format!("head -c {} /dev/zero", total);
    let (dir, handle) = start_daemon(&["sh", "-c", &script]).await;

    let (mut sock1, _sock2, _) = attach(dir.path(), 1, (0, 0)).await;
    let mut remaining = total + EOF_MARKER.len();
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        tokio::time::timeout(PATIENCE, sock1.read_exact(&mut buf[..want]))
            .await
            .expect("timed out draining stream 1")
            .unwrap();
        remaining -= want;
    }
    drop(sock1);

    // Claiming nothing ever arrived asks for bytes that were truncated
    // away; the daemon must fail the session instead of resuming.
    let (_sock1, _sock2, _) = attach(dir.path(), 2, (0, 0)).await;
    let outcome = join(handle).await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_sockdir_removed_on_exit() {
    let (dir, handle) = start_daemon(&["sh", "-c", "echo done"]).await;
    let (mut sock1, mut sock2, _) = attach(dir.path(), 1, (0, 0)).await;

    read_exactly(&mut sock1, 5 + EOF_MARKER.len()).await;
    read_exactly(&mut sock2, EOF_MARKER.len()).await;
    send_finacks(&mut sock2).await;
    join(handle).await.unwrap();

    assert!(!dir.path().join("sock.1").exists());
    assert!(!dir.path().join("sock.2").exists());
}
