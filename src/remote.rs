//! Remote proxy: the transient process at the far end of the transport.
//!
//! The first incarnation only bootstraps: it creates the sockdir,
//! announces it back through the transport, waits for the acknowledgement,
//! launches the detached daemon, and exits. Every later incarnation is a
//! resume: it connects to the daemon's sockets, announces its epoch,
//! relays the byte-count handshake, and then becomes a dumb pipe between
//! its standard streams and the sockets until either side disconnects.
//!
//! This process must never write diagnostics to stdout or stderr — those
//! are streams 1 and 2 of the session.

use crate::debug_log::debug_log;
use crate::stream::{StreamBuf, CHUNK_SIZE};
use crate::wire;
use anyhow::{Context, Result};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Poll interval while waiting for the daemon's sockets to appear.
const SOCKET_WAIT_INTERVAL_MS: u64 = 50;

/// First incarnation: negotiate the sockdir and leave a daemon behind.
pub async fn run_bootstrap(command: Vec<String>, timeout: Duration) -> Result<()> {
    if command.is_empty() {
        anyhow::bail!("no remote command given");
    }
    let sockdir = tempfile::Builder::new()
        .prefix("sshim-")
        .tempdir()
        .context("creating socket directory")?
        .into_path();
    debug_log("remote", &format!("bootstrap sockdir {}", sockdir.display()));

    let mut stdout = tokio::io::stdout();
    let mut stdin = tokio::io::stdin();
    let negotiation = async {
        wire::write_line(&mut stdout, &sockdir.display().to_string())
            .await
            .context("announcing sockdir")?;
        let line = wire::read_line(&mut stdin)
            .await
            .context("waiting for acknowledgement")?;
        if line.trim() != wire::TOKEN_OK {
            anyhow::bail!("unexpected acknowledgement {:?}", line);
        }
        Ok(())
    };
    match tokio::time::timeout(timeout, negotiation).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let _ = std::fs::remove_dir_all(&sockdir);
            return Err(err);
        }
        Err(_) => {
            let _ = std::fs::remove_dir_all(&sockdir);
            anyhow::bail!("timed out waiting for sockdir acknowledgement");
        }
    }

    spawn_daemon(&sockdir, timeout, &command)?;
    debug_log("remote", "daemon launched, bootstrap exiting");
    Ok(())
}

/// Launches the daemon as a detached re-execution of this binary: its own
/// session, null standard streams, reparented once this process exits.
fn spawn_daemon(sockdir: &Path, timeout: Duration, command: &[String]) -> Result<()> {
    let exe = std::env::current_exe()
        .or_else(|_| which::which("sshim").map_err(std::io::Error::other))
        .context("cannot locate own binary to launch the daemon")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--daemon")
        .arg(format!("--sockdir={}", sockdir.display()))
        .arg(format!("--timeout={}", timeout.as_secs()))
        .args(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: the closure runs in the child between fork() and exec();
    // setsid is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            // New session: the transport's teardown must not reach the
            // daemon.
            if nix::libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn().context("launching session daemon")?;
    Ok(())
}

/// Resume incarnation: connect, announce the epoch, relay the handshake,
/// then forward until either side disconnects.
pub async fn run_resume(sockdir: PathBuf, epoch: u64, timeout: Duration) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut stdin = tokio::io::stdin();

    let (sock1, sock2) = match attach(&sockdir, epoch, timeout, &mut stdin, &mut stdout).await {
        Ok(sockets) => sockets,
        Err(err) => {
            debug_log("remote", &format!("cannot attach to daemon: {:#}", err));
            // The local side treats this token as session-fatal.
            let _ = wire::write_line(&mut stdout, wire::TOKEN_UNREACHABLE).await;
            return Ok(());
        }
    };

    let (sock1_r, sock1_w) = sock1.into_split();
    let (sock2_r, sock2_w) = sock2.into_split();
    Relay::new()
        .run(
            stdin,
            stdout,
            tokio::io::stderr(),
            sock1_r,
            sock1_w,
            sock2_r,
            sock2_w,
        )
        .await
}

/// Socket connect plus the full resume handshake. Any failure here means
/// the daemon is unreachable from this incarnation's point of view.
async fn attach<I, O>(
    sockdir: &Path,
    epoch: u64,
    timeout: Duration,
    stdin: &mut I,
    stdout: &mut O,
) -> Result<(UnixStream, UnixStream)>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    // sock.2 is bound second, so its existence implies both are ready.
    let sock2_path = sockdir.join("sock.2");
    wait_for_socket(&sock2_path, timeout).await?;
    let mut sock2 = UnixStream::connect(&sock2_path)
        .await
        .context("connecting to sock.2")?;
    let mut sock1 = UnixStream::connect(sockdir.join("sock.1"))
        .await
        .context("connecting to sock.1")?;

    let exchange = async {
        wire::write_line(&mut sock2, &epoch.to_string())
            .await
            .context("announcing epoch on sock.2")?;
        wire::write_line(&mut sock1, &epoch.to_string())
            .await
            .context("announcing epoch on sock.1")?;
        let confirmed = wire::read_line(&mut sock1)
            .await
            .context("reading stream-0 position")?;
        let counts = wire::read_line(stdin)
            .await
            .context("reading received-byte report")?;
        wire::write_line(&mut sock1, &counts)
            .await
            .context("relaying received-byte report")?;
        wire::write_line(stdout, &confirmed)
            .await
            .context("relaying stream-0 position")?;
        Ok(())
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(())) => Ok((sock1, sock2)),
        Ok(Err(err)) => Err(err),
        Err(_) => anyhow::bail!("handshake timed out"),
    }
}

async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !path.exists() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("socket {} never appeared", path.display());
        }
        tokio::time::sleep(Duration::from_millis(SOCKET_WAIT_INTERVAL_MS)).await;
    }
    Ok(())
}

/// The stateless forwarding core of a resume incarnation. Terminates as
/// soon as any endpoint disconnects; the local proxy decides whether that
/// means recovery or completion.
pub(crate) struct Relay {
    /// Stream 0: stdin → sock.1, marker passed through.
    input: StreamBuf,
    /// Stream 1: sock.1 → stdout, marker passed through.
    output: StreamBuf,
    /// Stream 2: sock.2 → stderr, marker passed through.
    errout: StreamBuf,
    /// Finacks already issued for streams 1 and 2.
    finack_sent: [bool; 2],
}

impl Relay {
    pub(crate) fn new() -> Self {
        Self {
            input: StreamBuf::new(),
            output: StreamBuf::new(),
            errout: StreamBuf::new(),
            finack_sent: [false, false],
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run<I, O, E, S1R, S1W, S2R, S2W>(
        &mut self,
        mut stdin: I,
        mut stdout: O,
        mut stderr: E,
        mut sock1_r: S1R,
        mut sock1_w: S1W,
        mut sock2_r: S2R,
        mut sock2_w: S2W,
    ) -> Result<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
        S1R: AsyncRead + Unpin,
        S1W: AsyncWrite + Unpin,
        S2R: AsyncRead + Unpin,
        S2W: AsyncWrite + Unpin,
    {
        let mut in_buf = [0u8; CHUNK_SIZE];
        let mut out_buf = [0u8; CHUNK_SIZE];
        let mut err_buf = [0u8; CHUNK_SIZE];

        loop {
            // Reads stay armed after EOF so a peer closing is noticed;
            // anything past a marker is dropped by the buffer.
            tokio::select! {
                r = stdin.read(&mut in_buf), if !self.input.saturated() => match r {
                    Ok(0) => {
                        debug_log("remote", "local side closed");
                        return Ok(());
                    }
                    Ok(n) => self.input.append(&in_buf[..n])?,
                    Err(err) => {
                        debug_log("remote", &format!("stdin read error: {}", err));
                        return Ok(());
                    }
                },
                r = sock1_w.write(self.input.pending_chunk()), if self.input.has_pending() => match r {
                    Ok(n) => self.input.advance(n),
                    Err(err) => {
                        debug_log("remote", &format!("sock.1 write error: {}", err));
                        return Ok(());
                    }
                },
                r = sock1_r.read(&mut out_buf), if !self.output.saturated() => match r {
                    Ok(0) => {
                        debug_log("remote", "daemon closed sock.1");
                        return Ok(());
                    }
                    Ok(n) => self.output.append(&out_buf[..n])?,
                    Err(err) => {
                        debug_log("remote", &format!("sock.1 read error: {}", err));
                        return Ok(());
                    }
                },
                r = stdout.write(self.output.pending_chunk()), if self.output.has_pending() => match r {
                    Ok(n) => {
                        self.output.advance(n);
                        let _ = stdout.flush().await;
                        if self.output.complete() && !self.finack_sent[0] {
                            self.finack_sent[0] = true;
                            wire::write_line(&mut sock2_w, "1")
                                .await
                                .context("sending stream-1 finack")?;
                        }
                    }
                    Err(err) => {
                        debug_log("remote", &format!("stdout write error: {}", err));
                        return Ok(());
                    }
                },
                r = sock2_r.read(&mut err_buf), if !self.errout.saturated() => match r {
                    Ok(0) => {
                        debug_log("remote", "daemon closed sock.2");
                        return Ok(());
                    }
                    Ok(n) => self.errout.append(&err_buf[..n])?,
                    Err(err) => {
                        debug_log("remote", &format!("sock.2 read error: {}", err));
                        return Ok(());
                    }
                },
                r = stderr.write(self.errout.pending_chunk()), if self.errout.has_pending() => match r {
                    Ok(n) => {
                        self.errout.advance(n);
                        let _ = stderr.flush().await;
                        if self.errout.complete() && !self.finack_sent[1] {
                            self.finack_sent[1] = true;
                            wire::write_line(&mut sock2_w, "2")
                                .await
                                .context("sending stream-2 finack")?;
                        }
                    }
                    Err(err) => {
                        debug_log("remote", &format!("stderr write error: {}", err));
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
