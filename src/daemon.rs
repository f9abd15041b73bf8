//! Session daemon: the persistent remote process that owns the user
//! command and survives transport breaks.
//!
//! Listens on `sock.1` (streams 0 and 1) and `sock.2` (stream 2 out,
//! finacks in). At most one remote-proxy peer is registered per socket;
//! a newly accepted connection with a current-or-newer epoch evicts the
//! previous peer, and a stale epoch is dropped without a reply. Streams 1
//! and 2 are replay-buffered here so a reconnecting peer can be rewound to
//! the exact byte it last confirmed.

use crate::debug_log::debug_log;
use crate::stream::{StreamBuf, CHUNK_SIZE};
use crate::wire;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Runs the daemon to completion and removes the sockdir afterwards, no
/// matter how the session ended.
pub async fn run(sockdir: PathBuf, timeout: Duration, command: Vec<String>) -> Result<()> {
    let result = match DaemonSession::start(&sockdir, timeout, command) {
        Ok(mut session) => session.run().await,
        Err(err) => Err(err),
    };
    let _ = std::fs::remove_file(sockdir.join("sock.1"));
    let _ = std::fs::remove_file(sockdir.join("sock.2"));
    let _ = std::fs::remove_dir_all(&sockdir);
    debug_log("daemon", "exiting");
    result
}

struct DaemonSession {
    timeout: Duration,
    listener1: UnixListener,
    listener2: UnixListener,
    current_epoch: u64,

    conn1_r: Option<OwnedReadHalf>,
    conn1_w: Option<OwnedWriteHalf>,
    conn2_r: Option<OwnedReadHalf>,
    conn2_w: Option<OwnedWriteHalf>,

    child: Child,
    cmd_stdin: Option<ChildStdin>,
    cmd_stdout: Option<ChildStdout>,
    cmd_stderr: Option<ChildStderr>,
    cmd_reaped: bool,

    /// Stream 0 (sock.1 → command stdin): transit, marker held back.
    input: StreamBuf,
    /// Stream 1 (command stdout → sock.1): replay state.
    output: StreamBuf,
    /// Stream 2 (command stderr → sock.2): replay state.
    errout: StreamBuf,

    /// Streams whose end-of-session acknowledgement is still owed.
    finack_pending: HashSet<usize>,
    /// Partial finack line carried across reads.
    finack_buf: Vec<u8>,
}

impl DaemonSession {
    fn start(sockdir: &Path, timeout: Duration, command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("no command to run");
        }
        // sock.1 first: the remote proxy keys readiness off sock.2.
        let listener1 = UnixListener::bind(sockdir.join("sock.1"))
            .with_context(|| format!("binding sock.1 in {}", sockdir.display()))?;
        let listener2 = UnixListener::bind(sockdir.join("sock.2"))
            .with_context(|| format!("binding sock.2 in {}", sockdir.display()))?;

        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning user command {:?}", command[0]))?;
        debug_log(
            "daemon",
            &format!("serving {:?} from {}", command.join(" "), sockdir.display()),
        );

        let cmd_stdin = child.stdin.take();
        let cmd_stdout = child.stdout.take();
        let cmd_stderr = child.stderr.take();

        Ok(Self {
            timeout,
            listener1,
            listener2,
            current_epoch: 0,
            conn1_r: None,
            conn1_w: None,
            conn2_r: None,
            conn2_w: None,
            child,
            cmd_stdin,
            cmd_stdout,
            cmd_stderr,
            cmd_reaped: false,
            input: StreamBuf::new(),
            output: StreamBuf::new(),
            errout: StreamBuf::new(),
            finack_pending: HashSet::from([1, 2]),
            finack_buf: Vec::new(),
        })
    }

    async fn run(&mut self) -> Result<()> {
        let mut in_buf = [0u8; CHUNK_SIZE];
        let mut out_buf = [0u8; CHUNK_SIZE];
        let mut err_buf = [0u8; CHUNK_SIZE];
        let mut fin_buf = [0u8; 64];

        loop {
            if self.input.consume_marker() {
                // Stream 0 is done: the command sees EOF on its stdin.
                self.cmd_stdin = None;
                debug_log("daemon", "stream 0 complete, closed command stdin");
            }
            if self.cmd_reaped && self.finack_pending.is_empty() {
                return Ok(());
            }

            let read0 = self.conn1_r.is_some() && !self.input.saturated();
            let write0 = self.cmd_stdin.is_some() && !self.input.deliverable().is_empty();
            let read1 = self.cmd_stdout.is_some() && !self.output.saturated();
            let write1 = self.conn1_w.is_some() && self.output.has_pending();
            let read2 = self.cmd_stderr.is_some() && !self.errout.saturated();
            let write2 = self.conn2_w.is_some() && self.errout.has_pending();
            let read_fin = self.conn2_r.is_some();

            tokio::select! {
                r = self.listener1.accept() => match r {
                    Ok((stream, _)) => self.register_sock1(stream).await?,
                    Err(err) => debug_log("daemon", &format!("sock.1 accept error: {}", err)),
                },
                r = self.listener2.accept() => match r {
                    Ok((stream, _)) => self.register_sock2(stream).await,
                    Err(err) => debug_log("daemon", &format!("sock.2 accept error: {}", err)),
                },
                r = maybe_read(self.conn1_r.as_mut(), &mut in_buf), if read0 => match r {
                    Ok(0) => self.evict_sock1("peer closed"),
                    Ok(n) => self.input.append(&in_buf[..n])?,
                    Err(err) => self.evict_sock1(&format!("read error: {}", err)),
                },
                r = maybe_write(self.cmd_stdin.as_mut(), self.input.deliverable_chunk()), if write0 => match r {
                    Ok(n) => self.input.advance(n),
                    Err(err) => {
                        // The command stopped reading; the rest of stream 0
                        // has nowhere to go.
                        debug_log("daemon", &format!("command stdin write failed: {}", err));
                        self.cmd_stdin = None;
                        self.input.discard_pending();
                    }
                },
                r = maybe_read(self.cmd_stdout.as_mut(), &mut out_buf), if read1 => match r {
                    Ok(0) => {
                        self.output.mark_eof()?;
                        self.cmd_stdout = None;
                    }
                    Ok(n) => self.output.append(&out_buf[..n])?,
                    Err(err) => {
                        debug_log("daemon", &format!("command stdout read error: {}", err));
                        self.output.mark_eof()?;
                        self.cmd_stdout = None;
                    }
                },
                r = maybe_write(self.conn1_w.as_mut(), self.output.pending_chunk()), if write1 => match r {
                    Ok(n) => self.output.advance(n),
                    Err(err) => self.evict_sock1(&format!("write error: {}", err)),
                },
                r = maybe_read(self.cmd_stderr.as_mut(), &mut err_buf), if read2 => match r {
                    Ok(0) => {
                        self.errout.mark_eof()?;
                        self.cmd_stderr = None;
                    }
                    Ok(n) => self.errout.append(&err_buf[..n])?,
                    Err(err) => {
                        debug_log("daemon", &format!("command stderr read error: {}", err));
                        self.errout.mark_eof()?;
                        self.cmd_stderr = None;
                    }
                },
                r = maybe_write(self.conn2_w.as_mut(), self.errout.pending_chunk()), if write2 => match r {
                    Ok(n) => self.errout.advance(n),
                    Err(err) => self.evict_sock2(&format!("write error: {}", err)),
                },
                r = maybe_read(self.conn2_r.as_mut(), &mut fin_buf), if read_fin => match r {
                    Ok(0) => self.evict_sock2("peer closed"),
                    Ok(n) => self.absorb_finacks(&fin_buf[..n]),
                    Err(err) => self.evict_sock2(&format!("read error: {}", err)),
                },
                status = self.child.wait(), if !self.cmd_reaped => {
                    self.cmd_reaped = true;
                    match status {
                        Ok(status) => debug_log("daemon", &format!("command exited: {}", status)),
                        Err(err) => debug_log("daemon", &format!("command reap failed: {}", err)),
                    }
                },
            }
        }
    }

    /// Epoch handshake and byte-count exchange for a fresh sock.1 peer.
    /// Stale epochs are dropped without a reply; a resume point outside
    /// the retained window ends the session.
    async fn register_sock1(&mut self, mut stream: UnixStream) -> Result<()> {
        let epoch = match self.read_epoch(&mut stream).await {
            Some(epoch) => epoch,
            None => return Ok(()),
        };
        if epoch < self.current_epoch {
            debug_log(
                "daemon",
                &format!("dropping stale sock.1 epoch {} (current {})", epoch, self.current_epoch),
            );
            return Ok(());
        }
        self.current_epoch = epoch;
        self.evict_sock1("superseded");

        let position = self.input.rbytes().to_string();
        let exchange = async {
            wire::write_line(&mut stream, &position)
                .await
                .context("reporting stream-0 position")?;
            wire::read_line(&mut stream)
                .await
                .context("reading received-byte report")
        };
        let counts_line = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(line)) => line,
            Ok(Err(err)) => {
                debug_log("daemon", &format!("sock.1 handshake failed: {:#}", err));
                return Ok(());
            }
            Err(_) => {
                debug_log("daemon", "sock.1 handshake timed out");
                return Ok(());
            }
        };
        let (n1, n2) = match wire::parse_count_pair(&counts_line) {
            Ok(counts) => counts,
            Err(err) => {
                debug_log("daemon", &format!("bad received-byte report: {:#}", err));
                return Ok(());
            }
        };
        self.output.rewind_to(n1)?;
        self.errout.rewind_to(n2)?;

        let (reader, writer) = stream.into_split();
        self.conn1_r = Some(reader);
        self.conn1_w = Some(writer);
        debug_log(
            "daemon",
            &format!("sock.1 peer at epoch {}, rewound to {},{}", epoch, n1, n2),
        );
        Ok(())
    }

    /// Epoch check for a fresh sock.2 peer; no data is exchanged here.
    async fn register_sock2(&mut self, mut stream: UnixStream) {
        let epoch = match self.read_epoch(&mut stream).await {
            Some(epoch) => epoch,
            None => return,
        };
        if epoch < self.current_epoch {
            debug_log(
                "daemon",
                &format!("dropping stale sock.2 epoch {} (current {})", epoch, self.current_epoch),
            );
            return;
        }
        self.current_epoch = epoch;
        self.evict_sock2("superseded");
        let (reader, writer) = stream.into_split();
        self.conn2_r = Some(reader);
        self.conn2_w = Some(writer);
        debug_log("daemon", &format!("sock.2 peer at epoch {}", epoch));
    }

    async fn read_epoch(&self, stream: &mut UnixStream) -> Option<u64> {
        let line = match wire::read_line_timeout(stream, self.timeout).await {
            Ok(line) => line,
            Err(err) => {
                debug_log("daemon", &format!("no epoch announcement: {:#}", err));
                return None;
            }
        };
        match wire::parse_decimal(&line) {
            Ok(epoch) => Some(epoch),
            Err(err) => {
                debug_log("daemon", &format!("bad epoch announcement: {:#}", err));
                None
            }
        }
    }

    fn evict_sock1(&mut self, why: &str) {
        if self.conn1_r.is_some() {
            debug_log("daemon", &format!("sock.1 peer gone: {}", why));
        }
        self.conn1_r = None;
        self.conn1_w = None;
    }

    fn evict_sock2(&mut self, why: &str) {
        if self.conn2_r.is_some() {
            debug_log("daemon", &format!("sock.2 peer gone: {}", why));
        }
        self.conn2_r = None;
        self.conn2_w = None;
        self.finack_buf.clear();
    }

    /// Collects newline-terminated finack bytes, tolerating split reads
    /// and ignoring anything that is not a finack.
    fn absorb_finacks(&mut self, data: &[u8]) {
        self.finack_buf.extend_from_slice(data);
        while let Some(pos) = self.finack_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.finack_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            match wire::parse_finack(&line) {
                Ok(stream) => {
                    if self.finack_pending.remove(&stream) {
                        debug_log("daemon", &format!("stream {} acknowledged", stream));
                    }
                }
                Err(_) => {
                    debug_log("daemon", &format!("ignoring junk on finack channel: {:?}", line));
                }
            }
        }
    }
}

/// Reads from an optional handle; pends forever when absent so a disabled
/// `select!` arm can still be constructed.
async fn maybe_read<R>(handle: Option<&mut R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match handle {
        Some(handle) => handle.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Writes to an optional handle; pends forever when absent.
async fn maybe_write<W>(handle: Option<&mut W>, data: &[u8]) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    match handle {
        Some(handle) => handle.write(data).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/daemon_tests.rs"]
mod tests;
