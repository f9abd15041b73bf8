//! Local proxy: the session-lifetime process between the invoking app and
//! the transport client.
//!
//! Owns the stream-0 replay buffer and the epoch counter. Spawns the
//! transport client (with the shim invocation spliced into its argument
//! vector), runs the bootstrap/resume handshakes, and forwards the three
//! standard streams until the remote command finishes — respawning the
//! transport whenever it breaks mid-session.

use crate::config::ShimConfig;
use crate::debug_log::debug_log;
use crate::stream::{StreamBuf, CHUNK_SIZE};
use crate::transport::TransportCommand;
use crate::wire;
use anyhow::{Context, Result};
use rand::Rng;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Base delay between failed spawn attempts (milliseconds).
const BASE_RETRY_DELAY_MS: u64 = 250;

/// Cap on a single backoff sleep (milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 4000;

/// Runs the local proxy until the session ends.
pub async fn run(args: Vec<String>, timeout: Duration, config: &ShimConfig) -> Result<()> {
    let transport = TransportCommand::parse(&args)?;
    let program = which::which(transport.program()).with_context(|| {
        format!("transport client {:?} not found in PATH", transport.program())
    })?;
    debug_log(
        "local",
        &format!("remote command: {}", transport.command().join(" ")),
    );
    for (key, value) in transport.absorbed_options() {
        debug_log("local", &format!("transport option {}={}", key, value));
    }

    let mut session = LocalSession::new(transport, program, timeout, config);
    let mut link = session.connect().await?;
    loop {
        match session.forward(&mut link).await? {
            Outcome::Finished => break,
            Outcome::Reconnect => {
                link.shutdown().await;
                link = session.connect().await?;
            }
        }
    }
    link.shutdown().await;
    debug_log("local", "session complete");
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Finished,
    Reconnect,
}

enum SpawnOutcome {
    /// Handshake complete, forwarding may proceed.
    Ready(TransportLink),
    /// First incarnation negotiated the sockdir and exited; respawn.
    Bootstrapped,
    /// Transient failure worth another attempt.
    Retry(String),
}

pub(crate) enum HandshakeReply {
    /// Stream-0 bytes the daemon has received so far.
    Confirmed(u64),
    /// The remote proxy could not reach the daemon.
    DaemonUnreachable,
}

/// One spawned transport client with its three pipes.
struct TransportLink {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl TransportLink {
    async fn shutdown(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

struct LocalSession {
    transport: TransportCommand,
    program: PathBuf,
    remote_program: String,
    timeout: Duration,
    max_attempts: u32,
    epoch: u64,
    sockdir: Option<String>,
    app_in: tokio::io::Stdin,
    app_out: tokio::io::Stdout,
    app_err: tokio::io::Stderr,
    /// Stream state; survives reconnects.
    streams: Forwarder,
}

impl LocalSession {
    fn new(
        transport: TransportCommand,
        program: PathBuf,
        timeout: Duration,
        config: &ShimConfig,
    ) -> Self {
        Self {
            transport,
            program,
            remote_program: config.remote_program.clone(),
            timeout,
            max_attempts: config.max_spawn_attempts,
            epoch: 0,
            sockdir: None,
            app_in: tokio::io::stdin(),
            app_out: tokio::io::stdout(),
            app_err: tokio::io::stderr(),
            streams: Forwarder::new(),
        }
    }

    /// Spawns the transport until a forwarding-ready link exists, with a
    /// bounded retry budget. Learning the sockdir counts as progress and
    /// resets the budget.
    async fn connect(&mut self) -> Result<TransportLink> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.try_spawn().await? {
                SpawnOutcome::Ready(link) => return Ok(link),
                SpawnOutcome::Bootstrapped => {
                    debug_log("local", "bootstrap complete, respawning with sockdir");
                    attempts = 0;
                }
                SpawnOutcome::Retry(reason) => {
                    debug_log(
                        "spawn",
                        &format!("attempt {}/{} failed: {}", attempts, self.max_attempts, reason),
                    );
                    if attempts >= self.max_attempts {
                        anyhow::bail!(
                            "giving up after {} transport spawn attempts: {}",
                            attempts,
                            reason
                        );
                    }
                    self.backoff(attempts).await;
                }
            }
        }
    }

    async fn try_spawn(&mut self) -> Result<SpawnOutcome> {
        self.epoch += 1;
        let argv = self.transport.remote_argv(
            &self.remote_program,
            self.epoch,
            self.timeout.as_secs(),
            self.sockdir.as_deref(),
        );
        debug_log(
            "spawn",
            &format!("epoch {}: {} {}", self.epoch, self.program.display(), argv.join(" ")),
        );

        let mut child = match Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return Ok(SpawnOutcome::Retry(format!("spawn failed: {}", err))),
        };
        let mut stdin = child.stdin.take().context("transport child has no stdin")?;
        let mut stdout = child.stdout.take().context("transport child has no stdout")?;
        let stderr = child.stderr.take().context("transport child has no stderr")?;

        if self.sockdir.is_none() {
            // First incarnation: the far side announces its sockdir, takes
            // an OK, launches the daemon, and exits.
            match bootstrap_exchange(&mut stdout, &mut stdin, self.timeout).await {
                Ok(sockdir) => {
                    debug_log("local", &format!("sockdir {}", sockdir));
                    self.sockdir = Some(sockdir);
                    let _ = tokio::time::timeout(self.timeout, child.wait()).await;
                    Ok(SpawnOutcome::Bootstrapped)
                }
                Err(err) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Ok(SpawnOutcome::Retry(format!("bootstrap: {:#}", err)))
                }
            }
        } else {
            let received = (self.streams.output.rbytes(), self.streams.errout.rbytes());
            match resume_exchange(&mut stdout, &mut stdin, received, self.timeout).await {
                Ok(HandshakeReply::Confirmed(count)) => {
                    // Fatal if the daemon's position fell out of the
                    // retained window.
                    self.streams.input.rewind_to(count)?;
                    debug_log(
                        "local",
                        &format!("resumed at epoch {}, stream 0 confirmed to {}", self.epoch, count),
                    );
                    Ok(SpawnOutcome::Ready(TransportLink {
                        child,
                        stdin,
                        stdout,
                        stderr,
                    }))
                }
                Ok(HandshakeReply::DaemonUnreachable) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    anyhow::bail!("remote daemon is unreachable; the session cannot be resumed")
                }
                Err(err) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Ok(SpawnOutcome::Retry(format!("handshake: {:#}", err)))
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let capped = BASE_RETRY_DELAY_MS
            .saturating_mul(1 << attempt.min(4))
            .min(MAX_RETRY_DELAY_MS);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        tokio::time::sleep(Duration::from_millis(capped / 2 + jitter)).await;
    }

    async fn forward(&mut self, link: &mut TransportLink) -> Result<Outcome> {
        self.streams
            .run(
                &mut self.app_in,
                &mut self.app_out,
                &mut self.app_err,
                &mut link.stdin,
                &mut link.stdout,
                &mut link.stderr,
                &mut link.child,
            )
            .await
    }
}

/// Stream state plus the three-stream forwarding loop, kept apart from the
/// spawn/handshake machinery so the loop can be driven over any pipe pair.
/// Lives across reconnects; one `run` call covers one transport link.
struct Forwarder {
    /// Stream 0 (app → command): replay state.
    input: StreamBuf,
    /// Stream 1 (command → app): transit from the transport.
    output: StreamBuf,
    /// Stream 2 (command → app): transit from the transport.
    errout: StreamBuf,
    /// The app's consumer vanished; output is discarded and stream 0 has
    /// a synthesized EOF.
    app_gone: bool,
}

impl Forwarder {
    fn new() -> Self {
        Self {
            input: StreamBuf::new(),
            output: StreamBuf::new(),
            errout: StreamBuf::new(),
            app_gone: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run<AI, AO, AE, TI, TO, TE>(
        &mut self,
        app_in: &mut AI,
        app_out: &mut AO,
        app_err: &mut AE,
        transport_in: &mut TI,
        transport_out: &mut TO,
        transport_err: &mut TE,
        child: &mut Child,
    ) -> Result<Outcome>
    where
        AI: AsyncRead + Unpin,
        AO: AsyncWrite + Unpin,
        AE: AsyncWrite + Unpin,
        TI: AsyncWrite + Unpin,
        TO: AsyncRead + Unpin,
        TE: AsyncRead + Unpin,
    {
        let mut app_buf = [0u8; CHUNK_SIZE];
        let mut out_buf = [0u8; CHUNK_SIZE];
        let mut err_buf = [0u8; CHUNK_SIZE];
        let mut transport_exited = false;

        loop {
            // Housekeeping: step over delivered markers, drop output
            // nobody is left to read.
            if self.app_gone {
                self.output.discard_pending();
                self.errout.discard_pending();
            } else {
                self.output.consume_marker();
                self.errout.consume_marker();
            }
            if self.finished() {
                return Ok(Outcome::Finished);
            }

            let read_app = !self.app_gone && !self.input.is_eof() && !self.input.saturated();
            let write_transport = self.input.has_pending();
            let read_out = !self.output.is_eof() && !self.output.saturated();
            let read_err = !self.errout.is_eof() && !self.errout.saturated();
            let write_out = !self.app_gone && !self.output.deliverable().is_empty();
            let write_err = !self.app_gone && !self.errout.deliverable().is_empty();

            tokio::select! {
                r = app_in.read(&mut app_buf), if read_app => match r {
                    Ok(0) => self.input.mark_eof()?,
                    Ok(n) => self.input.append(&app_buf[..n])?,
                    Err(err) => {
                        debug_log("local", &format!("app input read error: {}", err));
                        self.input.mark_eof()?;
                    }
                },
                r = transport_in.write(self.input.pending_chunk()), if write_transport => match r {
                    Ok(n) => self.input.advance(n),
                    Err(err) => {
                        debug_log("local", &format!("transport write error: {}", err));
                        return Ok(Outcome::Reconnect);
                    }
                },
                r = transport_out.read(&mut out_buf), if read_out => match r {
                    Ok(0) => {
                        debug_log("local", "transport output broke mid-stream");
                        return Ok(Outcome::Reconnect);
                    }
                    Ok(n) => self.output.append(&out_buf[..n])?,
                    Err(err) => {
                        debug_log("local", &format!("transport output read error: {}", err));
                        return Ok(Outcome::Reconnect);
                    }
                },
                r = transport_err.read(&mut err_buf), if read_err => match r {
                    Ok(0) => {
                        debug_log("local", "transport error channel broke mid-stream");
                        return Ok(Outcome::Reconnect);
                    }
                    Ok(n) => self.errout.append(&err_buf[..n])?,
                    Err(err) => {
                        debug_log("local", &format!("transport error read error: {}", err));
                        return Ok(Outcome::Reconnect);
                    }
                },
                r = app_out.write(self.output.deliverable_chunk()), if write_out => match r {
                    Ok(n) => {
                        self.output.advance(n);
                        let _ = app_out.flush().await;
                    }
                    Err(err) => self.note_app_gone(err.kind())?,
                },
                r = app_err.write(self.errout.deliverable_chunk()), if write_err => match r {
                    Ok(n) => {
                        self.errout.advance(n);
                        let _ = app_err.flush().await;
                    }
                    Err(err) => self.note_app_gone(err.kind())?,
                },
                status = child.wait(), if !transport_exited => {
                    transport_exited = true;
                    match status {
                        Ok(status) => debug_log("local", &format!("transport exited: {}", status)),
                        Err(err) => debug_log("local", &format!("transport reap failed: {}", err)),
                    }
                },
            }
        }
    }

    /// The app's side of stream 1/2 is gone: stop reading its input, flag
    /// a synthesized stream-0 EOF so the far end winds down, and discard
    /// anything further bound for the app.
    fn note_app_gone(&mut self, kind: ErrorKind) -> Result<()> {
        if kind != ErrorKind::BrokenPipe {
            debug_log("local", &format!("app write failed: {:?}", kind));
        }
        self.app_gone = true;
        if !self.input.is_eof() {
            self.input.mark_eof()?;
        }
        self.output.discard_pending();
        self.errout.discard_pending();
        Ok(())
    }

    fn finished(&self) -> bool {
        if self.app_gone {
            // Nobody is left to deliver output to; done once the
            // synthesized EOF has drained toward the transport.
            self.input.complete()
        } else {
            self.output.complete() && self.errout.complete()
        }
    }
}

/// First-incarnation exchange: read the announced sockdir, acknowledge it.
pub(crate) async fn bootstrap_exchange<R, W>(
    from_remote: &mut R,
    to_remote: &mut W,
    patience: Duration,
) -> Result<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let line = wire::read_line_timeout(from_remote, patience)
        .await
        .context("waiting for sockdir announcement")?;
    let sockdir = line.trim().to_string();
    if !sockdir.starts_with('/') {
        anyhow::bail!("implausible sockdir announcement {:?}", line);
    }
    wire::write_line(to_remote, wire::TOKEN_OK)
        .await
        .context("acknowledging sockdir")?;
    Ok(sockdir)
}

/// Resume exchange: report received byte counts for streams 1 and 2, read
/// back the daemon's stream-0 position (or the daemon-unreachable token).
pub(crate) async fn resume_exchange<R, W>(
    from_remote: &mut R,
    to_remote: &mut W,
    received: (u64, u64),
    patience: Duration,
) -> Result<HandshakeReply>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    wire::write_line(to_remote, &wire::format_count_pair(received.0, received.1))
        .await
        .context("sending received-byte report")?;
    let line = wire::read_line_timeout(from_remote, patience)
        .await
        .context("waiting for stream-0 resume count")?;
    if line.trim() == wire::TOKEN_UNREACHABLE {
        return Ok(HandshakeReply::DaemonUnreachable);
    }
    Ok(HandshakeReply::Confirmed(wire::parse_decimal(&line)?))
}

#[cfg(test)]
#[path = "tests/local_tests.rs"]
mod tests;
