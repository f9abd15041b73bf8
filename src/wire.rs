//! Newline-terminated control lines.
//!
//! The resume protocol interleaves one-line controls (sockdir path, epoch,
//! byte-count pair, finack, `OK`, `X`) with raw stream data on the same
//! channels. Reads therefore go one byte at a time until the newline: a
//! buffered reader would swallow stream bytes that follow the line.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest acceptable control line. Anything longer is a protocol
/// violation, not a slow sender.
const MAX_LINE_LEN: usize = 512;

/// Clean-session acknowledgement sent by the local proxy after reading the
/// sockdir path.
pub const TOKEN_OK: &str = "OK";

/// Daemon-unreachable reply sent by the remote proxy in place of a byte
/// count.
pub const TOKEN_UNREACHABLE: &str = "X";

/// Reads one control line, excluding the terminating newline.
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader
            .read(&mut byte)
            .await
            .context("control-line read failed")?;
        if n == 0 {
            anyhow::bail!("channel closed before end of control line");
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_LEN {
            anyhow::bail!("control line exceeds {} bytes", MAX_LINE_LEN);
        }
    }
    String::from_utf8(line).context("control line is not valid UTF-8")
}

/// [`read_line`] bounded by `patience`.
pub async fn read_line_timeout<R>(reader: &mut R, patience: Duration) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(patience, read_line(reader))
        .await
        .map_err(|_| anyhow!("timed out after {:?} waiting for control line", patience))?
}

/// Writes `payload` plus the terminating newline and flushes.
pub async fn write_line<W>(writer: &mut W, payload: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(payload.as_bytes())
        .await
        .context("control-line write failed")?;
    writer
        .write_all(b"\n")
        .await
        .context("control-line write failed")?;
    writer.flush().await.context("control-line flush failed")?;
    Ok(())
}

pub fn parse_decimal(line: &str) -> Result<u64> {
    line.trim()
        .parse()
        .with_context(|| format!("expected a decimal byte count, got {:?}", line))
}

/// Parses the `"n1,n2"` received-byte report for streams 1 and 2.
pub fn parse_count_pair(line: &str) -> Result<(u64, u64)> {
    let (first, second) = line
        .split_once(',')
        .with_context(|| format!("expected \"n1,n2\", got {:?}", line))?;
    Ok((parse_decimal(first)?, parse_decimal(second)?))
}

pub fn format_count_pair(n1: u64, n2: u64) -> String {
    format!("{},{}", n1, n2)
}

/// Parses a finack line into the stream index it acknowledges.
pub fn parse_finack(line: &str) -> Result<usize> {
    match line.trim() {
        "1" => Ok(1),
        "2" => Ok(2),
        other => anyhow::bail!("unexpected finack {:?}", other),
    }
}
