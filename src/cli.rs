use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sshim")]
#[command(about = "Transparent resume of remote-command sessions over a breaking transport")]
#[command(version)]
pub struct Cli {
    /// Transport client, its options, the destination host, and the
    /// remote command: `sshim ssh [ssh-options] host command [args...]`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Internal: run on the remote side of the transport
    #[arg(long, hide = true)]
    pub remote: bool,

    /// Internal: reconnect epoch of this remote-proxy incarnation
    #[arg(long = "try", hide = true, default_value_t = 0)]
    pub epoch: u64,

    /// Internal: socket directory of an already-bootstrapped session
    #[arg(long, hide = true)]
    pub sockdir: Option<PathBuf>,

    /// Internal: run as the detached session daemon
    #[arg(long, hide = true)]
    pub daemon: bool,

    /// Handshake timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}
