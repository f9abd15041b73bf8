mod cli;
mod config;
mod daemon;
mod debug_log;
mod local;
mod remote;
mod stream;
mod transport;
mod wire;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use config::ShimConfig;
use debug_log::debug_log;
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");
    let result = runtime.block_on(async_main(cli));
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn async_main(cli: Cli) -> Result<()> {
    // The remote roles cannot report a broken config file anywhere useful;
    // they fall back to defaults and note it in the debug log.
    let (config, config_err) = match ShimConfig::load_default() {
        Ok(config) => (config, None),
        Err(err) => (ShimConfig::default(), Some(err)),
    };
    debug_log::init(config.debug_log.clone());
    if let Some(err) = config_err {
        if cli.remote || cli.daemon {
            debug_log("config", &format!("falling back to defaults: {:#}", err));
        } else {
            return Err(err);
        }
    }

    let timeout = Duration::from_secs(cli.timeout.unwrap_or(config.handshake_timeout_secs));

    // Internal daemon mode: detached, owns the user command.
    if cli.daemon {
        let outcome = match cli.sockdir {
            Some(sockdir) => daemon::run(sockdir, timeout, cli.command).await,
            None => Err(anyhow::anyhow!("daemon mode requires --sockdir")),
        };
        return silent_exit("daemon", outcome);
    }

    // Internal remote-proxy mode: stdout/stderr carry session data, so
    // failures stay out of them.
    if cli.remote {
        let outcome = match cli.sockdir {
            Some(sockdir) => remote::run_resume(sockdir, cli.epoch, timeout).await,
            None => remote::run_bootstrap(cli.command, timeout).await,
        };
        return silent_exit("remote", outcome);
    }

    if cli.command.is_empty() {
        anyhow::bail!("usage: sshim <transport> [transport-options] <host> <command> [args...]");
    }
    local::run(cli.command, timeout, &config).await
}

/// Remote-side roles report failure only through the debug log and the
/// exit status; their standard streams belong to the session.
fn silent_exit(tag: &str, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(err) => {
            debug_log(tag, &format!("fatal: {:#}", err));
            std::process::exit(1);
        }
    }
}
