//! Transport-client argument handling.
//!
//! The local proxy is handed `[transport, options..., host, command...]`
//! verbatim. To splice the shim invocation in front of the remote command
//! it has to find where the transport options and destination end — which
//! means knowing the transport's short-option surface well enough to skip
//! values. The tables below cover the standard OpenSSH-style client;
//! unknown letters are tolerated as value-less flags.

use anyhow::{Context, Result};

/// Short options that consume a value (inline or as the next argument).
const VALUE_OPTS: &[char] = &[
    'b', 'c', 'e', 'i', 'l', 'm', 'o', 'p', 'w', 'D', 'E', 'F', 'I', 'J', 'L', 'O', 'Q', 'R',
    'S', 'W',
];

/// Short options that take no value and may be clustered.
const FLAG_OPTS: &[char] = &[
    'a', 'f', 'g', 'k', 'n', 'q', 's', 't', 'v', 'x', 'y', 'A', 'C', 'G', 'K', 'M', 'N', 'T',
    'V', 'X', 'Y', '1', '2', '4', '6',
];

/// A parsed transport invocation: the client program, everything up to and
/// including the destination host, and the remote command.
#[derive(Debug, Clone)]
pub struct TransportCommand {
    program: String,
    /// Options and destination, in original order.
    prefix: Vec<String>,
    /// `-o key=value` options observed while locating the boundary.
    absorbed: Vec<(String, String)>,
    /// The user command and its arguments.
    command: Vec<String>,
}

impl TransportCommand {
    /// Splits a raw argument vector at the options+host / command
    /// boundary.
    pub fn parse(args: &[String]) -> Result<Self> {
        let program = args
            .first()
            .cloned()
            .context("missing transport client name")?;
        let mut prefix = Vec::new();
        let mut absorbed = Vec::new();
        let mut command = Vec::new();
        let mut host = None;

        let mut i = 1;
        while i < args.len() {
            let arg = &args[i];
            if arg.starts_with('-') && arg.len() > 1 {
                prefix.push(arg.clone());
                let letters: Vec<char> = arg.chars().skip(1).collect();
                for (pos, &letter) in letters.iter().enumerate() {
                    if !VALUE_OPTS.contains(&letter) {
                        // Value-less, possibly clustered; unknown letters
                        // are treated the same way.
                        continue;
                    }
                    let inline: String = letters[pos + 1..].iter().collect();
                    let value = if !inline.is_empty() {
                        inline
                    } else {
                        i += 1;
                        let next = args.get(i).with_context(|| {
                            format!("transport option -{} expects a value", letter)
                        })?;
                        prefix.push(next.clone());
                        next.clone()
                    };
                    if letter == 'o' {
                        let (key, val) = match value.split_once('=') {
                            Some((key, val)) => (key.to_string(), val.to_string()),
                            None => (value.clone(), String::new()),
                        };
                        absorbed.push((key, val));
                    }
                    break;
                }
            } else {
                host = Some(arg.clone());
                prefix.push(arg.clone());
                command.extend(args[i + 1..].iter().cloned());
                break;
            }
            i += 1;
        }

        if host.is_none() {
            anyhow::bail!("no destination host found in transport arguments");
        }
        if command.is_empty() {
            anyhow::bail!("no remote command given");
        }

        Ok(Self {
            program,
            prefix,
            absorbed,
            command,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// `-o` options seen before the host, for diagnostics.
    pub fn absorbed_options(&self) -> &[(String, String)] {
        &self.absorbed
    }

    /// Builds the argument vector for one (re)spawn of the transport
    /// client: options and host first, then the shim invocation spliced in
    /// front of the user command. `--try` is replaced on every call;
    /// `--sockdir` appears once the bootstrap has announced it.
    pub fn remote_argv(
        &self,
        remote_program: &str,
        epoch: u64,
        timeout_secs: u64,
        sockdir: Option<&str>,
    ) -> Vec<String> {
        let mut argv = self.prefix.clone();
        argv.push(remote_program.to_string());
        argv.push("--remote".to_string());
        argv.push(format!("--try={}", epoch));
        argv.push(format!("--timeout={}", timeout_secs));
        if let Some(dir) = sockdir {
            argv.push(format!("--sockdir={}", dir));
        }
        argv.extend(self.command.iter().cloned());
        argv
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
