use super::*;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_minimal_boundary() {
    let parsed = TransportCommand::parse(&args(&["ssh", "host", "cat"])).unwrap();
    assert_eq!(parsed.program(), "ssh");
    assert_eq!(parsed.command(), &args(&["cat"]));
}

#[test]
fn test_value_options_consume_next_argument() {
    let parsed = TransportCommand::parse(&args(&[
        "ssh", "-p", "2222", "-i", "key", "host", "tar", "xf", "-",
    ]))
    .unwrap();
    assert_eq!(parsed.command(), &args(&["tar", "xf", "-"]));
}

#[test]
fn test_inline_option_values() {
    let parsed = TransportCommand::parse(&args(&["ssh", "-p2222", "host", "cat"])).unwrap();
    assert_eq!(parsed.command(), &args(&["cat"]));
}

#[test]
fn test_clustered_flags() {
    let parsed = TransportCommand::parse(&args(&["ssh", "-4A", "host", "cat"])).unwrap();
    assert_eq!(parsed.command(), &args(&["cat"]));
}

#[test]
fn test_cluster_ending_in_value_option() {
    let parsed =
        TransportCommand::parse(&args(&["ssh", "-Ap", "2222", "host", "cat"])).unwrap();
    assert_eq!(parsed.command(), &args(&["cat"]));
}

#[test]
fn test_unknown_letters_are_tolerated() {
    let parsed = TransportCommand::parse(&args(&["ssh", "-Z", "host", "cat"])).unwrap();
    assert_eq!(parsed.command(), &args(&["cat"]));
}

#[test]
fn test_o_options_are_absorbed() {
    let parsed = TransportCommand::parse(&args(&[
        "ssh",
        "-o",
        "BatchMode=yes",
        "-oStrictHostKeyChecking=no",
        "host",
        "cat",
    ]))
    .unwrap();
    assert_eq!(
        parsed.absorbed_options(),
        &[
            ("BatchMode".to_string(), "yes".to_string()),
            ("StrictHostKeyChecking".to_string(), "no".to_string()),
        ]
    );
    assert_eq!(parsed.command(), &args(&["cat"]));
}

#[test]
fn test_missing_host_fails() {
    assert!(TransportCommand::parse(&args(&["ssh", "-p", "2222"])).is_err());
}

#[test]
fn test_missing_command_fails() {
    assert!(TransportCommand::parse(&args(&["ssh", "host"])).is_err());
}

#[test]
fn test_dangling_value_option_fails() {
    assert!(TransportCommand::parse(&args(&["ssh", "-p"])).is_err());
}

#[test]
fn test_remote_argv_splices_before_command() {
    let parsed =
        TransportCommand::parse(&args(&["ssh", "-p", "2222", "host", "wc", "-c"])).unwrap();

    let first = parsed.remote_argv("sshim", 1, 10, None);
    assert_eq!(
        first,
        args(&[
            "-p", "2222", "host", "sshim", "--remote", "--try=1", "--timeout=10", "wc", "-c",
        ])
    );

    // Epoch is replaced and the sockdir spliced in on later spawns.
    let later = parsed.remote_argv("sshim", 4, 10, Some("/tmp/sshim-ab12"));
    assert_eq!(
        later,
        args(&[
            "-p",
            "2222",
            "host",
            "sshim",
            "--remote",
            "--try=4",
            "--timeout=10",
            "--sockdir=/tmp/sshim-ab12",
            "wc",
            "-c",
        ])
    );
}
