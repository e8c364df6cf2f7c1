use std::time::Duration;

use super::*;

fn parse(args: &[&str]) -> StartArgs {
    let argv = std::iter::once("corral").chain(args.iter().copied());
    match Cli::try_parse_from(argv).unwrap().command {
        Commands::Start(args) => args,
        other => panic!("expected start, got {:?}", other),
    }
}

#[test]
fn start_defaults() {
    let args = parse(&["start"]);
    let options = worker_options(&args).unwrap();
    assert_eq!(options.config, None);
    assert_eq!(options.logger.level, 2);
    assert!(!options.logger.show_time);
    assert_eq!(options.daemon, DaemonConfig::default());
    assert!(!args.no_daemon);
}

#[test]
fn start_flags_map_to_options() {
    let args = parse(&[
        "start",
        "app.yml",
        "--log-level",
        "3",
        "--debug",
        "corral_loader::scope,corral::log",
        "--log-time",
        "--heartbeat-timeout",
        "100ms",
        "--auto-restart",
        "--port",
        "8080",
    ]);
    let options = worker_options(&args).unwrap();

    assert!(options.config.unwrap().ends_with("app.yml"));
    assert_eq!(options.logger.level, 3);
    assert_eq!(
        options.logger.debug,
        vec!["corral_loader::scope".to_string(), "corral::log".to_string()]
    );
    assert!(options.logger.show_time);
    assert_eq!(
        options.daemon.heartbeat_timeout,
        Some(Duration::from_millis(100))
    );
    assert!(options.daemon.auto_restart);
    assert_eq!(options.daemon.exec_argv, vec!["--port", "8080"]);
}

#[test]
fn negative_log_level_is_rejected() {
    let args = parse(&["start", "--log-level", "-1"]);
    assert!(matches!(
        worker_options(&args),
        Err(CliError::InvalidLogLevel(level)) if level == "-1"
    ));
}

#[test]
fn non_numeric_log_level_is_rejected() {
    let args = parse(&["start", "--log-level", "loud"]);
    assert!(matches!(
        worker_options(&args),
        Err(CliError::InvalidLogLevel(_))
    ));
}

#[test]
fn bare_heartbeat_timeout_is_milliseconds() {
    let args = parse(&["start", "--heartbeat-timeout", "1500"]);
    assert_eq!(
        worker_options(&args).unwrap().daemon.heartbeat_timeout,
        Some(Duration::from_millis(1500))
    );
}

#[test]
fn bad_heartbeat_timeout_is_rejected() {
    let args = parse(&["start", "--heartbeat-timeout", "soon"]);
    assert!(matches!(
        worker_options(&args),
        Err(CliError::InvalidDuration(_))
    ));
}

#[test]
fn worker_subcommand_is_hidden_but_parses() {
    let cli = Cli::try_parse_from(["corral", "worker", "--port", "8080"]).unwrap();
    match cli.command {
        Commands::Worker { args } => assert_eq!(args, vec!["--port", "8080"]),
        other => panic!("expected worker, got {:?}", other),
    }
}
