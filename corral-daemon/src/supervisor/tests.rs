use super::*;

fn shell(script: &str) -> WorkerSpec {
    WorkerSpec {
        program: "/bin/sh".into(),
        args: vec!["-c".to_string(), script.to_string()],
        exec_argv: vec![],
        loader_options: "{}".to_string(),
        env: vec![],
    }
}

#[tokio::test]
async fn startup_failure_propagates_exit_code() {
    let config = DaemonConfig {
        auto_restart: true,
        ..Default::default()
    };
    let mut supervisor = Supervisor::new(shell("exit 7"), config);
    let exit = supervisor.run().await.unwrap();
    assert_eq!(exit, WorkerExit::code(7));
    assert_eq!(supervisor.spawns(), 1);
}

#[tokio::test]
async fn worker_environment_is_injected() {
    let script = r#"
        [ -n "$CORRAL_IPC_FD" ] || exit 10
        [ "$CORRAL_LOADER_OPTIONS" = "{}" ] || exit 11
        case "$CORRAL_SHARED" in *startTime*) ;; *) exit 12 ;; esac
        [ "$EXTRA" = "1" ] || exit 13
        exit 0
    "#;
    let mut spec = shell(script);
    spec.env.push(("EXTRA".to_string(), "1".to_string()));
    let mut supervisor = Supervisor::new(spec, DaemonConfig::default());
    assert_eq!(supervisor.run().await.unwrap(), WorkerExit::code(0));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn ipc_descriptor_survives_exec() {
    let script = r#"[ -e "/proc/self/fd/$CORRAL_IPC_FD" ] || exit 20"#;
    let mut supervisor = Supervisor::new(shell(script), DaemonConfig::default());
    assert_eq!(supervisor.run().await.unwrap(), WorkerExit::code(0));
}

#[tokio::test]
async fn signal_exit_is_reported() {
    let mut supervisor = Supervisor::new(shell("kill -TERM $$"), DaemonConfig::default());
    let exit = supervisor.run().await.unwrap();
    assert_eq!(exit, WorkerExit::signal(Signal::SIGTERM));
}

#[tokio::test]
async fn exec_argv_follows_args() {
    let mut spec = shell(r#"[ "$0" = "first" ] && [ "$1" = "second" ] || exit 30"#);
    spec.exec_argv = vec!["first".to_string(), "second".to_string()];
    assert_eq!(spec.argv().len(), 4);
    let mut supervisor = Supervisor::new(spec, DaemonConfig::default());
    assert_eq!(supervisor.run().await.unwrap(), WorkerExit::code(0));
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let spec = WorkerSpec {
        program: "/nonexistent/corral-worker".into(),
        ..shell("")
    };
    let mut supervisor = Supervisor::new(spec, DaemonConfig::default());
    assert!(matches!(
        supervisor.run().await,
        Err(SupervisorError::Spawn { .. })
    ));
}
