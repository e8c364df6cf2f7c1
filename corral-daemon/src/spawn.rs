//! Worker process launch.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use corral_protocol::channel::MessageReader;
use corral_protocol::pipe::{pipe_cloexec, remove_cloexec_raw};
use corral_protocol::protocol::{ENV_IPC_FD, ENV_LOADER_OPTIONS, ENV_SHARED};
use corral_protocol::shared::SharedData;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::errors::{Result, SupervisorError};

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    /// Arguments placed before `exec_argv`
    pub args: Vec<String>,
    pub exec_argv: Vec<String>,
    /// Serialized worker options
    pub loader_options: String,
    /// Extra variables for the worker's environment
    pub env: Vec<(String, String)>,
}

impl WorkerSpec {
    /// Run the current executable's `worker` subcommand.
    pub fn current_exe(exec_argv: Vec<String>, loader_options: String) -> Result<Self> {
        let program = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;
        Ok(Self {
            program,
            args: vec!["worker".to_string()],
            exec_argv,
            loader_options,
            env: Vec::new(),
        })
    }

    /// Full argument list after the program.
    pub fn argv(&self) -> Vec<String> {
        self.args.iter().chain(&self.exec_argv).cloned().collect()
    }

    /// Build the command for one spawn. `ipc_fd` is the write end the worker
    /// inherits.
    pub fn command(&self, shared: &SharedData, ipc_fd: &OwnedFd) -> Command {
        let raw_fd = ipc_fd.as_raw_fd();
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENV_SHARED, shared.to_json())
            .env(ENV_LOADER_OPTIONS, &self.loader_options)
            .env(ENV_IPC_FD, raw_fd.to_string())
            .kill_on_drop(true);

        // SAFETY: only an fcntl on a descriptor the parent keeps open until
        // the spawn returns; async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                remove_cloexec_raw(raw_fd).map_err(std::io::Error::from)
            });
        }
        cmd
    }
}

/// A launched worker and the read end of its pipe.
pub struct SpawnedWorker {
    pub child: Child,
    pub reader: MessageReader,
}

/// Launch a worker with `shared` injected into its environment.
pub fn spawn_worker(spec: &WorkerSpec, shared: &SharedData) -> Result<SpawnedWorker> {
    let (read_fd, write_fd) = pipe_cloexec().map_err(SupervisorError::Pipe)?;

    let child = spec
        .command(shared, &write_fd)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
    debug!(
        "Spawned worker {:?} (pid {:?}) with args {:?}",
        spec.program,
        child.id(),
        spec.argv()
    );

    // Only the worker may hold the write end, so EOF means it is gone
    drop(write_fd);
    let reader = MessageReader::from_fd(read_fd)?;
    Ok(SpawnedWorker { child, reader })
}
