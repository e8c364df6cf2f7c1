use tokio::sync::{mpsc, oneshot};

use crate::config::Entry;
use crate::errors::{LoaderError, Result};
use crate::scope::ScopeId;

/// Capacity of the loader command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Requests the engine accepts from plugins and the worker runtime.
#[derive(Debug)]
pub enum LoaderCommand {
    /// Hand shared state to the supervisor and exit with `code`
    FullReload { code: i32 },
    /// Re-read the config store and reconcile
    Reload,
    /// Entry ids rooted at a scope
    Paths {
        scope: ScopeId,
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Snapshot of the declared entry list
    Entries { reply: oneshot::Sender<Vec<Entry>> },
}

/// Clone-able handle to a running [`Loader`](super::Loader), provided to
/// plugins as the `loader` service.
#[derive(Clone, Debug)]
pub struct LoaderHandle {
    tx: mpsc::Sender<LoaderCommand>,
}

impl LoaderHandle {
    pub(crate) fn new(tx: mpsc::Sender<LoaderCommand>) -> Self {
        Self { tx }
    }

    async fn send(&self, cmd: LoaderCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| LoaderError::LoaderClosed)
    }

    /// Restart the whole worker, carrying shared state forward.
    pub async fn full_reload(&self, code: i32) -> Result<()> {
        self.send(LoaderCommand::FullReload { code }).await
    }

    /// Non-blocking variant of [`full_reload`](Self::full_reload) for use
    /// inside synchronous plugin callbacks.
    pub fn request_full_reload(&self, code: i32) -> Result<()> {
        self.tx
            .try_send(LoaderCommand::FullReload { code })
            .map_err(|_| LoaderError::LoaderClosed)
    }

    /// Re-read the config and reconcile.
    pub async fn reload(&self) -> Result<()> {
        self.send(LoaderCommand::Reload).await
    }

    pub async fn paths(&self, scope: ScopeId) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(LoaderCommand::Paths { scope, reply }).await?;
        rx.await.map_err(|_| LoaderError::LoaderClosed)
    }

    pub async fn entries(&self) -> Result<Vec<Entry>> {
        let (reply, rx) = oneshot::channel();
        self.send(LoaderCommand::Entries { reply }).await?;
        rx.await.map_err(|_| LoaderError::LoaderClosed)
    }
}
