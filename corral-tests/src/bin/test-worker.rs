//! Scriptable worker used by supervisor tests.
//!
//! Speaks the worker side of the supervisor protocol and then ends the way
//! its `TEST_WORKER_*` environment asks.

use std::time::Duration;

use anyhow::Context;
use corral_protocol::channel::WorkerChannel;
use corral_protocol::protocol::{DaemonConfig, WorkerMessage};
use corral_protocol::shared::SharedData;
use corral_tests::helpers::worker_behaviour::{SPAWNS_KEY, WorkerBehaviour};
use serde_json::Value;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let behaviour = WorkerBehaviour::from_env()?;
    let channel = WorkerChannel::from_env().context("not started by a supervisor")?;

    let mut shared = SharedData::from_env();
    let spawns = shared.get(SPAWNS_KEY).and_then(Value::as_u64).unwrap_or(0) + 1;
    shared.insert(SPAWNS_KEY, Value::from(spawns));

    if !behaviour.skip_start {
        channel
            .send(&WorkerMessage::Start {
                config: DaemonConfig::default(),
            })
            .await?;
    }
    // Hand the counter back up front so a killed worker still counts
    channel
        .send_and_flush(&WorkerMessage::Shared {
            body: shared.to_json(),
        })
        .await?;

    if let Some(interval) = behaviour.heartbeat {
        let channel = channel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if channel.send(&WorkerMessage::Heartbeat).await.is_err() {
                    break;
                }
            }
        });
    }

    if spawns <= behaviour.hang_spawns {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(behaviour.linger).await;

    if behaviour.max_spawns.is_some_and(|max| spawns >= max) {
        std::process::exit(0);
    }
    if let Some(signal) = behaviour.signal {
        nix::sys::signal::raise(signal)?;
        // Give the default disposition a moment to take effect
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    std::process::exit(behaviour.exit_code)
}
