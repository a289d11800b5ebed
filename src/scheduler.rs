//! Optional thread-based background scheduler, gated behind the `native-scheduler` feature.
//!
//! The core itself never requires an async runtime — every operation in
//! [`crate::context`] is synchronous and callable from whatever scheduling
//! an embedder already has. This module exists purely as a convenience for
//! embedders that don't: it runs packing, GC, idle-forced snapshots, a
//! full repoll, and terminal-move-record purging on their documented
//! cadences on a dedicated background thread.

use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::runtime::Builder;
use tokio::time::{self, Duration as TokioDuration};

use crate::context::CoreContext;
use crate::ids::SdUuid;

/// A running background scheduler for one [`CoreContext`] and one
/// registered [`SdUuid`]. Dropping or calling [`Self::stop`] ends the
/// background thread.
pub struct Scheduler {
    shutdown: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Start background pack/GC/repoll cadences for `sd` on a dedicated
    /// thread running a single-threaded Tokio runtime.
    pub fn start(context: CoreContext, sd: SdUuid) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("scribe-core-scheduler".into())
            .spawn(move || {
                let runtime = Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("building the scheduler's Tokio runtime");
                runtime.block_on(Self::run(context, sd, shutdown_rx));
            })
            .expect("spawning the scheduler thread");

        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Signal the background thread to stop and wait for it to exit.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    async fn run(context: CoreContext, sd: SdUuid, shutdown_rx: mpsc::Receiver<()>) {
        let config = context.config_snapshot();
        let mut pack_tick = time::interval(to_tokio(config.pack_interval));
        let mut gc_tick = time::interval(to_tokio(config.gc_interval));
        let mut repoll_tick = time::interval(to_tokio(config.poll_full_repoll_interval));
        // Idle-forced snapshots only need to be checked as often as packing
        // does, since both are driven off the same update cadence.
        let mut snapshot_tick = time::interval(to_tokio(config.pack_interval));
        let mut move_purge_tick = time::interval(to_tokio(config.move_purge_interval));

        loop {
            if shutdown_rx.try_recv().is_ok() {
                return;
            }
            tokio::select! {
                _ = pack_tick.tick() => {
                    log::debug!("scheduler: packing updates for {sd}");
                    match context.pack_updates(sd) {
                        Ok(n) => log::debug!("scheduler: packed {n} update(s) for {sd}"),
                        Err(e) => log::warn!("scheduler: pack pass failed for {sd}: {e}"),
                    }
                }
                _ = gc_tick.tick() => {
                    log::debug!("scheduler: running GC for {sd}");
                    if let Err(e) = context.run_gc(sd) {
                        log::warn!("scheduler: GC pass failed for {sd}: {e}");
                    }
                }
                _ = repoll_tick.tick() => {
                    if let Err(e) = context.wake_discovery(sd) {
                        log::warn!("scheduler: wake-discovery pass failed for {sd}: {e}");
                    }
                }
                _ = snapshot_tick.tick() => {
                    if let Err(e) = context.snapshot_maintenance(sd) {
                        log::warn!("scheduler: idle-snapshot sweep failed for {sd}: {e}");
                    }
                }
                _ = move_purge_tick.tick() => {
                    if let Err(e) = context.purge_old_moves() {
                        log::warn!("scheduler: move-retention purge failed: {e}");
                    }
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn to_tokio(d: std::time::Duration) -> TokioDuration {
    TokioDuration::from_millis(d.as_millis() as u64)
}
