use crate::{
    cache::SnapshotCache,
    config::SyncConfig,
    controller::SyncController,
    remote::GameServer,
};
use std::time::Duration;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{
        self,
        Instant,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshGuard {
    Always,
    /// Only while the displayed energy is below its cap, or nothing is
    /// displayed yet.
    EnergyBelowMax,
}

/// One periodic refetch. The guard is checked each time the period elapses,
/// never at scheduling time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecurringRefresh {
    pub name: &'static str,
    pub period: Duration,
    pub guard: RefreshGuard,
}

impl RecurringRefresh {
    pub fn passive_income(period: Duration) -> Self {
        Self {
            name: "passive_income",
            period,
            guard: RefreshGuard::Always,
        }
    }

    pub fn energy_regen(period: Duration) -> Self {
        Self {
            name: "energy_regen",
            period,
            guard: RefreshGuard::EnergyBelowMax,
        }
    }

    fn should_fire<S: GameServer, C: SnapshotCache + 'static>(
        &self,
        controller: &SyncController<S, C>,
    ) -> bool {
        match self.guard {
            RefreshGuard::Always => true,
            RefreshGuard::EnergyBelowMax => controller
                .current_snapshot()
                .is_none_or(|snapshot| !snapshot.energy_is_full()),
        }
    }
}

/// Owns the recurring refresh tasks of one controller.
pub struct PollingScheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl PollingScheduler {
    /// Starts the passive-income and energy-regeneration refreshes. Must be
    /// called from within a tokio runtime.
    pub fn start<S, C>(controller: SyncController<S, C>, config: &SyncConfig) -> Self
    where
        S: GameServer,
        C: SnapshotCache + 'static,
    {
        Self::with_tasks(
            controller,
            [
                RecurringRefresh::passive_income(config.passive_income_period),
                RecurringRefresh::energy_regen(config.energy_regen_period),
            ],
        )
    }

    pub fn with_tasks<S, C>(
        controller: SyncController<S, C>,
        tasks: impl IntoIterator<Item = RecurringRefresh>,
    ) -> Self
    where
        S: GameServer,
        C: SnapshotCache + 'static,
    {
        let (shutdown_tx, _) = watch::channel(false);
        let handles = tasks
            .into_iter()
            .map(|task| {
                let name = task.name;
                info!(task = name, period = ?task.period, "starting recurring refresh");
                let handle = tokio::spawn(refresh_worker(
                    controller.clone(),
                    task,
                    shutdown_tx.subscribe(),
                ));
                (name, handle)
            })
            .collect();
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Stops every task and waits for them to finish. A refresh already in
    /// flight lands first; no refresh runs after this returns.
    pub async fn shutdown(mut self) {
        self.shutdown_tx.send_replace(true);
        for (name, handle) in self.handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(task = name, ?err, "recurring refresh ended abnormally");
            }
        }
        info!("polling scheduler stopped");
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}

async fn refresh_worker<S, C>(
    controller: SyncController<S, C>,
    task: RecurringRefresh,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: GameServer,
    C: SnapshotCache + 'static,
{
    let mut ticker = time::interval_at(Instant::now() + task.period, task.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                if !task.should_fire(&controller) {
                    debug!(task = task.name, "refresh not needed");
                    continue;
                }
                // Runs to completion; shutdown is observed on the next turn.
                if let Err(err) = controller.refresh().await {
                    warn!(task = task.name, %err, "scheduled refresh failed");
                }
            }
        }
    }
    debug!(task = task.name, "recurring refresh stopped");
}
