use crate::{
    cache::SnapshotCache,
    config::SyncConfig,
    error::Result,
    merge::{
        Field,
        FieldClock,
        Seq,
        SnapshotPatch,
    },
    remote::{
        ClickReceipt,
        GameServer,
        UpgradeReceipt,
    },
    session::{
        ActionToken,
        SessionContext,
    },
    snapshot::{
        PlayerSnapshot,
        SaveData,
        character_tier,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use std::{
    collections::{
        BTreeSet,
        HashMap,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::sync::{
    mpsc,
    watch,
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SaveStatus {
    #[default]
    Idle,
    Saving,
    Saved,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Transient message for the UI; it should stop showing it after `expires_at`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub level: NoticeLevel,
    pub expires_at: DateTime<Utc>,
}

impl Notification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOrigin {
    Cache,
    Server,
}

/// What the UI renders: the committed snapshot with pending optimistic
/// clicks folded in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerView {
    pub snapshot: PlayerSnapshot,
    pub origin: SnapshotOrigin,
    /// Fields known to be out of date until the next fetch lands.
    pub stale: Vec<Field>,
    pub pending_actions: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Fetch,
    Click,
    Upgrade,
    Advance,
    Save,
    Import,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ActionPhase {
    #[default]
    Idle,
    Pending,
    Committed,
    RolledBack,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoSnapshot,
    InsufficientEnergy { energy: u32, required: u32 },
    InsufficientPoints { points: u64, cost: u64 },
    UpgradeCostStale,
    /// An advancement landed and its follow-up fetch has not confirmed it.
    TierStale,
    AlreadyInFlight(ActionKind),
    CannotAdvance,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    Committed,
    /// A local guard refused the action; nothing was sent.
    Skipped(SkipReason),
}

#[derive(Clone, Debug)]
struct PendingClick {
    seq: Seq,
    points: u64,
    energy: u32,
}

struct ControllerState {
    committed: Option<PlayerSnapshot>,
    origin: SnapshotOrigin,
    clock: FieldClock,
    last_seq: Seq,
    pending_clicks: Vec<PendingClick>,
    stale: BTreeSet<Field>,
    in_flight: HashMap<Seq, ActionKind>,
    phases: HashMap<ActionKind, ActionPhase>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            committed: None,
            origin: SnapshotOrigin::Cache,
            clock: FieldClock::new(),
            last_seq: 0,
            pending_clicks: Vec::new(),
            stale: BTreeSet::new(),
            in_flight: HashMap::new(),
            phases: HashMap::new(),
        }
    }

    fn begin(&mut self, kind: ActionKind) -> Seq {
        self.last_seq += 1;
        let seq = self.last_seq;
        self.in_flight.insert(seq, kind);
        self.phases.insert(kind, ActionPhase::Pending);
        seq
    }

    fn finish(&mut self, seq: Seq, phase: ActionPhase) {
        if let Some(kind) = self.in_flight.remove(&seq) {
            self.phases.insert(kind, phase);
        }
    }

    fn is_in_flight(&self, kind: ActionKind) -> bool {
        self.in_flight.values().any(|k| *k == kind)
    }

    fn display(&self) -> Option<PlayerSnapshot> {
        let mut snapshot = self.committed.clone()?;
        if !self.pending_clicks.is_empty() {
            let gained: u64 = self.pending_clicks.iter().map(|p| p.points).sum();
            let spent: u32 = self.pending_clicks.iter().map(|p| p.energy).sum();
            snapshot.set_points(snapshot.points.saturating_add(gained));
            snapshot.energy = snapshot.energy.saturating_sub(spent);
            snapshot.derive_can_advance();
        }
        Some(snapshot)
    }

    fn view(&self) -> Option<PlayerView> {
        Some(PlayerView {
            snapshot: self.display()?,
            origin: self.origin,
            stale: self.stale.iter().copied().collect(),
            pending_actions: self.in_flight.len(),
        })
    }

    /// Merges an authoritative fetch sent with `seq`.
    fn ingest_fetch(&mut self, seq: Seq, snapshot: PlayerSnapshot) {
        let patch = SnapshotPatch::full(&snapshot);
        let written = match self.committed.as_mut() {
            Some(committed) => patch.apply(committed, &mut self.clock, seq),
            None => {
                let mut first = snapshot;
                let written = patch.apply(&mut first, &mut self.clock, seq);
                self.committed = Some(first);
                written
            }
        };
        // Clicks sent before this fetch are already counted in it.
        if written.contains(&Field::Points) || written.contains(&Field::Energy) {
            self.pending_clicks.retain(|p| p.seq > seq);
        }
        for field in written {
            self.stale.remove(&field);
        }
        self.origin = SnapshotOrigin::Server;
    }

    /// Everything known before `seq` is superseded but not yet refetched.
    fn invalidate(&mut self, seq: Seq) {
        self.clock.reset_all(seq);
        self.pending_clicks.clear();
        self.stale = Field::ALL.into_iter().collect();
    }
}

struct Shared<S, C> {
    session: SessionContext,
    server: S,
    cache: C,
    click_cost: u32,
    notification_ttl: Duration,
    state: Mutex<ControllerState>,
    view_tx: watch::Sender<Option<PlayerView>>,
    status_tx: watch::Sender<SaveStatus>,
    notice_tx: mpsc::UnboundedSender<Notification>,
}

/// Rolls back a fetch whose future is dropped before the response lands.
struct FetchInFlight<'a, S: GameServer, C: SnapshotCache + 'static> {
    controller: &'a SyncController<S, C>,
    seq: Seq,
    landed: bool,
}

impl<S: GameServer, C: SnapshotCache + 'static> Drop for FetchInFlight<'_, S, C> {
    fn drop(&mut self) {
        if self.landed {
            return;
        }
        debug!(seq = self.seq, "snapshot fetch abandoned");
        self.controller
            .state()
            .finish(self.seq, ActionPhase::RolledBack);
        self.controller.publish();
    }
}

/// Sole writer of the player snapshot. Cheap to clone; clones share state.
pub struct SyncController<S, C> {
    shared: Arc<Shared<S, C>>,
}

impl<S, C> Clone for SyncController<S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: GameServer, C: SnapshotCache + 'static> SyncController<S, C> {
    /// Returns the controller and the receiving end of its notification
    /// channel.
    pub fn new(
        session: SessionContext,
        server: S,
        cache: C,
        config: &SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (view_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(SaveStatus::Idle);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            session,
            server,
            cache,
            click_cost: config.click_cost,
            notification_ttl: config.notification_ttl,
            state: Mutex::new(ControllerState::new()),
            view_tx,
            status_tx,
            notice_tx,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            notice_rx,
        )
    }

    pub fn session(&self) -> &SessionContext {
        &self.shared.session
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PlayerView>> {
        self.shared.view_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn current_view(&self) -> Option<PlayerView> {
        self.state().view()
    }

    pub fn current_snapshot(&self) -> Option<PlayerSnapshot> {
        self.state().display()
    }

    pub fn save_status(&self) -> SaveStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn action_phase(&self, kind: ActionKind) -> ActionPhase {
        self.state().phases.get(&kind).copied().unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self) {
        let view = self.state().view();
        self.shared.view_tx.send_replace(view);
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let ttl = chrono::Duration::from_std(self.shared.notification_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(3));
        let notification = Notification {
            message: message.into(),
            level,
            expires_at: Utc::now() + ttl,
        };
        let _ = self.shared.notice_tx.send(notification);
    }

    fn set_status(&self, status: SaveStatus) {
        self.shared.status_tx.send_replace(status);
    }

    fn mirror_to_cache(&self) {
        let committed = self.state().committed.clone();
        if let Some(snapshot) = committed {
            self.shared
                .cache
                .put(self.shared.session.player_id(), &snapshot);
        }
    }

    /// Shows the cached snapshot (if any) right away, then performs the first
    /// authoritative fetch.
    pub async fn bootstrap(&self) -> Result<()> {
        let player = self.shared.session.player_id();
        if let Some(entry) = self.shared.cache.get(player) {
            let adopted = {
                let mut state = self.state();
                if state.committed.is_none() {
                    state.committed = Some(entry.snapshot);
                    state.origin = SnapshotOrigin::Cache;
                    true
                } else {
                    false
                }
            };
            if adopted {
                info!(%player, cached_at = %entry.cached_at, "showing cached snapshot");
                self.publish();
            }
        }
        self.refresh().await
    }

    /// Full authoritative fetch, merged field by field.
    pub async fn refresh(&self) -> Result<()> {
        let seq = self.state().begin(ActionKind::Fetch);
        let mut in_flight = FetchInFlight {
            controller: self,
            seq,
            landed: false,
        };
        let player = self.shared.session.player_id();
        let fetched = self.shared.server.fetch_state(player).await;
        in_flight.landed = true;
        match fetched {
            Ok(snapshot) => {
                {
                    let mut state = self.state();
                    state.ingest_fetch(seq, snapshot);
                    state.finish(seq, ActionPhase::Committed);
                }
                self.mirror_to_cache();
                self.publish();
                Ok(())
            }
            Err(err) => {
                self.state().finish(seq, ActionPhase::RolledBack);
                warn!(%player, %err, seq, "snapshot fetch failed");
                self.publish();
                Err(err)
            }
        }
    }

    pub async fn click(&self) -> Result<ActionOutcome> {
        let click_cost = self.shared.click_cost;
        let seq = {
            let mut state = self.state();
            let Some(display) = state.display() else {
                return Ok(ActionOutcome::Skipped(SkipReason::NoSnapshot));
            };
            if display.energy < click_cost {
                return Ok(ActionOutcome::Skipped(SkipReason::InsufficientEnergy {
                    energy: display.energy,
                    required: click_cost,
                }));
            }
            let seq = state.begin(ActionKind::Click);
            state.pending_clicks.push(PendingClick {
                seq,
                points: display.points_per_click,
                energy: click_cost,
            });
            seq
        };
        self.publish();

        let player = self.shared.session.player_id();
        let result = self.shared.server.click(player, ActionToken::fresh()).await;
        let outcome = {
            let mut state = self.state();
            state.pending_clicks.retain(|p| p.seq != seq);
            match result {
                Ok(ClickReceipt {
                    new_points,
                    new_points_formatted,
                    new_energy,
                    ..
                }) => {
                    let ControllerState {
                        committed, clock, ..
                    } = &mut *state;
                    if let Some(committed) = committed.as_mut() {
                        SnapshotPatch {
                            energy: Some(new_energy),
                            ..SnapshotPatch::default()
                        }
                        .with_points(new_points, new_points_formatted)
                        .apply(committed, clock, seq);
                    }
                    state.finish(seq, ActionPhase::Committed);
                    Ok(ActionOutcome::Committed)
                }
                Err(err) => {
                    state.finish(seq, ActionPhase::RolledBack);
                    Err(err)
                }
            }
        };
        self.publish();
        if let Err(err) = &outcome {
            warn!(%player, %err, seq, "click rolled back");
            self.notify(NoticeLevel::Error, err.user_message());
        }
        outcome
    }

    /// Buys the next upgrade tier, then refetches to learn the new cost.
    pub async fn upgrade(&self) -> Result<ActionOutcome> {
        let (seq, current_level) = {
            let mut state = self.state();
            let Some(display) = state.display() else {
                return Ok(ActionOutcome::Skipped(SkipReason::NoSnapshot));
            };
            if state.is_in_flight(ActionKind::Upgrade) {
                return Ok(ActionOutcome::Skipped(SkipReason::AlreadyInFlight(
                    ActionKind::Upgrade,
                )));
            }
            if state.stale.contains(&Field::NextUpgradeCost) {
                return Ok(ActionOutcome::Skipped(SkipReason::UpgradeCostStale));
            }
            if !display.can_afford_upgrade() {
                return Ok(ActionOutcome::Skipped(SkipReason::InsufficientPoints {
                    points: display.points,
                    cost: display.next_upgrade_cost,
                }));
            }
            (state.begin(ActionKind::Upgrade), display.upgrade_level)
        };
        self.publish();

        let player = self.shared.session.player_id();
        let result = self
            .shared
            .server
            .upgrade(player, current_level, ActionToken::fresh())
            .await;
        match result {
            Ok(UpgradeReceipt {
                new_points,
                new_points_formatted,
                new_upgrade_level,
                new_points_per_click,
            }) => {
                {
                    let mut state = self.state();
                    let ControllerState {
                        committed,
                        clock,
                        stale,
                        ..
                    } = &mut *state;
                    if let Some(committed) = committed.as_mut() {
                        SnapshotPatch {
                            upgrade_level: Some(new_upgrade_level),
                            points_per_click: Some(new_points_per_click),
                            ..SnapshotPatch::default()
                        }
                        .with_points(new_points, new_points_formatted)
                        .apply(committed, clock, seq);
                    }
                    // Older fetches must not clear the stale cost.
                    clock.admit(Field::NextUpgradeCost, seq);
                    stale.insert(Field::NextUpgradeCost);
                    state.finish(seq, ActionPhase::Committed);
                }
                self.publish();
                info!(%player, new_upgrade_level, "upgrade committed");
                self.notify(
                    NoticeLevel::Success,
                    format!("Upgrade purchased! Now level {new_upgrade_level}"),
                );
                if let Err(err) = self.refresh().await {
                    warn!(%player, %err, "follow-up fetch after upgrade failed");
                }
                Ok(ActionOutcome::Committed)
            }
            Err(err) => {
                self.state().finish(seq, ActionPhase::RolledBack);
                self.publish();
                warn!(%player, %err, seq, "upgrade rejected");
                self.notify(NoticeLevel::Error, err.user_message());
                Err(err)
            }
        }
    }

    /// Promotes the character one tier. Irreversible; the new tier is shown
    /// as stale until the follow-up fetch confirms it.
    pub async fn advance(&self) -> Result<ActionOutcome> {
        let (seq, next_tier) = {
            let mut state = self.state();
            let Some(display) = state.display() else {
                return Ok(ActionOutcome::Skipped(SkipReason::NoSnapshot));
            };
            if state.is_in_flight(ActionKind::Advance) {
                return Ok(ActionOutcome::Skipped(SkipReason::AlreadyInFlight(
                    ActionKind::Advance,
                )));
            }
            if state.stale.contains(&Field::Character) {
                return Ok(ActionOutcome::Skipped(SkipReason::TierStale));
            }
            let next_tier = character_tier(display.character_level.saturating_add(1));
            let (true, Some(next_tier)) = (display.can_advance, next_tier) else {
                return Ok(ActionOutcome::Skipped(SkipReason::CannotAdvance));
            };
            (state.begin(ActionKind::Advance), next_tier)
        };
        self.publish();

        let player = self.shared.session.player_id();
        match self.shared.server.advance(player, ActionToken::fresh()).await {
            Ok(()) => {
                {
                    let mut state = self.state();
                    let ControllerState {
                        committed,
                        clock,
                        stale,
                        pending_clicks,
                        ..
                    } = &mut *state;
                    if let Some(committed) = committed.as_mut() {
                        SnapshotPatch::advanced_to(next_tier).apply(committed, clock, seq);
                    }
                    pending_clicks.retain(|p| p.seq > seq);
                    // Held until a newer fetch confirms the new tier.
                    stale.extend([Field::Character, Field::Points, Field::UpgradeLevel]);
                    state.finish(seq, ActionPhase::Committed);
                }
                self.publish();
                info!(%player, tier = next_tier.name, "character advanced");
                self.notify(
                    NoticeLevel::Success,
                    format!("Advanced to {}!", next_tier.name),
                );
                if let Err(err) = self.refresh().await {
                    warn!(%player, %err, "follow-up fetch after advancement failed");
                }
                Ok(ActionOutcome::Committed)
            }
            Err(err) => {
                self.state().finish(seq, ActionPhase::RolledBack);
                self.publish();
                warn!(%player, %err, seq, "advancement rejected");
                self.notify(NoticeLevel::Error, err.user_message());
                Err(err)
            }
        }
    }

    pub async fn save(&self) -> Result<ActionOutcome> {
        let seq = self.state().begin(ActionKind::Save);
        self.set_status(SaveStatus::Saving);

        let player = self.shared.session.player_id();
        match self.shared.server.save(player, ActionToken::fresh()).await {
            Ok(receipt) => {
                {
                    let mut state = self.state();
                    let ControllerState {
                        committed, clock, ..
                    } = &mut *state;
                    if let (Some(committed), Some(saved_at)) =
                        (committed.as_mut(), receipt.save_time)
                    {
                        SnapshotPatch {
                            saved_at: Some(saved_at),
                            ..SnapshotPatch::default()
                        }
                        .apply(committed, clock, seq);
                    }
                    state.finish(seq, ActionPhase::Committed);
                }
                self.set_status(SaveStatus::Saved);
                self.notify(
                    NoticeLevel::Success,
                    receipt
                        .message
                        .unwrap_or_else(|| "Game saved successfully".to_string()),
                );
                if let Err(err) = self.refresh().await {
                    warn!(%player, %err, "follow-up fetch after save failed");
                }
                Ok(ActionOutcome::Committed)
            }
            Err(err) => {
                self.state().finish(seq, ActionPhase::RolledBack);
                self.set_status(SaveStatus::Error);
                warn!(%player, %err, "manual save failed");
                self.notify(NoticeLevel::Error, err.user_message());
                Err(err)
            }
        }
    }

    /// Fresh server export rendered as text. Touches no state.
    pub async fn export(&self) -> Result<String> {
        let player = self.shared.session.player_id();
        let result = match self.shared.server.export(player).await {
            Ok(bundle) => bundle.save_data.to_pretty_json(),
            Err(err) => Err(err),
        };
        match &result {
            Ok(_) => self.notify(NoticeLevel::Success, "Save data exported"),
            Err(err) => {
                warn!(%player, %err, "export failed");
                self.notify(NoticeLevel::Error, err.user_message());
            }
        }
        result
    }

    /// Imports user-supplied save text. Nothing is applied optimistically; on
    /// success every field is stale until the follow-up fetch lands.
    pub async fn import(&self, text: &str) -> Result<ActionOutcome> {
        let save = match SaveData::parse(text) {
            Ok(save) => save,
            Err(err) => {
                debug!(%err, "import payload rejected locally");
                self.notify(NoticeLevel::Error, err.to_string());
                return Err(err);
            }
        };

        let seq = self.state().begin(ActionKind::Import);
        let player = self.shared.session.player_id();
        let imported = self
            .shared
            .server
            .import(player, &save, ActionToken::fresh())
            .await;

        match imported {
            Ok(()) => {
                {
                    let mut state = self.state();
                    state.invalidate(seq);
                    state.finish(seq, ActionPhase::Committed);
                }
                self.publish();
                info!(%player, "save data imported");
                self.notify(NoticeLevel::Success, "Save data imported successfully");
                if let Err(err) = self.refresh().await {
                    warn!(%player, %err, "follow-up fetch after import failed");
                }
                Ok(ActionOutcome::Committed)
            }
            Err(err) => {
                self.state().finish(seq, ActionPhase::RolledBack);
                self.publish();
                warn!(%player, %err, "import failed");
                self.notify(NoticeLevel::Error, err.user_message());
                Err(err)
            }
        }
    }
}
