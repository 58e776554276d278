use crate::{
    cache::InMemoryCache,
    config::SyncConfig,
    controller::{
        Notification,
        SyncController,
    },
    error::{
        Result,
        SyncError,
    },
    remote::{
        ClickReceipt,
        ExportBundle,
        GameServer,
        SaveReceipt,
        UpgradeReceipt,
    },
    session::{
        ActionToken,
        PlayerId,
        SessionContext,
    },
    snapshot::{
        DEFAULT_CLICK_COST,
        ENERGY_REGEN_SECONDS_PER_POINT,
        MAX_CHARACTER_LEVEL,
        PlayerSnapshot,
        SaveData,
        character_tier,
        format_number,
        upgrade_cost,
    },
};
use chrono::{
    DateTime,
    TimeZone,
    Utc,
};
use serde_json::{
    Map,
    Value,
    json,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::sync::{
    mpsc,
    oneshot,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerOp {
    Fetch,
    Click,
    Upgrade,
    Advance,
    Save,
    Export,
    Import,
}

#[derive(Clone, Debug)]
pub struct PlayerRecord {
    pub points: u64,
    pub energy: u32,
    pub character_level: u8,
    pub upgrade_level: u32,
    pub last_save: DateTime<Utc>,
}

impl PlayerRecord {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            points: 0,
            energy: max_energy(1),
            character_level: 1,
            upgrade_level: 0,
            last_save: now,
        }
    }
}

fn max_energy(level: u8) -> u32 {
    character_tier(level).map(|t| t.max_energy).unwrap_or(100)
}

fn multiplier(level: u8) -> u64 {
    character_tier(level).map(|t| t.multiplier).unwrap_or(1)
}

/// Whole points earned per click at the given upgrade level and tier.
pub fn points_per_click(upgrade_level: u32, character_level: u8) -> u64 {
    let base = if upgrade_level == 0 {
        1.0
    } else {
        (0..upgrade_level)
            .map(|i| upgrade_cost(i) as f64 * 0.1)
            .sum::<f64>()
    };
    (base * multiplier(character_level) as f64).floor() as u64
}

struct Inner {
    now: DateTime<Utc>,
    players: HashMap<PlayerId, PlayerRecord>,
    calls: HashMap<ServerOp, usize>,
    failures: HashMap<ServerOp, VecDeque<SyncError>>,
    held: HashMap<ServerOp, oneshot::Receiver<()>>,
    tokens: Vec<ActionToken>,
}

/// In-memory game server following the real server's rules, with a frozen
/// clock so energy only changes through clicks and test setters.
#[derive(Clone)]
pub struct FakeGameServer {
    inner: Arc<Mutex<Inner>>,
}

/// Releases a response held by [`FakeGameServer::hold_next`].
pub struct ResponseGate {
    release: oneshot::Sender<()>,
}

impl ResponseGate {
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

impl Default for FakeGameServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGameServer {
    pub fn new() -> Self {
        let inner = Inner {
            now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            players: HashMap::new(),
            calls: HashMap::new(),
            failures: HashMap::new(),
            held: HashMap::new(),
            tokens: Vec::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn calls(&self, op: ServerOp) -> usize {
        self.inner.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.inner.lock().unwrap().calls.values().sum()
    }

    /// Idempotency keys seen on mutating calls, in arrival order.
    pub fn tokens(&self) -> Vec<ActionToken> {
        self.inner.lock().unwrap().tokens.clone()
    }

    /// The next call of `op` fails with `err` without touching server state.
    pub fn fail_next(&self, op: ServerOp, err: SyncError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// The next fetch or click is served immediately but its response does
    /// not return until the gate is released.
    pub fn hold_next(&self, op: ServerOp) -> ResponseGate {
        let (release, held) = oneshot::channel();
        self.inner.lock().unwrap().held.insert(op, held);
        ResponseGate { release }
    }

    async fn respond<T>(&self, op: ServerOp, response: T) -> T {
        let held = self.inner.lock().unwrap().held.remove(&op);
        if let Some(held) = held {
            let _ = held.await;
        }
        response
    }

    pub fn advance_clock(&self, by: chrono::Duration) {
        self.inner.lock().unwrap().now += by;
    }

    pub fn player(&self, id: &PlayerId) -> Option<PlayerRecord> {
        self.inner.lock().unwrap().players.get(id).cloned()
    }

    /// Creates or edits the record for `id`.
    pub fn update_player(&self, id: &PlayerId, edit: impl FnOnce(&mut PlayerRecord)) {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.now;
        let record = inner
            .players
            .entry(id.clone())
            .or_insert_with(|| PlayerRecord::fresh(now));
        edit(record);
    }

    pub fn set_energy(&self, id: &PlayerId, energy: u32) {
        self.update_player(id, |record| record.energy = energy);
    }

    pub fn set_points(&self, id: &PlayerId, points: u64) {
        self.update_player(id, |record| record.points = points);
    }

    /// Counts the call and pops an injected failure, if any.
    fn begin(&self, op: ServerOp, token: Option<ActionToken>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        *inner.calls.entry(op).or_default() += 1;
        if let Some(token) = token {
            inner.tokens.push(token);
        }
        match inner.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_player<T>(
        &self,
        id: &PlayerId,
        f: impl FnOnce(&mut PlayerRecord, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.now;
        let record = inner
            .players
            .entry(id.clone())
            .or_insert_with(|| PlayerRecord::fresh(now));
        f(record, now)
    }
}

pub fn snapshot_of(id: &PlayerId, record: &PlayerRecord) -> PlayerSnapshot {
    let level = record.character_level;
    let max = max_energy(level);
    let next_cost = upgrade_cost(record.upgrade_level);
    let advancement_cost = character_tier(level).and_then(|t| t.advancement_cost);
    PlayerSnapshot {
        identity: id.clone(),
        points: record.points,
        points_formatted: format_number(record.points),
        points_per_click: points_per_click(record.upgrade_level, level),
        energy: record.energy,
        max_energy: max,
        upgrade_level: record.upgrade_level,
        next_upgrade_cost: next_cost,
        next_upgrade_cost_formatted: format_number(next_cost),
        character_level: level,
        character_name: character_tier(level)
            .map(|t| t.name.to_string())
            .unwrap_or_default(),
        character_multiplier: multiplier(level),
        advancement_cost,
        advancement_cost_formatted: advancement_cost.map(format_number),
        can_advance: level < MAX_CHARACTER_LEVEL
            && advancement_cost.is_some_and(|cost| record.points >= cost),
        energy_regen_seconds: u64::from(max.saturating_sub(record.energy))
            * ENERGY_REGEN_SECONDS_PER_POINT,
        saved_at: record.last_save,
    }
}

fn bad_request(detail: &str) -> SyncError {
    SyncError::server(400, detail)
}

impl GameServer for FakeGameServer {
    async fn fetch_state(&self, player: &PlayerId) -> Result<PlayerSnapshot> {
        self.begin(ServerOp::Fetch, None)?;
        let snapshot = self.with_player(player, |record, _| Ok(snapshot_of(player, record)))?;
        Ok(self.respond(ServerOp::Fetch, snapshot).await)
    }

    async fn click(&self, player: &PlayerId, token: ActionToken) -> Result<ClickReceipt> {
        self.begin(ServerOp::Click, Some(token))?;
        let receipt = self.with_player(player, |record, _| {
            if record.energy < DEFAULT_CLICK_COST {
                return Err(bad_request("Not enough energy"));
            }
            let earned = points_per_click(record.upgrade_level, record.character_level);
            record.energy -= DEFAULT_CLICK_COST;
            record.points += earned;
            Ok(ClickReceipt {
                new_points: record.points,
                new_points_formatted: Some(format_number(record.points)),
                new_energy: record.energy,
                points_earned: Some(earned),
            })
        })?;
        Ok(self.respond(ServerOp::Click, receipt).await)
    }

    async fn upgrade(
        &self,
        player: &PlayerId,
        current_upgrade_level: u32,
        token: ActionToken,
    ) -> Result<UpgradeReceipt> {
        self.begin(ServerOp::Upgrade, Some(token))?;
        self.with_player(player, |record, _| {
            if record.upgrade_level != current_upgrade_level {
                return Err(bad_request("Upgrade level mismatch"));
            }
            let cost = upgrade_cost(record.upgrade_level);
            if record.points < cost {
                return Err(bad_request("Not enough points"));
            }
            record.points -= cost;
            record.upgrade_level += 1;
            Ok(UpgradeReceipt {
                new_points: record.points,
                new_points_formatted: Some(format_number(record.points)),
                new_upgrade_level: record.upgrade_level,
                new_points_per_click: points_per_click(
                    record.upgrade_level,
                    record.character_level,
                ),
            })
        })
    }

    async fn advance(&self, player: &PlayerId, token: ActionToken) -> Result<()> {
        self.begin(ServerOp::Advance, Some(token))?;
        self.with_player(player, |record, _| {
            if !snapshot_of(player, record).can_advance {
                return Err(bad_request("Cannot advance character"));
            }
            record.character_level += 1;
            record.points = 0;
            record.upgrade_level = 0;
            record.energy = max_energy(record.character_level);
            Ok(())
        })
    }

    async fn save(&self, player: &PlayerId, token: ActionToken) -> Result<SaveReceipt> {
        self.begin(ServerOp::Save, Some(token))?;
        self.with_player(player, |record, now| {
            record.last_save = now;
            Ok(SaveReceipt {
                message: Some("Game saved successfully".to_string()),
                save_time: Some(now),
            })
        })
    }

    async fn export(&self, player: &PlayerId) -> Result<ExportBundle> {
        self.begin(ServerOp::Export, None)?;
        self.with_player(player, |record, now| {
            let save = json!({
                "player_id": player,
                "points": record.points,
                "energy": record.energy,
                "character_level": record.character_level,
                "upgrade_level": record.upgrade_level,
                "last_save": record.last_save.naive_utc().to_string(),
                "export_timestamp": now.naive_utc().to_string(),
                "game_version": "1.0",
            });
            let map = match save {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            Ok(ExportBundle {
                save_data: SaveData::from_map(map),
                export_time: Some(now.to_rfc3339()),
                character_name: character_tier(record.character_level)
                    .map(|t| t.name.to_string()),
                total_progress: Some(format_number(record.points)),
            })
        })
    }

    async fn import(
        &self,
        player: &PlayerId,
        save_data: &SaveData,
        token: ActionToken,
    ) -> Result<()> {
        self.begin(ServerOp::Import, Some(token))?;
        save_data.validate()?;
        let map = save_data.as_map();
        let whole = |key: &str| {
            map.get(key)
                .and_then(Value::as_f64)
                .map(|v| v.max(0.0).floor() as u64)
                .unwrap_or_default()
        };
        self.with_player(player, |record, now| {
            record.points = whole("points");
            record.energy = whole("energy") as u32;
            record.character_level = whole("character_level") as u8;
            record.upgrade_level = whole("upgrade_level") as u32;
            record.last_save = now;
            Ok(())
        })
    }
}

pub type TestController = SyncController<FakeGameServer, InMemoryCache>;

/// A controller for `player` wired to a fake server and an in-memory cache.
pub struct TestContext {
    pub server: FakeGameServer,
    pub cache: InMemoryCache,
    pub controller: TestController,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub player: PlayerId,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::with_parts(FakeGameServer::new(), InMemoryCache::new(), config)
    }

    pub fn with_parts(
        server: FakeGameServer,
        cache: InMemoryCache,
        config: SyncConfig,
    ) -> Self {
        let player = PlayerId::new("player_test00001");
        let session = SessionContext::for_player(player.clone());
        let (controller, notifications) =
            SyncController::new(session, server.clone(), cache.clone(), &config);
        Self {
            server,
            cache,
            controller,
            notifications,
            player,
        }
    }

    /// Drains every notification raised so far.
    pub fn notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            out.push(notification);
        }
        out
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
