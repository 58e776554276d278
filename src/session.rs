use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;
use uuid::Uuid;

/// Opaque anonymous player identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Created once at startup and handed to every component that needs to know
/// which player it is acting for.
#[derive(Clone, Debug)]
pub struct SessionContext {
    player_id: PlayerId,
    started_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self::for_player(PlayerId::new(format!("player_{}", &simple[..12])))
    }

    pub fn for_player(player_id: PlayerId) -> Self {
        Self {
            player_id,
            started_at: Utc::now(),
        }
    }

    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Per-request idempotency key, sent with every mutating call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActionToken(Uuid);

impl ActionToken {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
