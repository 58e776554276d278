use crate::{
    error::{
        Result,
        SyncError,
    },
    session::{
        ActionToken,
        PlayerId,
    },
    snapshot::{
        PlayerSnapshot,
        SaveData,
        parse_timestamp,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use reqwest::StatusCode;
use serde::{
    Deserialize,
    Serialize,
    de::{
        DeserializeOwned,
        IgnoredAny,
    },
};
use std::{
    fmt,
    future::Future,
};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClickReceipt {
    pub new_points: u64,
    pub new_points_formatted: Option<String>,
    pub new_energy: u32,
    pub points_earned: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeReceipt {
    pub new_points: u64,
    pub new_points_formatted: Option<String>,
    pub new_upgrade_level: u32,
    pub new_points_per_click: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveReceipt {
    pub message: Option<String>,
    pub save_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExportBundle {
    pub save_data: SaveData,
    pub export_time: Option<String>,
    pub character_name: Option<String>,
    pub total_progress: Option<String>,
}

/// The game server's operations. One round trip per call, no retries.
pub trait GameServer: Send + Sync + 'static {
    fn fetch_state(
        &self,
        player: &PlayerId,
    ) -> impl Future<Output = Result<PlayerSnapshot>> + Send;

    fn click(
        &self,
        player: &PlayerId,
        token: ActionToken,
    ) -> impl Future<Output = Result<ClickReceipt>> + Send;

    fn upgrade(
        &self,
        player: &PlayerId,
        current_upgrade_level: u32,
        token: ActionToken,
    ) -> impl Future<Output = Result<UpgradeReceipt>> + Send;

    fn advance(
        &self,
        player: &PlayerId,
        token: ActionToken,
    ) -> impl Future<Output = Result<()>> + Send;

    fn save(
        &self,
        player: &PlayerId,
        token: ActionToken,
    ) -> impl Future<Output = Result<SaveReceipt>> + Send;

    fn export(&self, player: &PlayerId) -> impl Future<Output = Result<ExportBundle>> + Send;

    fn import(
        &self,
        player: &PlayerId,
        save_data: &SaveData,
        token: ActionToken,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct HttpGameClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpGameClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, http })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Self::decode(res).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        token: ActionToken,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .http
            .post(url)
            .header(IDEMPOTENCY_HEADER, token.to_string())
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Self::decode(res).await
    }

    async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T> {
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| SyncError::Network(format!("failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(server_error(status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn server_error(status: StatusCode, body: &[u8]) -> SyncError {
    #[derive(Deserialize)]
    struct DetailDto {
        detail: serde_json::Value,
    }

    let detail = match serde_json::from_slice::<DetailDto>(body) {
        Ok(DetailDto {
            detail: serde_json::Value::String(text),
        }) => text,
        Ok(DetailDto { detail }) => detail.to_string(),
        Err(_) if body.is_empty() => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    };
    SyncError::server(status.as_u16(), detail)
}

impl GameServer for HttpGameClient {
    async fn fetch_state(&self, player: &PlayerId) -> Result<PlayerSnapshot> {
        self.get(&format!("/api/player/{player}")).await
    }

    async fn click(&self, player: &PlayerId, token: ActionToken) -> Result<ClickReceipt> {
        let dto: ClickResponseDto = self
            .post("/api/click", &PlayerRequestDto { player_id: player }, token)
            .await?;
        Ok(dto.into())
    }

    async fn upgrade(
        &self,
        player: &PlayerId,
        current_upgrade_level: u32,
        token: ActionToken,
    ) -> Result<UpgradeReceipt> {
        let body = UpgradeRequestDto {
            player_id: player,
            upgrade_level: current_upgrade_level,
        };
        let dto: UpgradeResponseDto = self.post("/api/upgrade", &body, token).await?;
        Ok(dto.into())
    }

    async fn advance(&self, player: &PlayerId, token: ActionToken) -> Result<()> {
        let _: IgnoredAny = self
            .post("/api/advance", &PlayerRequestDto { player_id: player }, token)
            .await?;
        Ok(())
    }

    async fn save(&self, player: &PlayerId, token: ActionToken) -> Result<SaveReceipt> {
        let dto: SaveResponseDto = self
            .post("/api/save", &PlayerRequestDto { player_id: player }, token)
            .await?;
        Ok(dto.into())
    }

    async fn export(&self, player: &PlayerId) -> Result<ExportBundle> {
        let dto: ExportResponseDto = self.get(&format!("/api/export/{player}")).await?;
        Ok(dto.into())
    }

    async fn import(
        &self,
        player: &PlayerId,
        save_data: &SaveData,
        token: ActionToken,
    ) -> Result<()> {
        save_data.validate()?;
        let body = ImportRequestDto {
            player_id: player,
            save_data,
        };
        let _: IgnoredAny = self.post("/api/import", &body, token).await?;
        Ok(())
    }
}

impl fmt::Display for HttpGameClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

#[derive(Serialize)]
struct PlayerRequestDto<'a> {
    player_id: &'a PlayerId,
}

#[derive(Serialize)]
struct UpgradeRequestDto<'a> {
    player_id: &'a PlayerId,
    upgrade_level: u32,
}

#[derive(Serialize)]
struct ImportRequestDto<'a> {
    player_id: &'a PlayerId,
    save_data: &'a SaveData,
}

#[derive(Deserialize)]
struct ClickResponseDto {
    new_points: serde_json::Number,
    #[serde(default)]
    new_points_formatted: Option<String>,
    new_energy: u32,
    #[serde(default)]
    points_earned: Option<serde_json::Number>,
}

#[derive(Deserialize)]
struct UpgradeResponseDto {
    new_points: serde_json::Number,
    #[serde(default)]
    new_points_formatted: Option<String>,
    new_upgrade_level: u32,
    new_points_per_click: serde_json::Number,
}

#[derive(Deserialize)]
struct SaveResponseDto {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    save_time: Option<String>,
}

#[derive(Deserialize)]
struct ExportResponseDto {
    save_data: SaveData,
    #[serde(default)]
    export_info: Option<ExportInfoDto>,
}

#[derive(Deserialize)]
struct ExportInfoDto {
    #[serde(default)]
    export_time: Option<String>,
    #[serde(default)]
    character_name: Option<String>,
    #[serde(default)]
    total_progress: Option<String>,
}

fn whole(number: &serde_json::Number) -> u64 {
    number
        .as_u64()
        .or_else(|| number.as_f64().map(|value| value.max(0.0).floor() as u64))
        .unwrap_or_default()
}

impl From<ClickResponseDto> for ClickReceipt {
    fn from(dto: ClickResponseDto) -> Self {
        ClickReceipt {
            new_points: whole(&dto.new_points),
            new_points_formatted: dto.new_points_formatted,
            new_energy: dto.new_energy,
            points_earned: dto.points_earned.as_ref().map(whole),
        }
    }
}

impl From<UpgradeResponseDto> for UpgradeReceipt {
    fn from(dto: UpgradeResponseDto) -> Self {
        UpgradeReceipt {
            new_points: whole(&dto.new_points),
            new_points_formatted: dto.new_points_formatted,
            new_upgrade_level: dto.new_upgrade_level,
            new_points_per_click: whole(&dto.new_points_per_click),
        }
    }
}

impl From<SaveResponseDto> for SaveReceipt {
    fn from(dto: SaveResponseDto) -> Self {
        SaveReceipt {
            message: dto.message,
            save_time: dto
                .save_time
                .as_deref()
                .and_then(|raw| parse_timestamp(raw).ok()),
        }
    }
}

impl From<ExportResponseDto> for ExportBundle {
    fn from(dto: ExportResponseDto) -> Self {
        let info = dto.export_info;
        ExportBundle {
            save_data: dto.save_data,
            export_time: info.as_ref().and_then(|i| i.export_time.clone()),
            character_name: info.as_ref().and_then(|i| i.character_name.clone()),
            total_progress: info.and_then(|i| i.total_progress),
        }
    }
}
