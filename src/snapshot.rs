use crate::{
    error::{
        Result,
        SyncError,
    },
    session::PlayerId,
};
use chrono::{
    DateTime,
    NaiveDateTime,
    Utc,
};
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use serde_json::{
    Map,
    Value,
};

pub const DEFAULT_CLICK_COST: u32 = 2;
pub const ENERGY_REGEN_SECONDS_PER_POINT: u64 = 10;

/// One rung of the character ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CharacterTier {
    pub level: u8,
    pub name: &'static str,
    pub multiplier: u64,
    pub max_energy: u32,
    pub advancement_cost: Option<u64>,
}

pub const CHARACTER_LADDER: [CharacterTier; 5] = [
    CharacterTier {
        level: 1,
        name: "Junior",
        multiplier: 1,
        max_energy: 100,
        advancement_cost: Some(5_000),
    },
    CharacterTier {
        level: 2,
        name: "Deishi",
        multiplier: 2,
        max_energy: 150,
        advancement_cost: Some(5_000_000),
    },
    CharacterTier {
        level: 3,
        name: "Shugo",
        multiplier: 3,
        max_energy: 200,
        advancement_cost: Some(500_000_000),
    },
    CharacterTier {
        level: 4,
        name: "Seishi",
        multiplier: 5,
        max_energy: 250,
        advancement_cost: Some(50_000_000_000),
    },
    CharacterTier {
        level: 5,
        name: "Shihan",
        multiplier: 8,
        max_energy: 300,
        advancement_cost: None,
    },
];

pub const MAX_CHARACTER_LEVEL: u8 = 5;

pub fn character_tier(level: u8) -> Option<&'static CharacterTier> {
    CHARACTER_LADDER.iter().find(|tier| tier.level == level)
}

/// Compact display form: plain below a thousand, then one decimal with a
/// K/M/B/T suffix.
pub fn format_number(value: u64) -> String {
    const SUFFIXES: [(u64, &str); 4] = [
        (1_000_000_000_000, "T"),
        (1_000_000_000, "B"),
        (1_000_000, "M"),
        (1_000, "K"),
    ];
    for (scale, suffix) in SUFFIXES {
        if value >= scale {
            return format!("{:.1}{}", value as f64 / scale as f64, suffix);
        }
    }
    value.to_string()
}

pub fn upgrade_cost(upgrade_level: u32) -> u64 {
    if upgrade_level == 0 {
        return 100;
    }
    (100.0 * 2.5f64.powi(upgrade_level as i32)).floor() as u64
}

/// The player's state as the server (or the local cache) last described it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    #[serde(rename = "player_id")]
    pub identity: PlayerId,
    #[serde(with = "whole_number")]
    pub points: u64,
    pub points_formatted: String,
    #[serde(with = "whole_number")]
    pub points_per_click: u64,
    pub energy: u32,
    pub max_energy: u32,
    pub upgrade_level: u32,
    #[serde(with = "whole_number")]
    pub next_upgrade_cost: u64,
    pub next_upgrade_cost_formatted: String,
    pub character_level: u8,
    pub character_name: String,
    pub character_multiplier: u64,
    #[serde(default, with = "optional_whole_number")]
    pub advancement_cost: Option<u64>,
    #[serde(default)]
    pub advancement_cost_formatted: Option<String>,
    pub can_advance: bool,
    #[serde(default)]
    pub energy_regen_seconds: u64,
    #[serde(rename = "last_save", with = "timestamp")]
    pub saved_at: DateTime<Utc>,
}

impl PlayerSnapshot {
    /// Sets points together with their display string.
    pub fn set_points(&mut self, points: u64) {
        self.points = points;
        self.points_formatted = format_number(points);
    }

    /// Recomputes `can_advance` from points, tier and advancement cost.
    pub fn derive_can_advance(&mut self) {
        self.can_advance = self.character_level < MAX_CHARACTER_LEVEL
            && self
                .advancement_cost
                .is_some_and(|cost| self.points >= cost);
    }

    pub fn energy_is_full(&self) -> bool {
        self.energy >= self.max_energy
    }

    pub fn can_afford_upgrade(&self) -> bool {
        self.points >= self.next_upgrade_cost
    }
}

/// Export/import payload. Kept as the raw JSON object so an exported save
/// re-imports byte for byte.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaveData(Map<String, Value>);

const REQUIRED_SAVE_FIELDS: [&str; 4] =
    ["points", "energy", "character_level", "upgrade_level"];

impl SaveData {
    /// Parses user-supplied text. Accepts either the bare save object or a
    /// full export bundle carrying it under `save_data`.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text.trim()).map_err(|e| {
            SyncError::Validation(format!("Invalid save data: not valid JSON ({e})"))
        })?;
        let Value::Object(mut object) = value else {
            return Err(SyncError::Validation(
                "Invalid save data: expected a JSON object".to_string(),
            ));
        };
        if let Some(Value::Object(inner)) = object.remove("save_data") {
            object = inner;
        }
        let save = SaveData(object);
        save.validate()?;
        Ok(save)
    }

    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = REQUIRED_SAVE_FIELDS
            .iter()
            .copied()
            .filter(|field| !self.0.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::Validation(format!(
                "Invalid save data: missing fields {missing:?}"
            )));
        }

        let level = self.number("character_level")?;
        let tier = (level.fract() == 0.0 && level >= 1.0)
            .then(|| character_tier(level as u8))
            .flatten()
            .ok_or_else(|| SyncError::Validation("Invalid character level".to_string()))?;

        let energy = self.number("energy")?;
        if energy < 0.0 || energy > f64::from(tier.max_energy) {
            return Err(SyncError::Validation("Invalid energy value".to_string()));
        }
        if self.number("points")? < 0.0 || self.number("upgrade_level")? < 0.0 {
            return Err(SyncError::Validation(
                "Invalid points or upgrade level".to_string(),
            ));
        }
        Ok(())
    }

    fn number(&self, field: &str) -> Result<f64> {
        self.0
            .get(field)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "Invalid save data: field '{field}' must be a number"
                ))
            })
    }

    pub fn points(&self) -> Option<f64> {
        self.0.get("points").and_then(Value::as_f64)
    }

    pub fn character_level(&self) -> Option<u64> {
        self.0.get("character_level").and_then(Value::as_u64)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        SaveData(map)
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.0)?)
    }
}

/// Server counters may arrive as floats (fractional per-click yields); the
/// client tracks whole points.
mod whole_number {
    use super::*;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let number = serde_json::Number::deserialize(deserializer)?;
        to_whole(&number).ok_or_else(|| {
            serde::de::Error::custom(format!("expected a non-negative number, got {number}"))
        })
    }

    pub(super) fn to_whole(number: &serde_json::Number) -> Option<u64> {
        if let Some(value) = number.as_u64() {
            return Some(value);
        }
        number
            .as_f64()
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value.floor() as u64)
    }
}

mod optional_whole_number {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(value),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        let number = Option::<serde_json::Number>::deserialize(deserializer)?;
        number
            .map(|number| {
                whole_number::to_whole(&number).ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "expected a non-negative number, got {number}"
                    ))
                })
            })
            .transpose()
    }
}

/// RFC 3339 on the way out; on the way in also accepts the server's naive
/// ISO timestamps, which are UTC.
mod timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp '{raw}': {e}"))
    }
}

pub(crate) use timestamp::parse as parse_timestamp;

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    fn server_payload() -> Value {
        serde_json::json!({
            "player_id": "player_abc",
            "points": 6250.5,
            "points_formatted": "6.2K",
            "energy": 40,
            "max_energy": 100,
            "character_level": 1,
            "character_name": "Junior",
            "character_multiplier": 1,
            "upgrade_level": 2,
            "points_per_click": 35.0,
            "next_upgrade_cost": 625,
            "next_upgrade_cost_formatted": "625",
            "advancement_cost": 5000,
            "advancement_cost_formatted": "5.0K",
            "can_advance": true,
            "energy_regen_seconds": 600,
            "last_save": "2024-03-01T10:15:30.123456",
            "last_save_formatted": "2024-03-01 10:15:30 UTC"
        })
    }

    #[test]
    fn format_number__matches_suffix_boundaries() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1.0K");
        assert_eq!(format_number(2_500), "2.5K");
        assert_eq!(format_number(5_000_000), "5.0M");
        assert_eq!(format_number(1_200_000_000), "1.2B");
        assert_eq!(format_number(50_000_000_000_000), "50.0T");
    }

    #[test]
    fn upgrade_cost__follows_two_and_a_half_times_progression() {
        assert_eq!(upgrade_cost(0), 100);
        assert_eq!(upgrade_cost(1), 250);
        assert_eq!(upgrade_cost(2), 625);
        assert_eq!(upgrade_cost(3), 1562);
    }

    #[test]
    fn player_snapshot__decodes_server_payload_with_fractional_points() {
        // when
        let snapshot: PlayerSnapshot = serde_json::from_value(server_payload()).unwrap();

        // then
        assert_eq!(snapshot.points, 6250);
        assert_eq!(snapshot.points_per_click, 35);
        assert_eq!(snapshot.advancement_cost, Some(5000));
        assert_eq!(
            snapshot.saved_at.to_rfc3339(),
            "2024-03-01T10:15:30.123456+00:00"
        );
    }

    #[test]
    fn player_snapshot__survives_encoding_through_its_own_format() {
        // given
        let snapshot: PlayerSnapshot = serde_json::from_value(server_payload()).unwrap();

        // when
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: PlayerSnapshot = serde_json::from_str(&encoded).unwrap();

        // then
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn set_points__keeps_formatted_string_in_step() {
        // given
        let mut snapshot: PlayerSnapshot =
            serde_json::from_value(server_payload()).unwrap();

        // when
        snapshot.set_points(12_345);

        // then
        assert_eq!(snapshot.points_formatted, "12.3K");
    }

    #[test]
    fn save_data_parse__reports_missing_required_fields() {
        // when
        let err = SaveData::parse(r#"{"points": 10, "energy": 5}"#).unwrap_err();

        // then
        assert_eq!(
            err,
            SyncError::Validation(
                "Invalid save data: missing fields [\"character_level\", \"upgrade_level\"]"
                    .to_string()
            )
        );
    }

    #[test]
    fn save_data_parse__rejects_text_that_is_not_json() {
        let err = SaveData::parse("definitely not a save").unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn save_data_parse__rejects_energy_above_tier_maximum() {
        let err = SaveData::parse(
            r#"{"points": 1, "energy": 101, "character_level": 1, "upgrade_level": 0}"#,
        )
        .unwrap_err();
        assert_eq!(err, SyncError::Validation("Invalid energy value".to_string()));
    }

    #[test]
    fn save_data_parse__rejects_unknown_character_level() {
        let err = SaveData::parse(
            r#"{"points": 1, "energy": 10, "character_level": 6, "upgrade_level": 0}"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SyncError::Validation("Invalid character level".to_string())
        );
    }

    #[test]
    fn save_data_parse__unwraps_full_export_bundle() {
        // given
        let text = r#"{
            "success": true,
            "save_data": {"points": 7, "energy": 3, "character_level": 2, "upgrade_level": 1}
        }"#;

        // when
        let save = SaveData::parse(text).unwrap();

        // then
        assert_eq!(save.points(), Some(7.0));
        assert_eq!(save.character_level(), Some(2));
    }

    #[test]
    fn derive_can_advance__follows_points_and_tier() {
        // given
        let mut snapshot: PlayerSnapshot = serde_json::from_value(server_payload()).unwrap();

        // when
        snapshot.set_points(4_999);
        snapshot.derive_can_advance();

        // then
        assert!(!snapshot.can_advance);

        snapshot.set_points(5_000);
        snapshot.derive_can_advance();
        assert!(snapshot.can_advance);

        snapshot.character_level = MAX_CHARACTER_LEVEL;
        snapshot.derive_can_advance();
        assert!(!snapshot.can_advance);
    }
}
