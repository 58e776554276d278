//! Per-field last-writer-wins merging.
//!
//! Every request gets a sequence number when it is sent. A [`FieldClock`]
//! remembers, for each snapshot field, the sequence number of the request
//! whose value is currently applied. A write carrying a lower number than the
//! one on record is dropped for that field only; the rest of the patch still
//! lands.

use crate::snapshot::{
    CharacterTier,
    PlayerSnapshot,
    format_number,
    upgrade_cost,
};
use chrono::{
    DateTime,
    Utc,
};
use std::collections::HashMap;
use tracing::debug;

/// Monotonic request sequence number, assigned at send time.
pub type Seq = u64;

/// Mergeable snapshot fields. A numeric field and its formatted string share
/// one entry so they can never disagree. `can_advance` has no entry; it is
/// derived from the merged points and tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Points,
    PointsPerClick,
    Energy,
    MaxEnergy,
    UpgradeLevel,
    NextUpgradeCost,
    Character,
    AdvancementCost,
    EnergyRegen,
    SavedAt,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Points,
        Field::PointsPerClick,
        Field::Energy,
        Field::MaxEnergy,
        Field::UpgradeLevel,
        Field::NextUpgradeCost,
        Field::Character,
        Field::AdvancementCost,
        Field::EnergyRegen,
        Field::SavedAt,
    ];
}

#[derive(Clone, Debug, Default)]
pub struct FieldClock {
    applied: HashMap<Field, Seq>,
}

impl FieldClock {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn last_applied(&self, field: Field) -> Option<Seq> {
        self.applied.get(&field).copied()
    }

    /// Records the write and returns true unless a strictly newer request
    /// already wrote this field.
    pub fn admit(&mut self, field: Field, seq: Seq) -> bool {
        match self.applied.get(&field) {
            Some(&last) if last > seq => false,
            _ => {
                self.applied.insert(field, seq);
                true
            }
        }
    }

    /// Stamps every field with `seq`, used when an import supersedes
    /// everything known locally.
    pub fn reset_all(&mut self, seq: Seq) {
        self.applied.clear();
        for field in Field::ALL {
            self.applied.insert(field, seq);
        }
    }
}

/// Partial update to a [`PlayerSnapshot`]. Only `Some` fields are written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotPatch {
    pub points: Option<(u64, String)>,
    pub points_per_click: Option<u64>,
    pub energy: Option<u32>,
    pub max_energy: Option<u32>,
    pub upgrade_level: Option<u32>,
    pub next_upgrade_cost: Option<(u64, String)>,
    pub character: Option<(u8, String, u64)>,
    pub advancement_cost: Option<(Option<u64>, Option<String>)>,
    pub energy_regen_seconds: Option<u64>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl SnapshotPatch {
    /// A patch that carries every field of an authoritative snapshot.
    pub fn full(snapshot: &PlayerSnapshot) -> Self {
        Self {
            points: Some((snapshot.points, snapshot.points_formatted.clone())),
            points_per_click: Some(snapshot.points_per_click),
            energy: Some(snapshot.energy),
            max_energy: Some(snapshot.max_energy),
            upgrade_level: Some(snapshot.upgrade_level),
            next_upgrade_cost: Some((
                snapshot.next_upgrade_cost,
                snapshot.next_upgrade_cost_formatted.clone(),
            )),
            character: Some((
                snapshot.character_level,
                snapshot.character_name.clone(),
                snapshot.character_multiplier,
            )),
            advancement_cost: Some((
                snapshot.advancement_cost,
                snapshot.advancement_cost_formatted.clone(),
            )),
            energy_regen_seconds: Some(snapshot.energy_regen_seconds),
            saved_at: Some(snapshot.saved_at),
        }
    }

    /// Points with a server-provided display string; falls back to local
    /// formatting when the server sent none.
    pub fn with_points(mut self, points: u64, formatted: Option<String>) -> Self {
        let formatted = formatted.unwrap_or_else(|| format_number(points));
        self.points = Some((points, formatted));
        self
    }

    /// The server-side effect of advancing into `tier`: progress reset, full
    /// energy, the new tier's constants.
    pub fn advanced_to(tier: &CharacterTier) -> Self {
        let next_cost = upgrade_cost(0);
        Self {
            points: Some((0, format_number(0))),
            points_per_click: Some(tier.multiplier),
            energy: Some(tier.max_energy),
            max_energy: Some(tier.max_energy),
            upgrade_level: Some(0),
            next_upgrade_cost: Some((next_cost, format_number(next_cost))),
            character: Some((tier.level, tier.name.to_string(), tier.multiplier)),
            advancement_cost: Some((
                tier.advancement_cost,
                tier.advancement_cost.map(format_number),
            )),
            energy_regen_seconds: Some(0),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn fields(&self) -> Vec<Field> {
        let mut fields = Vec::new();
        let mut push = |present: bool, field| {
            if present {
                fields.push(field);
            }
        };
        push(self.points.is_some(), Field::Points);
        push(self.points_per_click.is_some(), Field::PointsPerClick);
        push(self.energy.is_some(), Field::Energy);
        push(self.max_energy.is_some(), Field::MaxEnergy);
        push(self.upgrade_level.is_some(), Field::UpgradeLevel);
        push(self.next_upgrade_cost.is_some(), Field::NextUpgradeCost);
        push(self.character.is_some(), Field::Character);
        push(self.advancement_cost.is_some(), Field::AdvancementCost);
        push(self.energy_regen_seconds.is_some(), Field::EnergyRegen);
        push(self.saved_at.is_some(), Field::SavedAt);
        fields
    }

    /// Applies the admitted fields of this patch and returns the ones that
    /// were written.
    pub fn apply(
        self,
        target: &mut PlayerSnapshot,
        clock: &mut FieldClock,
        seq: Seq,
    ) -> Vec<Field> {
        let mut written = Vec::new();
        let mut admit = |field: Field| {
            let ok = clock.admit(field, seq);
            if ok {
                written.push(field);
            } else {
                debug!(?field, seq, "discarding stale write");
            }
            ok
        };

        if let Some((points, formatted)) = self.points
            && admit(Field::Points)
        {
            target.points = points;
            target.points_formatted = formatted;
        }
        if let Some(value) = self.points_per_click
            && admit(Field::PointsPerClick)
        {
            target.points_per_click = value;
        }
        if let Some(value) = self.energy
            && admit(Field::Energy)
        {
            target.energy = value;
        }
        if let Some(value) = self.max_energy
            && admit(Field::MaxEnergy)
        {
            target.max_energy = value;
        }
        if let Some(value) = self.upgrade_level
            && admit(Field::UpgradeLevel)
        {
            target.upgrade_level = value;
        }
        if let Some((cost, formatted)) = self.next_upgrade_cost
            && admit(Field::NextUpgradeCost)
        {
            target.next_upgrade_cost = cost;
            target.next_upgrade_cost_formatted = formatted;
        }
        if let Some((level, name, multiplier)) = self.character
            && admit(Field::Character)
        {
            target.character_level = level;
            target.character_name = name;
            target.character_multiplier = multiplier;
        }
        if let Some((cost, formatted)) = self.advancement_cost
            && admit(Field::AdvancementCost)
        {
            target.advancement_cost = cost;
            target.advancement_cost_formatted = formatted;
        }
        if let Some(value) = self.energy_regen_seconds
            && admit(Field::EnergyRegen)
        {
            target.energy_regen_seconds = value;
        }
        if let Some(value) = self.saved_at
            && admit(Field::SavedAt)
        {
            target.saved_at = value;
        }

        // Merged energy may come from a different response than max_energy.
        target.energy = target.energy.min(target.max_energy);
        target.derive_can_advance();
        written
    }
}
