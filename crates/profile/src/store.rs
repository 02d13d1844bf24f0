//! Profile document store.
//!
//! One JSON document per profile under `profiles/`, keyed by `profile_id`.
//! Documents are written whole (profiles are immutable after research apart
//! from manual edits) and loaded with a migration shim for the legacy
//! single `world_tier` field.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::model::{NarrativeProfile, PowerGradient, format_tier, parse_tier};
use crate::{ProfileError, Result};

pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, profile_id: &str) -> PathBuf {
        self.dir.join(format!("{profile_id}.json"))
    }

    /// Persist a profile. Incomplete profiles are rejected; a profile either
    /// exists whole or not at all.
    pub fn save(&self, profile: &NarrativeProfile) -> Result<()> {
        profile.validate_complete()?;
        let raw = serde_json::to_string_pretty(profile)
            .map_err(|e| ProfileError::Corrupt(e.to_string()))?;
        fs::write(self.path_for(&profile.id), raw)?;
        info!(profile_id = %profile.id, "profile saved");
        Ok(())
    }

    pub fn load(&self, profile_id: &str) -> Result<NarrativeProfile> {
        let path = self.path_for(profile_id);
        if !path.exists() {
            return Err(ProfileError::NotFound(profile_id.to_string()));
        }
        let raw = fs::read_to_string(&path)?;
        let mut value: Value =
            serde_json::from_str(&raw).map_err(|e| ProfileError::Corrupt(e.to_string()))?;

        migrate_world_tier(&mut value);

        serde_json::from_value(value).map_err(|e| ProfileError::Corrupt(e.to_string()))
    }

    pub fn exists(&self, profile_id: &str) -> bool {
        self.path_for(profile_id).exists()
    }

    pub fn delete(&self, profile_id: &str) -> Result<()> {
        let path = self.path_for(profile_id);
        if !path.exists() {
            return Err(ProfileError::NotFound(profile_id.to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load_all(&self) -> Result<Vec<NarrativeProfile>> {
        let mut profiles = Vec::new();
        for id in self.list_ids()? {
            match self.load(&id) {
                Ok(profile) => profiles.push(profile),
                Err(err) => warn!(profile_id = %id, error = %err, "skipping unloadable profile"),
            }
        }
        Ok(profiles)
    }
}

/// Older persisted profiles carried a single `world_tier` instead of the
/// stratified `power_distribution`. Synthesize one on load and flag the
/// profile for review: peak = typical = world_tier, floor two tiers weaker,
/// gradient compressed.
fn migrate_world_tier(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    if obj.contains_key("power_distribution") {
        return;
    }
    let Some(world_tier) = obj.get("world_tier").and_then(|v| v.as_str()).map(String::from)
    else {
        return;
    };
    let Some(number) = parse_tier(&world_tier) else {
        return;
    };

    let floor = format_tier(number.saturating_add(2));
    let tier = format_tier(number);
    warn!(%world_tier, "migrating legacy world_tier to power_distribution");
    obj.insert(
        "power_distribution".to_string(),
        serde_json::json!({
            "peak_tier": tier,
            "typical_tier": tier,
            "floor_tier": floor,
            "gradient": serde_json::to_value(PowerGradient::Compressed).expect("enum serializes"),
        }),
    );
    obj.insert("needs_review".to_string(), Value::Bool(true));
    obj.remove("world_tier");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample_profile;

    #[test]
    fn save_load_round_trip_is_lossless() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ProfileStore::open(dir.path())?;
        let profile = sample_profile("frieren_beyond_journeys_end");

        store.save(&profile)?;
        let loaded = store.load("frieren_beyond_journeys_end")?;

        assert_eq!(loaded.id, profile.id);
        assert_eq!(loaded.dna_scales, profile.dna_scales);
        assert_eq!(loaded.power_distribution, profile.power_distribution);
        assert_eq!(loaded.storytelling_tropes, profile.storytelling_tropes);
        assert_eq!(loaded.pacing_style, profile.pacing_style);
        assert_eq!(loaded.composition, profile.composition);
        Ok(())
    }

    #[test]
    fn incomplete_profile_is_rejected_and_not_persisted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ProfileStore::open(dir.path())?;
        let mut profile = sample_profile("broken");
        profile.power_system.name.clear();

        assert!(store.save(&profile).is_err());
        assert!(!store.exists("broken"));
        Ok(())
    }

    #[test]
    fn missing_profile_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ProfileStore::open(dir.path())?;
        assert!(matches!(
            store.load("absent"),
            Err(ProfileError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn legacy_world_tier_is_migrated_on_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ProfileStore::open(dir.path())?;

        // Build a legacy document: current shape minus power_distribution,
        // plus the old single world_tier.
        let profile = sample_profile("legacy_series");
        let mut value = serde_json::to_value(&profile)?;
        let obj = value.as_object_mut().unwrap();
        obj.remove("power_distribution");
        obj.insert("world_tier".to_string(), serde_json::json!("T6"));
        fs::write(
            dir.path().join("legacy_series.json"),
            serde_json::to_string_pretty(&value)?,
        )?;

        let loaded = store.load("legacy_series")?;
        assert_eq!(loaded.power_distribution.peak_tier, "T6");
        assert_eq!(loaded.power_distribution.typical_tier, "T6");
        assert_eq!(loaded.power_distribution.floor_tier, "T8");
        assert_eq!(loaded.power_distribution.gradient, PowerGradient::Compressed);
        assert!(loaded.needs_review);
        Ok(())
    }

    #[test]
    fn delete_removes_document() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ProfileStore::open(dir.path())?;
        let profile = sample_profile("to_delete");
        store.save(&profile)?;

        store.delete("to_delete")?;
        assert!(!store.exists("to_delete"));
        assert!(store.delete("to_delete").is_err());
        Ok(())
    }

    #[test]
    fn list_ids_returns_sorted_slugs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ProfileStore::open(dir.path())?;
        store.save(&sample_profile("zeta_series"))?;
        store.save(&sample_profile("alpha_series"))?;

        assert_eq!(store.list_ids()?, vec!["alpha_series", "zeta_series"]);
        Ok(())
    }
}
