use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Per-agent model assignment. Agents not listed here fall back to the
/// `[llm]` section defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentModel {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Default provider for agents without an explicit assignment:
    /// `ollama` or `openai` (any OpenAI-compatible endpoint).
    pub provider: String,
    pub model: String,
    /// Cheap model used for latency-sensitive calls (intent classifier,
    /// director micro-check).
    pub fast_model: String,
    pub embedding_model: String,
    pub ollama_base_url: String,
    pub openai_base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3.1:8b".to_string(),
            fast_model: "llama3.2:3b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub enabled: bool,
    pub budget_per_session_usd: f64,
    pub image_model: String,
    pub video_model: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            budget_per_session_usd: 2.0,
            image_model: String::new(),
            video_model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Turns kept verbatim in the sliding window.
    pub window_size: usize,
    /// Maximum pinned exchanges kept alongside the window.
    pub pinned_max: usize,
    /// Ranked memories injected per turn.
    pub retrieval_top_n: usize,
    /// Cold-compression cadence, in turns.
    pub compaction_interval: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            pinned_max: 5,
            retrieval_top_n: 8,
            compaction_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// When set, insufficient HP/MP/SP no longer blocks an action; the
    /// outcome judge is told the character is overdrawn instead.
    pub narrative_override_resources: bool,
    /// Tiers of advantage an OP character gets over the world's typical
    /// tier when no explicit tier was chosen at calibration.
    pub op_tier_gap: u8,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            narrative_override_resources: false,
            op_tier_gap: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for the SQLite database, profile documents, vector logs, and
    /// the scrape cache.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: ".aidm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Process settings document, persisted as `settings.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Empty string means no active campaign.
    pub active_profile_id: String,
    pub active_session_id: Option<String>,
    pub llm: LlmConfig,
    /// Canonical snake_case agent name → model assignment.
    pub agents: BTreeMap<String, AgentModel>,
    pub media: MediaConfig,
    pub memory: MemoryConfig,
    pub game: GameConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

impl Settings {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut settings = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            settings = toml::from_str(&raw)?;
        }
        Ok(settings)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolve the `(provider, model)` pair for a canonical agent name.
    pub fn model_for_agent(&self, agent_name: &str) -> (String, String) {
        match self.agents.get(agent_name) {
            Some(assignment) => (assignment.provider.clone(), assignment.model.clone()),
            None => (self.llm.provider.clone(), self.llm.model.clone()),
        }
    }

    /// Clear the active campaign pointers. Per-campaign state purging is the
    /// engine's job; profile documents and lore indexes are shared assets and
    /// are never touched by reset.
    pub fn reset_active(&mut self) {
        self.active_profile_id.clear();
        self.active_session_id = None;
    }

    pub fn has_active_campaign(&self) -> bool {
        !self.active_profile_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.memory.window_size, 20);
        assert_eq!(settings.memory.pinned_max, 5);
        assert_eq!(settings.game.op_tier_gap, 4);
        assert!(!settings.game.narrative_override_resources);
        assert!(!settings.has_active_campaign());
    }

    #[test]
    fn round_trips_through_toml() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("settings.toml");

        let mut settings = Settings::default();
        settings.active_profile_id = "frieren_beyond_journeys_end".to_string();
        settings.agents.insert(
            "key_animator".to_string(),
            AgentModel {
                provider: "openai".to_string(),
                model: "gpt-4o".to_string(),
            },
        );
        settings.save_to(&path)?;

        let loaded = Settings::load_from(&path)?;
        assert_eq!(loaded.active_profile_id, "frieren_beyond_journeys_end");
        assert_eq!(
            loaded.model_for_agent("key_animator"),
            ("openai".to_string(), "gpt-4o".to_string())
        );
        Ok(())
    }

    #[test]
    fn unknown_agent_falls_back_to_llm_defaults() {
        let settings = Settings::default();
        let (provider, model) = settings.model_for_agent("outcome_judge");
        assert_eq!(provider, settings.llm.provider);
        assert_eq!(model, settings.llm.model);
    }

    #[test]
    fn missing_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = Settings::load_from(dir.path().join("absent.toml"))?;
        assert_eq!(settings.memory.window_size, 20);
        Ok(())
    }

    #[test]
    fn reset_clears_active_pointers_only() {
        let mut settings = Settings::default();
        settings.active_profile_id = "slug".to_string();
        settings.active_session_id = Some("sess-1".to_string());
        settings.agents.insert(
            "director".to_string(),
            AgentModel {
                provider: "ollama".to_string(),
                model: "llama3.1:8b".to_string(),
            },
        );

        settings.reset_active();
        assert!(settings.active_profile_id.is_empty());
        assert!(settings.active_session_id.is_none());
        // Model assignments survive reset.
        assert!(settings.agents.contains_key("director"));
    }
}
