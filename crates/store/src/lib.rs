//! Relational state manager.
//!
//! Single-writer SQLite database holding every per-campaign entity:
//! campaigns, characters, world states, NPCs, factions, locations, turns,
//! campaign bibles, foreshadowing seeds, sessions, media assets, and the
//! pending-memory queue. The vector store is downstream of this database —
//! SQL is the source of truth.

pub mod entities;
pub mod transaction;

pub use entities::*;
pub use transaction::{StateTransaction, TxOp};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A commit precondition failed (stale turn number, overdrawn
    /// resources, non-monotonic bible version).
    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().display()
        ))
        .map_err(StoreError::Sqlx)?
        .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests. One connection, or every query would
    /// see a different empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS campaigns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                profile_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS characters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                power_tier TEXT NOT NULL,
                level INTEGER NOT NULL DEFAULT 1,
                hp INTEGER NOT NULL,
                mp INTEGER NOT NULL,
                sp INTEGER NOT NULL,
                op_enabled INTEGER NOT NULL DEFAULT 0,
                op_tension_source TEXT,
                op_power_expression TEXT,
                op_narrative_focus TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS world_states (
                campaign_id INTEGER PRIMARY KEY,
                situation TEXT NOT NULL,
                tension_level REAL NOT NULL DEFAULT 0.0,
                arc_phase TEXT NOT NULL DEFAULT 'setup',
                turns_in_phase INTEGER NOT NULL DEFAULT 0,
                threat_tier TEXT,
                current_location_id INTEGER
            )"#,
            r#"CREATE TABLE IF NOT EXISTS npcs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                disposition TEXT NOT NULL DEFAULT 'neutral',
                intelligence_stage TEXT NOT NULL DEFAULT 'reactive',
                interaction_count INTEGER NOT NULL DEFAULT 0,
                last_appeared INTEGER NOT NULL DEFAULT 0,
                milestones TEXT NOT NULL DEFAULT '[]',
                notes TEXT NOT NULL DEFAULT '',
                UNIQUE(campaign_id, name)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS factions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                discovered INTEGER NOT NULL DEFAULT 1,
                UNIQUE(campaign_id, name)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                discovered INTEGER NOT NULL DEFAULT 1,
                UNIQUE(campaign_id, name)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                turn_number INTEGER NOT NULL,
                player_input TEXT NOT NULL,
                intent TEXT NOT NULL,
                decisions TEXT NOT NULL DEFAULT '{}',
                narrative TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                cache_hit_ratio REAL NOT NULL DEFAULT 0.0,
                created_at TEXT NOT NULL,
                UNIQUE(campaign_id, turn_number)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS campaign_bibles (
                campaign_id INTEGER PRIMARY KEY,
                bible_version INTEGER NOT NULL DEFAULT 0,
                document TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS foreshadowing_seeds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                description TEXT NOT NULL,
                planted_turn INTEGER NOT NULL,
                seed_type TEXT NOT NULL DEFAULT 'mystery',
                urgency TEXT NOT NULL DEFAULT 'normal',
                related_npcs TEXT NOT NULL DEFAULT '[]',
                expected_payoff TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'planted',
                max_turns_to_payoff INTEGER NOT NULL DEFAULT 10,
                resolution_narrative TEXT,
                depends_on TEXT NOT NULL DEFAULT '[]',
                triggers TEXT NOT NULL DEFAULT '[]',
                conflicts_with TEXT NOT NULL DEFAULT '[]'
            )"#,
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                campaign_id INTEGER,
                phase TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS media_assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                prompt TEXT NOT NULL,
                cost_usd REAL NOT NULL DEFAULT 0.0,
                origin_turn INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS pending_memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL,
                origin_turn INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ── Campaigns ────────────────────────────────────────────────────────────

    pub async fn create_campaign(&self, name: &str, profile_id: &str) -> Result<Campaign> {
        let created_at = now();
        let id = sqlx::query(
            "INSERT INTO campaigns (name, profile_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(profile_id)
        .bind(&created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        info!(campaign_id = id, profile_id, "campaign created");
        Ok(Campaign {
            id,
            name: name.to_string(),
            profile_id: profile_id.to_string(),
            created_at,
        })
    }

    pub async fn campaign(&self, id: i64) -> Result<Campaign> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))?;
        Ok(Campaign {
            id: row.get("id"),
            name: row.get("name"),
            profile_id: row.get("profile_id"),
            created_at: row.get("created_at"),
        })
    }

    pub async fn campaigns(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query("SELECT * FROM campaigns ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Campaign {
                id: row.get("id"),
                name: row.get("name"),
                profile_id: row.get("profile_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Cascade delete: removes the campaign and every owned entity. The
    /// profile the campaign points at is shared and untouched.
    pub async fn delete_campaign(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "characters",
            "world_states",
            "npcs",
            "factions",
            "locations",
            "turns",
            "campaign_bibles",
            "foreshadowing_seeds",
            "media_assets",
            "pending_memories",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE campaign_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM sessions WHERE campaign_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM campaigns WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(campaign_id = id, "campaign cascade-deleted");
        Ok(())
    }

    /// Settings reset: purge all per-campaign state and sessions.
    pub async fn reset_all(&self) -> Result<()> {
        for campaign in self.campaigns().await? {
            self.delete_campaign(campaign.id).await?;
        }
        sqlx::query("DELETE FROM sessions").execute(&self.pool).await?;
        Ok(())
    }

    // ── Characters ───────────────────────────────────────────────────────────

    pub async fn insert_character(&self, new: NewCharacter) -> Result<Character> {
        let id = sqlx::query(
            "INSERT INTO characters (campaign_id, name, power_tier, level, hp, mp, sp, \
             op_enabled, op_tension_source, op_power_expression, op_narrative_focus) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.campaign_id)
        .bind(&new.name)
        .bind(&new.power_tier)
        .bind(new.level)
        .bind(new.hp)
        .bind(new.mp)
        .bind(new.sp)
        .bind(new.op_enabled)
        .bind(&new.op_tension_source)
        .bind(&new.op_power_expression)
        .bind(&new.op_narrative_focus)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.character(id).await
    }

    pub async fn character(&self, id: i64) -> Result<Character> {
        let row = sqlx::query("SELECT * FROM characters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("character {id}")))?;
        Ok(character_from_row(&row))
    }

    pub async fn character_for_campaign(&self, campaign_id: i64) -> Result<Character> {
        let row = sqlx::query("SELECT * FROM characters WHERE campaign_id = ? LIMIT 1")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("character for campaign {campaign_id}")))?;
        Ok(character_from_row(&row))
    }

    // ── World state ──────────────────────────────────────────────────────────

    pub async fn init_world_state(&self, campaign_id: i64, situation: &str) -> Result<WorldState> {
        sqlx::query(
            "INSERT OR IGNORE INTO world_states (campaign_id, situation) VALUES (?, ?)",
        )
        .bind(campaign_id)
        .bind(situation)
        .execute(&self.pool)
        .await?;
        self.world_state(campaign_id).await
    }

    pub async fn world_state(&self, campaign_id: i64) -> Result<WorldState> {
        let row = sqlx::query("SELECT * FROM world_states WHERE campaign_id = ?")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("world state {campaign_id}")))?;
        Ok(WorldState {
            campaign_id: row.get("campaign_id"),
            situation: row.get("situation"),
            tension_level: row.get("tension_level"),
            arc_phase: ArcPhase::parse(row.get::<String, _>("arc_phase").as_str())
                .unwrap_or(ArcPhase::Setup),
            turns_in_phase: row.get("turns_in_phase"),
            threat_tier: row.get("threat_tier"),
            current_location_id: row.get("current_location_id"),
        })
    }

    pub async fn save_world_state(&self, state: &WorldState) -> Result<()> {
        sqlx::query(
            "UPDATE world_states SET situation = ?, tension_level = ?, arc_phase = ?, \
             turns_in_phase = ?, threat_tier = ?, current_location_id = ? WHERE campaign_id = ?",
        )
        .bind(&state.situation)
        .bind(state.tension_level.clamp(0.0, 1.0))
        .bind(state.arc_phase.as_str())
        .bind(state.turns_in_phase)
        .bind(&state.threat_tier)
        .bind(state.current_location_id)
        .bind(state.campaign_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── NPCs ─────────────────────────────────────────────────────────────────

    /// Fetch-or-create by `(campaign, name)`.
    pub async fn upsert_npc(&self, campaign_id: i64, name: &str) -> Result<Npc> {
        sqlx::query("INSERT OR IGNORE INTO npcs (campaign_id, name) VALUES (?, ?)")
            .bind(campaign_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT * FROM npcs WHERE campaign_id = ? AND name = ?")
            .bind(campaign_id)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(npc_from_row(&row))
    }

    pub async fn npc(&self, id: i64) -> Result<Npc> {
        let row = sqlx::query("SELECT * FROM npcs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("npc {id}")))?;
        Ok(npc_from_row(&row))
    }

    pub async fn npcs_for(&self, campaign_id: i64) -> Result<Vec<Npc>> {
        let rows = sqlx::query("SELECT * FROM npcs WHERE campaign_id = ? ORDER BY id")
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(npc_from_row).collect())
    }

    pub async fn save_npc(&self, npc: &Npc) -> Result<()> {
        sqlx::query(
            "UPDATE npcs SET disposition = ?, intelligence_stage = ?, interaction_count = ?, \
             last_appeared = ?, milestones = ?, notes = ? WHERE id = ?",
        )
        .bind(npc.disposition.as_str())
        .bind(npc.intelligence_stage.as_str())
        .bind(npc.interaction_count)
        .bind(npc.last_appeared)
        .bind(serde_json::to_string(&npc.milestones)?)
        .bind(&npc.notes)
        .bind(npc.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Factions & locations ─────────────────────────────────────────────────

    pub async fn upsert_faction(
        &self,
        campaign_id: i64,
        name: &str,
        description: &str,
    ) -> Result<Faction> {
        sqlx::query(
            "INSERT INTO factions (campaign_id, name, description) VALUES (?, ?, ?) \
             ON CONFLICT(campaign_id, name) DO UPDATE SET description = excluded.description",
        )
        .bind(campaign_id)
        .bind(name)
        .bind(description)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT * FROM factions WHERE campaign_id = ? AND name = ?")
            .bind(campaign_id)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(Faction {
            id: row.get("id"),
            campaign_id: row.get("campaign_id"),
            name: row.get("name"),
            description: row.get("description"),
            discovered: row.get::<i64, _>("discovered") != 0,
        })
    }

    pub async fn factions_for(&self, campaign_id: i64) -> Result<Vec<Faction>> {
        let rows = sqlx::query("SELECT * FROM factions WHERE campaign_id = ? ORDER BY id")
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Faction {
                id: row.get("id"),
                campaign_id: row.get("campaign_id"),
                name: row.get("name"),
                description: row.get("description"),
                discovered: row.get::<i64, _>("discovered") != 0,
            })
            .collect())
    }

    pub async fn upsert_location(
        &self,
        campaign_id: i64,
        name: &str,
        description: &str,
    ) -> Result<Location> {
        sqlx::query(
            "INSERT INTO locations (campaign_id, name, description) VALUES (?, ?, ?) \
             ON CONFLICT(campaign_id, name) DO UPDATE SET description = excluded.description",
        )
        .bind(campaign_id)
        .bind(name)
        .bind(description)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT * FROM locations WHERE campaign_id = ? AND name = ?")
            .bind(campaign_id)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(location_from_row(&row))
    }

    pub async fn locations_for(&self, campaign_id: i64) -> Result<Vec<Location>> {
        let rows = sqlx::query("SELECT * FROM locations WHERE campaign_id = ? ORDER BY id")
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(location_from_row).collect())
    }

    // ── Turns ────────────────────────────────────────────────────────────────

    pub async fn latest_turn_number(&self, campaign_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(turn_number), 0) AS latest FROM turns WHERE campaign_id = ?",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("latest"))
    }

    pub async fn recent_turns(&self, campaign_id: i64, limit: i64) -> Result<Vec<TurnRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM turns WHERE campaign_id = ? ORDER BY turn_number DESC LIMIT ?",
        )
        .bind(campaign_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut turns: Vec<TurnRecord> = rows.iter().map(turn_from_row).collect();
        turns.reverse();
        Ok(turns)
    }

    pub async fn turns_count(&self, campaign_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM turns WHERE campaign_id = ?")
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Deep-recall backing: keyword search over verbatim turn narratives.
    pub async fn search_narrative(
        &self,
        campaign_id: i64,
        keyword: &str,
        limit: i64,
    ) -> Result<Vec<TurnRecord>> {
        let pattern = format!("%{keyword}%");
        let rows = sqlx::query(
            "SELECT * FROM turns WHERE campaign_id = ? AND narrative LIKE ? \
             ORDER BY turn_number DESC LIMIT ?",
        )
        .bind(campaign_id)
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(turn_from_row).collect())
    }

    // ── Campaign bible ───────────────────────────────────────────────────────

    pub async fn bible(&self, campaign_id: i64) -> Result<CampaignBible> {
        let row = sqlx::query("SELECT document FROM campaign_bibles WHERE campaign_id = ?")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let document: String = row.get("document");
                Ok(serde_json::from_str(&document)?)
            }
            None => Ok(CampaignBible::empty(campaign_id)),
        }
    }

    /// Persist a bible revision. Versions are strictly monotonic.
    pub async fn save_bible(&self, bible: &CampaignBible) -> Result<()> {
        let current = self.bible(bible.campaign_id).await?;
        if bible.bible_version <= current.bible_version && current.bible_version > 0 {
            return Err(StoreError::Conflict(format!(
                "bible version {} is not newer than stored {}",
                bible.bible_version, current.bible_version
            )));
        }
        let document = serde_json::to_string(bible)?;
        sqlx::query(
            "INSERT INTO campaign_bibles (campaign_id, bible_version, document) VALUES (?, ?, ?) \
             ON CONFLICT(campaign_id) DO UPDATE SET bible_version = excluded.bible_version, \
             document = excluded.document",
        )
        .bind(bible.campaign_id)
        .bind(bible.bible_version)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Foreshadowing seeds ──────────────────────────────────────────────────

    pub async fn insert_seed(&self, seed: &ForeshadowSeed) -> Result<ForeshadowSeed> {
        let id = sqlx::query(
            "INSERT INTO foreshadowing_seeds (campaign_id, description, planted_turn, seed_type, \
             urgency, related_npcs, expected_payoff, status, max_turns_to_payoff, \
             resolution_narrative, depends_on, triggers, conflicts_with) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(seed.campaign_id)
        .bind(&seed.description)
        .bind(seed.planted_turn)
        .bind(&seed.seed_type)
        .bind(&seed.urgency)
        .bind(serde_json::to_string(&seed.related_npcs)?)
        .bind(&seed.expected_payoff)
        .bind(seed.status.as_str())
        .bind(seed.max_turns_to_payoff)
        .bind(&seed.resolution_narrative)
        .bind(serde_json::to_string(&seed.depends_on)?)
        .bind(serde_json::to_string(&seed.triggers)?)
        .bind(serde_json::to_string(&seed.conflicts_with)?)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.seed(id).await
    }

    pub async fn seed(&self, id: i64) -> Result<ForeshadowSeed> {
        let row = sqlx::query("SELECT * FROM foreshadowing_seeds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("seed {id}")))?;
        Ok(seed_from_row(&row))
    }

    pub async fn seeds_for(&self, campaign_id: i64) -> Result<Vec<ForeshadowSeed>> {
        let rows =
            sqlx::query("SELECT * FROM foreshadowing_seeds WHERE campaign_id = ? ORDER BY id")
                .bind(campaign_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(seed_from_row).collect())
    }

    pub async fn save_seed(&self, seed: &ForeshadowSeed) -> Result<()> {
        sqlx::query(
            "UPDATE foreshadowing_seeds SET description = ?, planted_turn = ?, status = ?, \
             urgency = ?, related_npcs = ?, expected_payoff = ?, max_turns_to_payoff = ?, \
             resolution_narrative = ?, depends_on = ?, triggers = ?, conflicts_with = ? \
             WHERE id = ?",
        )
        .bind(&seed.description)
        .bind(seed.planted_turn)
        .bind(seed.status.as_str())
        .bind(&seed.urgency)
        .bind(serde_json::to_string(&seed.related_npcs)?)
        .bind(&seed.expected_payoff)
        .bind(seed.max_turns_to_payoff)
        .bind(&seed.resolution_narrative)
        .bind(serde_json::to_string(&seed.depends_on)?)
        .bind(serde_json::to_string(&seed.triggers)?)
        .bind(serde_json::to_string(&seed.conflicts_with)?)
        .bind(seed.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Pending memories ─────────────────────────────────────────────────────

    pub async fn enqueue_memory(
        &self,
        campaign_id: i64,
        origin_turn: i64,
        payload: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_memories (campaign_id, origin_turn, payload, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(campaign_id)
        .bind(origin_turn)
        .bind(serde_json::to_string(payload)?)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pop up to `limit` queued memory writes. Items are removed only after
    /// a successful fetch; a failed vector upsert re-enqueues.
    pub async fn drain_pending(&self, limit: i64) -> Result<Vec<PendingMemory>> {
        let rows = sqlx::query("SELECT * FROM pending_memories ORDER BY id LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload: String = row.get("payload");
            pending.push(PendingMemory {
                id: row.get("id"),
                campaign_id: row.get("campaign_id"),
                origin_turn: row.get("origin_turn"),
                payload: serde_json::from_str(&payload)?,
            });
        }
        for item in &pending {
            sqlx::query("DELETE FROM pending_memories WHERE id = ?")
                .bind(item.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(pending)
    }

    pub async fn requeue_memory(&self, item: &PendingMemory) -> Result<()> {
        self.enqueue_memory(item.campaign_id, item.origin_turn, &item.payload)
            .await
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_memories")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // ── Sessions & media ─────────────────────────────────────────────────────

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, campaign_id, phase, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET campaign_id = excluded.campaign_id, \
             phase = excluded.phase, updated_at = excluded.updated_at",
        )
        .bind(&session.id)
        .bind(session.campaign_id)
        .bind(&session.phase)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| Session {
            id: row.get("id"),
            campaign_id: row.get("campaign_id"),
            phase: row.get("phase"),
            updated_at: row.get("updated_at"),
        }))
    }

    pub async fn insert_media(
        &self,
        campaign_id: i64,
        kind: &str,
        prompt: &str,
        cost_usd: f64,
        origin_turn: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO media_assets (campaign_id, kind, prompt, cost_usd, origin_turn) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(campaign_id)
        .bind(kind)
        .bind(prompt)
        .bind(cost_usd)
        .bind(origin_turn)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn media_cost_for(&self, campaign_id: i64) -> Result<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cost_usd), 0.0) AS total FROM media_assets WHERE campaign_id = ?",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("total"))
    }

    /// Row counts across all campaign-owned tables; used by reset and the
    /// cascade-delete tests.
    pub async fn owned_row_counts(&self, campaign_id: i64) -> Result<Vec<(&'static str, i64)>> {
        let mut counts = Vec::new();
        for table in [
            "characters",
            "world_states",
            "npcs",
            "factions",
            "locations",
            "turns",
            "campaign_bibles",
            "foreshadowing_seeds",
            "media_assets",
            "pending_memories",
        ] {
            let row = sqlx::query(&format!(
                "SELECT COUNT(*) AS n FROM {table} WHERE campaign_id = ?"
            ))
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;
            counts.push((table, row.get::<i64, _>("n")));
        }
        Ok(counts)
    }
}

// ── Row mapping ──────────────────────────────────────────────────────────────

fn character_from_row(row: &sqlx::sqlite::SqliteRow) -> Character {
    Character {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        name: row.get("name"),
        power_tier: row.get("power_tier"),
        level: row.get("level"),
        hp: row.get("hp"),
        mp: row.get("mp"),
        sp: row.get("sp"),
        op_enabled: row.get::<i64, _>("op_enabled") != 0,
        op_tension_source: row.get("op_tension_source"),
        op_power_expression: row.get("op_power_expression"),
        op_narrative_focus: row.get("op_narrative_focus"),
    }
}

fn npc_from_row(row: &sqlx::sqlite::SqliteRow) -> Npc {
    let milestones: String = row.get("milestones");
    Npc {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        name: row.get("name"),
        disposition: Disposition::parse(row.get::<String, _>("disposition").as_str())
            .unwrap_or(Disposition::Neutral),
        intelligence_stage: IntelligenceStage::parse(
            row.get::<String, _>("intelligence_stage").as_str(),
        )
        .unwrap_or(IntelligenceStage::Reactive),
        interaction_count: row.get("interaction_count"),
        last_appeared: row.get("last_appeared"),
        milestones: serde_json::from_str(&milestones).unwrap_or_default(),
        notes: row.get("notes"),
    }
}

fn location_from_row(row: &sqlx::sqlite::SqliteRow) -> Location {
    Location {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        name: row.get("name"),
        description: row.get("description"),
        discovered: row.get::<i64, _>("discovered") != 0,
    }
}

fn turn_from_row(row: &sqlx::sqlite::SqliteRow) -> TurnRecord {
    let decisions: String = row.get("decisions");
    TurnRecord {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        turn_number: row.get("turn_number"),
        player_input: row.get("player_input"),
        intent: row.get("intent"),
        decisions: serde_json::from_str(&decisions).unwrap_or(serde_json::Value::Null),
        narrative: row.get("narrative"),
        prompt_tokens: row.get("prompt_tokens"),
        completion_tokens: row.get("completion_tokens"),
        cache_hit_ratio: row.get("cache_hit_ratio"),
        created_at: row.get("created_at"),
    }
}

fn seed_from_row(row: &sqlx::sqlite::SqliteRow) -> ForeshadowSeed {
    let related: String = row.get("related_npcs");
    let depends: String = row.get("depends_on");
    let triggers: String = row.get("triggers");
    let conflicts: String = row.get("conflicts_with");
    ForeshadowSeed {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        description: row.get("description"),
        planted_turn: row.get("planted_turn"),
        seed_type: row.get("seed_type"),
        urgency: row.get("urgency"),
        related_npcs: serde_json::from_str(&related).unwrap_or_default(),
        expected_payoff: row.get("expected_payoff"),
        status: SeedStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(SeedStatus::Planted),
        max_turns_to_payoff: row.get("max_turns_to_payoff"),
        resolution_narrative: row.get("resolution_narrative"),
        depends_on: serde_json::from_str(&depends).unwrap_or_default(),
        triggers: serde_json::from_str(&triggers).unwrap_or_default(),
        conflicts_with: serde_json::from_str(&conflicts).unwrap_or_default(),
    }
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_campaign(store: &Store) -> (Campaign, Character) {
        let campaign = store
            .create_campaign("Journey North", "frieren_beyond_journeys_end")
            .await
            .unwrap();
        store
            .init_world_state(campaign.id, "A quiet village at the frontier")
            .await
            .unwrap();
        let character = store
            .insert_character(NewCharacter {
                campaign_id: campaign.id,
                name: "Aster".to_string(),
                power_tier: "T3".to_string(),
                level: 1,
                hp: 30,
                mp: 20,
                sp: 10,
                op_enabled: true,
                op_tension_source: Some("existential".to_string()),
                op_power_expression: Some("passive".to_string()),
                op_narrative_focus: None,
            })
            .await
            .unwrap();
        (campaign, character)
    }

    #[tokio::test]
    async fn campaign_round_trip() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign, character) = seeded_campaign(&store).await;

        let loaded = store.campaign(campaign.id).await?;
        assert_eq!(loaded.profile_id, "frieren_beyond_journeys_end");

        let loaded = store.character_for_campaign(campaign.id).await?;
        assert_eq!(loaded.id, character.id);
        assert_eq!(loaded.power_tier, "T3");
        assert!(loaded.op_enabled);
        Ok(())
    }

    #[tokio::test]
    async fn cascade_delete_removes_everything_owned() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign, _) = seeded_campaign(&store).await;

        store.upsert_npc(campaign.id, "Innkeeper Rolf").await?;
        store.upsert_faction(campaign.id, "Mage Guild", "Licensed casters").await?;
        store.upsert_location(campaign.id, "Frontier Village", "").await?;
        store
            .insert_seed(&ForeshadowSeed {
                id: 0,
                campaign_id: campaign.id,
                description: "A stranger watches from the crowd".to_string(),
                planted_turn: 1,
                seed_type: "mystery".to_string(),
                urgency: "normal".to_string(),
                related_npcs: vec![],
                expected_payoff: "The stranger approaches".to_string(),
                status: SeedStatus::Planted,
                max_turns_to_payoff: 10,
                resolution_narrative: None,
                depends_on: vec![],
                triggers: vec![],
                conflicts_with: vec![],
            })
            .await?;
        store
            .enqueue_memory(campaign.id, 1, &serde_json::json!({"text": "beat"}))
            .await?;
        store.insert_media(campaign.id, "image", "village at dusk", 0.1, 1).await?;

        store.delete_campaign(campaign.id).await?;

        for (table, count) in store.owned_row_counts(campaign.id).await? {
            assert_eq!(count, 0, "table {table} not emptied");
        }
        assert!(store.campaign(campaign.id).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn bible_versions_are_strictly_monotonic() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign, _) = seeded_campaign(&store).await;

        let mut bible = store.bible(campaign.id).await?;
        assert_eq!(bible.bible_version, 0);

        bible.bible_version = 1;
        bible.active_threads.push("The watcher in the crowd".to_string());
        store.save_bible(&bible).await?;

        // Re-saving the same version is a conflict.
        assert!(matches!(
            store.save_bible(&bible).await,
            Err(StoreError::Conflict(_))
        ));

        bible.bible_version = 2;
        store.save_bible(&bible).await?;
        let loaded = store.bible(campaign.id).await?;
        assert_eq!(loaded.bible_version, 2);
        assert_eq!(loaded, bible);
        Ok(())
    }

    #[tokio::test]
    async fn seed_round_trip_preserves_causal_links() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign, _) = seeded_campaign(&store).await;

        let inserted = store
            .insert_seed(&ForeshadowSeed {
                id: 0,
                campaign_id: campaign.id,
                description: "The sealed vault hums at night".to_string(),
                planted_turn: 3,
                seed_type: "mystery".to_string(),
                urgency: "high".to_string(),
                related_npcs: vec!["Rolf".to_string()],
                expected_payoff: "The vault opens".to_string(),
                status: SeedStatus::Planted,
                max_turns_to_payoff: 8,
                resolution_narrative: None,
                depends_on: vec![7],
                triggers: vec![9],
                conflicts_with: vec![11],
            })
            .await?;

        let loaded = store.seed(inserted.id).await?;
        assert_eq!(loaded.depends_on, vec![7]);
        assert_eq!(loaded.triggers, vec![9]);
        assert_eq!(loaded.conflicts_with, vec![11]);
        assert_eq!(loaded.related_npcs, vec!["Rolf"]);
        Ok(())
    }

    #[tokio::test]
    async fn pending_queue_drains_in_order_and_requeues() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign, _) = seeded_campaign(&store).await;

        for n in 1..=3 {
            store
                .enqueue_memory(campaign.id, n, &serde_json::json!({"beat": n}))
                .await?;
        }
        assert_eq!(store.pending_count().await?, 3);

        let drained = store.drain_pending(2).await?;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload["beat"], 1);
        assert_eq!(store.pending_count().await?, 1);

        // Failed upsert path: the item goes back on the queue.
        store.requeue_memory(&drained[0]).await?;
        assert_eq!(store.pending_count().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn narrative_search_finds_keyword_excerpts() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign, character) = seeded_campaign(&store).await;

        let mut tx = StateTransaction::new(campaign.id);
        tx.insert_turn(NewTurn {
            campaign_id: campaign.id,
            turn_number: 1,
            player_input: "look around".to_string(),
            intent: "exploration".to_string(),
            decisions: serde_json::json!({}),
            narrative: "The lighthouse keeper waves from the rocks.".to_string(),
            prompt_tokens: 10,
            completion_tokens: 20,
            cache_hit_ratio: 0.0,
        });
        store.commit(tx, &character).await?;

        let hits = store.search_narrative(campaign.id, "lighthouse", 3).await?;
        assert_eq!(hits.len(), 1);
        assert!(hits[0].narrative.contains("lighthouse keeper"));
        Ok(())
    }
}
