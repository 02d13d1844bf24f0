//! Deferred-commit turn transactions.
//!
//! The orchestrator accumulates every Stage-8 mutation into a
//! [`StateTransaction`] while the turn runs, then hands it to
//! [`Store::commit`] which issues everything inside one SQL transaction.
//! Any precondition failure or SQL error rolls back the whole batch — a
//! rejected narrative leaves no partial state behind.

use sqlx::Row;
use tracing::{debug, info};

use crate::entities::{
    CampaignBible, Character, Disposition, ForeshadowSeed, NewTurn, WorldState,
};
use crate::{Result, Store, StoreError, now};

#[derive(Debug, Clone)]
pub enum TxOp {
    InsertTurn(NewTurn),
    AdjustResources {
        character_id: i64,
        hp: i64,
        mp: i64,
        sp: i64,
    },
    SetNpcDisposition {
        npc_id: i64,
        disposition: Disposition,
    },
    /// Bump interaction count and stamp `last_appeared`.
    TouchNpc {
        npc_id: i64,
        turn_number: i64,
    },
    UpdateWorldState(WorldState),
    SaveSeed(ForeshadowSeed),
    SaveBible(CampaignBible),
    EnqueueMemory {
        origin_turn: i64,
        payload: serde_json::Value,
    },
}

#[derive(Debug)]
pub struct StateTransaction {
    pub campaign_id: i64,
    ops: Vec<TxOp>,
}

impl StateTransaction {
    pub fn new(campaign_id: i64) -> Self {
        Self {
            campaign_id,
            ops: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn insert_turn(&mut self, turn: NewTurn) {
        self.ops.push(TxOp::InsertTurn(turn));
    }

    pub fn adjust_resources(&mut self, character_id: i64, hp: i64, mp: i64, sp: i64) {
        if hp == 0 && mp == 0 && sp == 0 {
            return;
        }
        self.ops.push(TxOp::AdjustResources {
            character_id,
            hp,
            mp,
            sp,
        });
    }

    pub fn set_npc_disposition(&mut self, npc_id: i64, disposition: Disposition) {
        self.ops.push(TxOp::SetNpcDisposition { npc_id, disposition });
    }

    pub fn touch_npc(&mut self, npc_id: i64, turn_number: i64) {
        self.ops.push(TxOp::TouchNpc { npc_id, turn_number });
    }

    pub fn update_world_state(&mut self, state: WorldState) {
        self.ops.push(TxOp::UpdateWorldState(state));
    }

    pub fn save_seed(&mut self, seed: ForeshadowSeed) {
        self.ops.push(TxOp::SaveSeed(seed));
    }

    pub fn save_bible(&mut self, bible: CampaignBible) {
        self.ops.push(TxOp::SaveBible(bible));
    }

    pub fn enqueue_memory(&mut self, origin_turn: i64, payload: serde_json::Value) {
        self.ops.push(TxOp::EnqueueMemory { origin_turn, payload });
    }

    /// Resource-cost precondition: the batched deltas must not take any
    /// resource below zero, given the character's current values.
    pub fn validate(&self, character: &Character) -> Result<()> {
        let (mut hp, mut mp, mut sp) = (character.hp, character.mp, character.sp);
        for op in &self.ops {
            if let TxOp::AdjustResources {
                character_id,
                hp: dhp,
                mp: dmp,
                sp: dsp,
            } = op
            {
                if *character_id != character.id {
                    continue;
                }
                hp += dhp;
                mp += dmp;
                sp += dsp;
            }
        }
        if hp < 0 || mp < 0 || sp < 0 {
            return Err(StoreError::Conflict(format!(
                "resource precondition failed: hp={hp} mp={mp} sp={sp}"
            )));
        }
        Ok(())
    }

    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }
}

impl Store {
    /// Apply a turn's batched mutations atomically. Preconditions
    /// (resources, turn ordering, bible monotonicity) are re-checked inside
    /// the SQL transaction; any failure rolls back every mutation.
    pub async fn commit(&self, tx: StateTransaction, character: &Character) -> Result<()> {
        tx.validate(character)?;

        let mut sql = self.pool().begin().await?;

        for op in tx.ops() {
            match op {
                TxOp::InsertTurn(turn) => {
                    let latest: i64 = sqlx::query(
                        "SELECT COALESCE(MAX(turn_number), 0) AS latest FROM turns \
                         WHERE campaign_id = ?",
                    )
                    .bind(turn.campaign_id)
                    .fetch_one(&mut *sql)
                    .await?
                    .get("latest");
                    if turn.turn_number != latest + 1 {
                        return Err(StoreError::Conflict(format!(
                            "turn {} does not follow latest {latest}",
                            turn.turn_number
                        )));
                    }
                    sqlx::query(
                        "INSERT INTO turns (campaign_id, turn_number, player_input, intent, \
                         decisions, narrative, prompt_tokens, completion_tokens, \
                         cache_hit_ratio, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(turn.campaign_id)
                    .bind(turn.turn_number)
                    .bind(&turn.player_input)
                    .bind(&turn.intent)
                    .bind(serde_json::to_string(&turn.decisions)?)
                    .bind(&turn.narrative)
                    .bind(turn.prompt_tokens)
                    .bind(turn.completion_tokens)
                    .bind(turn.cache_hit_ratio)
                    .bind(now())
                    .execute(&mut *sql)
                    .await?;
                }
                TxOp::AdjustResources {
                    character_id,
                    hp,
                    mp,
                    sp,
                } => {
                    let row = sqlx::query("SELECT hp, mp, sp FROM characters WHERE id = ?")
                        .bind(character_id)
                        .fetch_one(&mut *sql)
                        .await?;
                    let (new_hp, new_mp, new_sp) = (
                        row.get::<i64, _>("hp") + hp,
                        row.get::<i64, _>("mp") + mp,
                        row.get::<i64, _>("sp") + sp,
                    );
                    if new_hp < 0 || new_mp < 0 || new_sp < 0 {
                        return Err(StoreError::Conflict(format!(
                            "resources would go negative: hp={new_hp} mp={new_mp} sp={new_sp}"
                        )));
                    }
                    sqlx::query("UPDATE characters SET hp = ?, mp = ?, sp = ? WHERE id = ?")
                        .bind(new_hp)
                        .bind(new_mp)
                        .bind(new_sp)
                        .bind(character_id)
                        .execute(&mut *sql)
                        .await?;
                }
                TxOp::SetNpcDisposition { npc_id, disposition } => {
                    sqlx::query("UPDATE npcs SET disposition = ? WHERE id = ?")
                        .bind(disposition.as_str())
                        .bind(npc_id)
                        .execute(&mut *sql)
                        .await?;
                }
                TxOp::TouchNpc { npc_id, turn_number } => {
                    sqlx::query(
                        "UPDATE npcs SET interaction_count = interaction_count + 1, \
                         last_appeared = ? WHERE id = ?",
                    )
                    .bind(turn_number)
                    .bind(npc_id)
                    .execute(&mut *sql)
                    .await?;
                }
                TxOp::UpdateWorldState(state) => {
                    sqlx::query(
                        "UPDATE world_states SET situation = ?, tension_level = ?, \
                         arc_phase = ?, turns_in_phase = ?, threat_tier = ?, \
                         current_location_id = ? WHERE campaign_id = ?",
                    )
                    .bind(&state.situation)
                    .bind(state.tension_level.clamp(0.0, 1.0))
                    .bind(state.arc_phase.as_str())
                    .bind(state.turns_in_phase)
                    .bind(&state.threat_tier)
                    .bind(state.current_location_id)
                    .bind(state.campaign_id)
                    .execute(&mut *sql)
                    .await?;
                }
                TxOp::SaveSeed(seed) => {
                    sqlx::query(
                        "UPDATE foreshadowing_seeds SET status = ?, planted_turn = ?, \
                         resolution_narrative = ?, max_turns_to_payoff = ? WHERE id = ?",
                    )
                    .bind(seed.status.as_str())
                    .bind(seed.planted_turn)
                    .bind(&seed.resolution_narrative)
                    .bind(seed.max_turns_to_payoff)
                    .bind(seed.id)
                    .execute(&mut *sql)
                    .await?;
                }
                TxOp::SaveBible(bible) => {
                    let current: Option<i64> = sqlx::query(
                        "SELECT bible_version FROM campaign_bibles WHERE campaign_id = ?",
                    )
                    .bind(bible.campaign_id)
                    .fetch_optional(&mut *sql)
                    .await?
                    .map(|row| row.get("bible_version"));
                    if let Some(version) = current {
                        if bible.bible_version <= version {
                            return Err(StoreError::Conflict(format!(
                                "bible version {} not newer than {version}",
                                bible.bible_version
                            )));
                        }
                    }
                    sqlx::query(
                        "INSERT INTO campaign_bibles (campaign_id, bible_version, document) \
                         VALUES (?, ?, ?) ON CONFLICT(campaign_id) DO UPDATE SET \
                         bible_version = excluded.bible_version, document = excluded.document",
                    )
                    .bind(bible.campaign_id)
                    .bind(bible.bible_version)
                    .bind(serde_json::to_string(bible)?)
                    .execute(&mut *sql)
                    .await?;
                }
                TxOp::EnqueueMemory { origin_turn, payload } => {
                    sqlx::query(
                        "INSERT INTO pending_memories (campaign_id, origin_turn, payload, \
                         created_at) VALUES (?, ?, ?, ?)",
                    )
                    .bind(tx.campaign_id)
                    .bind(origin_turn)
                    .bind(serde_json::to_string(payload)?)
                    .bind(now())
                    .execute(&mut *sql)
                    .await?;
                }
            }
        }

        sql.commit().await?;
        debug!(campaign_id = tx.campaign_id, ops = tx.len(), "turn transaction committed");
        info!(campaign_id = tx.campaign_id, "stage-8 commit complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NewCharacter;

    async fn seeded(store: &Store) -> (i64, Character) {
        let campaign = store.create_campaign("Test", "some_profile").await.unwrap();
        store.init_world_state(campaign.id, "start").await.unwrap();
        let character = store
            .insert_character(NewCharacter {
                campaign_id: campaign.id,
                name: "Mira".to_string(),
                power_tier: "T7".to_string(),
                level: 1,
                hp: 20,
                mp: 10,
                sp: 5,
                op_enabled: false,
                op_tension_source: None,
                op_power_expression: None,
                op_narrative_focus: None,
            })
            .await
            .unwrap();
        (campaign.id, character)
    }

    fn turn(campaign_id: i64, number: i64) -> NewTurn {
        NewTurn {
            campaign_id,
            turn_number: number,
            player_input: format!("input {number}"),
            intent: "social".to_string(),
            decisions: serde_json::json!({"dc": 10}),
            narrative: format!("narrative {number}"),
            prompt_tokens: 100,
            completion_tokens: 50,
            cache_hit_ratio: 0.5,
        }
    }

    #[tokio::test]
    async fn turn_numbers_increment_strictly() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign_id, character) = seeded(&store).await;

        for n in 1..=3 {
            let mut tx = StateTransaction::new(campaign_id);
            tx.insert_turn(turn(campaign_id, n));
            store.commit(tx, &character).await?;
        }
        assert_eq!(store.latest_turn_number(campaign_id).await?, 3);

        // Skipping a number is a conflict.
        let mut tx = StateTransaction::new(campaign_id);
        tx.insert_turn(turn(campaign_id, 5));
        assert!(matches!(
            store.commit(tx, &character).await,
            Err(StoreError::Conflict(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn overdraw_rolls_back_the_whole_batch() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign_id, character) = seeded(&store).await;

        let mut tx = StateTransaction::new(campaign_id);
        tx.insert_turn(turn(campaign_id, 1));
        tx.adjust_resources(character.id, 0, -50, 0); // only 10 mp available

        assert!(store.commit(tx, &character).await.is_err());

        // Nothing from the batch persisted.
        assert_eq!(store.latest_turn_number(campaign_id).await?, 0);
        let unchanged = store.character(character.id).await?;
        assert_eq!(unchanged.mp, 10);
        Ok(())
    }

    #[tokio::test]
    async fn resources_never_negative_after_commit() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign_id, character) = seeded(&store).await;

        let mut tx = StateTransaction::new(campaign_id);
        tx.insert_turn(turn(campaign_id, 1));
        tx.adjust_resources(character.id, -5, -10, -5);
        store.commit(tx, &character).await?;

        let updated = store.character(character.id).await?;
        assert_eq!((updated.hp, updated.mp, updated.sp), (15, 0, 0));
        Ok(())
    }

    #[tokio::test]
    async fn npc_mutations_apply_with_the_turn() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign_id, character) = seeded(&store).await;
        let npc = store.upsert_npc(campaign_id, "Captain Ilya").await?;

        let mut tx = StateTransaction::new(campaign_id);
        tx.insert_turn(turn(campaign_id, 1));
        tx.set_npc_disposition(npc.id, Disposition::Friendly);
        tx.touch_npc(npc.id, 1);
        store.commit(tx, &character).await?;

        let updated = store.npc(npc.id).await?;
        assert_eq!(updated.disposition, Disposition::Friendly);
        assert_eq!(updated.interaction_count, 1);
        assert_eq!(updated.last_appeared, 1);
        Ok(())
    }

    #[tokio::test]
    async fn memory_writes_queue_through_the_transaction() -> anyhow::Result<()> {
        let store = Store::open_in_memory().await?;
        let (campaign_id, character) = seeded(&store).await;

        let mut tx = StateTransaction::new(campaign_id);
        tx.insert_turn(turn(campaign_id, 1));
        tx.enqueue_memory(1, serde_json::json!({"text": "a quiet moment", "category": "atmosphere"}));
        store.commit(tx, &character).await?;

        assert_eq!(store.pending_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn validate_rejects_overdraw_before_any_sql() {
        let character = Character {
            id: 1,
            campaign_id: 1,
            name: "X".to_string(),
            power_tier: "T7".to_string(),
            level: 1,
            hp: 5,
            mp: 5,
            sp: 5,
            op_enabled: false,
            op_tension_source: None,
            op_power_expression: None,
            op_narrative_focus: None,
        };
        let mut tx = StateTransaction::new(1);
        tx.adjust_resources(1, -10, 0, 0);
        assert!(tx.validate(&character).is_err());
    }
}
