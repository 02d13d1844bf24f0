//! Foreshadowing ledger and arc gates.
//!
//! The ledger is a write-through cache over the relational store; every
//! transition goes through [`SeedLedger::transition`], which rejects edges
//! not in the lifecycle graph:
//!
//! ```text
//! planted → mentioned → ready_to_resolve → resolved
//!    │           │              │
//!    └───────────┴──────────────┴──→ overdue → resolved | abandoned
//! ```

use std::collections::BTreeMap;

use aidm_store::{ArcPhase, ForeshadowSeed, SeedStatus, Store};
use tracing::{debug, info};

use crate::{EngineError, Result};

/// Tension added to the world per overdue seed per review.
pub const OVERDUE_TENSION_PRESSURE: f64 = 0.05;

/// Legal lifecycle edges. Skipping states (e.g. planted → resolved) is
/// rejected.
pub fn is_legal_transition(from: SeedStatus, to: SeedStatus) -> bool {
    use SeedStatus::*;
    matches!(
        (from, to),
        (Planted, Mentioned)
            | (Mentioned, ReadyToResolve)
            | (ReadyToResolve, Resolved)
            | (Planted, Overdue)
            | (Mentioned, Overdue)
            | (ReadyToResolve, Overdue)
            | (Overdue, Resolved)
            | (Overdue, Abandoned)
    )
}

#[derive(Debug, Clone)]
pub struct NewSeed {
    pub description: String,
    pub seed_type: String,
    pub urgency: String,
    pub related_npcs: Vec<String>,
    pub expected_payoff: String,
    pub max_turns_to_payoff: i64,
    pub depends_on: Vec<i64>,
    pub conflicts_with: Vec<i64>,
}

impl Default for NewSeed {
    fn default() -> Self {
        Self {
            description: String::new(),
            seed_type: "mystery".to_string(),
            urgency: "normal".to_string(),
            related_npcs: Vec::new(),
            expected_payoff: String::new(),
            max_turns_to_payoff: 10,
            depends_on: Vec::new(),
            conflicts_with: Vec::new(),
        }
    }
}

pub struct SeedLedger {
    campaign_id: i64,
    seeds: BTreeMap<i64, ForeshadowSeed>,
}

impl SeedLedger {
    pub async fn load(store: &Store, campaign_id: i64) -> Result<Self> {
        let seeds = store
            .seeds_for(campaign_id)
            .await?
            .into_iter()
            .map(|seed| (seed.id, seed))
            .collect();
        Ok(Self { campaign_id, seeds })
    }

    pub fn active(&self) -> Vec<&ForeshadowSeed> {
        self.seeds.values().filter(|s| s.status.is_active()).collect()
    }

    pub fn get(&self, id: i64) -> Option<&ForeshadowSeed> {
        self.seeds.get(&id)
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let planted = self
            .seeds
            .values()
            .filter(|s| s.status.is_active())
            .count();
        let ready = self
            .seeds
            .values()
            .filter(|s| s.status == SeedStatus::ReadyToResolve)
            .count();
        let overdue = self
            .seeds
            .values()
            .filter(|s| s.status == SeedStatus::Overdue)
            .count();
        (planted, ready, overdue)
    }

    /// Plant a new seed. Fails silently into a no-op (returning `None`)
    /// when a conflicting seed is still active.
    pub async fn plant(
        &mut self,
        store: &Store,
        new: NewSeed,
        turn: i64,
    ) -> Result<Option<ForeshadowSeed>> {
        let conflict_active = new.conflicts_with.iter().any(|id| {
            self.seeds
                .get(id)
                .is_some_and(|seed| seed.status.is_active())
        });
        if conflict_active {
            debug!(description = %new.description, "seed not planted, conflict active");
            return Ok(None);
        }

        let seed = store
            .insert_seed(&ForeshadowSeed {
                id: 0,
                campaign_id: self.campaign_id,
                description: new.description,
                planted_turn: turn,
                seed_type: new.seed_type,
                urgency: new.urgency,
                related_npcs: new.related_npcs,
                expected_payoff: new.expected_payoff,
                status: SeedStatus::Planted,
                max_turns_to_payoff: new.max_turns_to_payoff,
                resolution_narrative: None,
                depends_on: new.depends_on,
                triggers: Vec::new(),
                conflicts_with: new.conflicts_with,
            })
            .await?;
        info!(seed_id = seed.id, turn, "seed planted");
        self.seeds.insert(seed.id, seed.clone());
        Ok(Some(seed))
    }

    /// Move a seed along a legal edge, persisting write-through.
    pub async fn transition(
        &mut self,
        store: &Store,
        id: i64,
        to: SeedStatus,
        resolution_narrative: Option<String>,
        turn: i64,
    ) -> Result<()> {
        let (from, depends_on) = {
            let seed = self
                .seeds
                .get(&id)
                .ok_or_else(|| EngineError::IllegalSeedTransition(format!("unknown seed {id}")))?;
            (seed.status, seed.depends_on.clone())
        };

        if !is_legal_transition(from, to) {
            return Err(EngineError::IllegalSeedTransition(format!(
                "seed {id}: {from:?} -> {to:?}"
            )));
        }
        if to == SeedStatus::Resolved {
            let unresolved: Vec<i64> = depends_on
                .iter()
                .copied()
                .filter(|dep| {
                    self.seeds
                        .get(dep)
                        .is_some_and(|other| other.status != SeedStatus::Resolved)
                })
                .collect();
            if !unresolved.is_empty() {
                return Err(EngineError::IllegalSeedTransition(format!(
                    "seed {id} depends on unresolved {unresolved:?}"
                )));
            }
        }

        let seed = self.seeds.get_mut(&id).expect("checked above");
        seed.status = to;
        if resolution_narrative.is_some() {
            seed.resolution_narrative = resolution_narrative;
        }
        let snapshot = seed.clone();
        store.save_seed(&snapshot).await?;
        debug!(seed_id = id, status = ?to, "seed transition");

        // Resolution re-plants any triggered seeds.
        if to == SeedStatus::Resolved {
            for trigger_id in snapshot.triggers.clone() {
                if let Some(triggered) = self.seeds.get_mut(&trigger_id) {
                    if !triggered.status.is_active() {
                        triggered.status = SeedStatus::Planted;
                        triggered.planted_turn = turn;
                        let triggered = triggered.clone();
                        store.save_seed(&triggered).await?;
                        info!(seed_id = trigger_id, "triggered seed re-planted");
                    }
                }
            }
        }
        Ok(())
    }

    /// Detect seed references in a turn's narrative: keyword and NPC-tag
    /// overlap advances planted → mentioned; expected-payoff overlap on a
    /// ready seed resolves it with the matching excerpt.
    pub async fn detect_in_narrative(
        &mut self,
        store: &Store,
        narrative: &str,
        turn: i64,
    ) -> Result<Vec<(i64, SeedStatus)>> {
        let lowered = narrative.to_lowercase();
        let mut transitions = Vec::new();

        let candidates: Vec<(i64, SeedStatus)> = self
            .seeds
            .values()
            .filter(|s| s.status.is_active())
            .map(|s| (s.id, s.status))
            .collect();

        for (id, status) in candidates {
            let seed = self.seeds.get(&id).expect("candidate exists");
            match status {
                SeedStatus::Planted if seed_matches(seed, &lowered) => {
                    self.transition(store, id, SeedStatus::Mentioned, None, turn).await?;
                    transitions.push((id, SeedStatus::Mentioned));
                }
                SeedStatus::ReadyToResolve if payoff_matches(seed, &lowered) => {
                    let excerpt = excerpt_around(narrative, &seed.expected_payoff);
                    self.transition(store, id, SeedStatus::Resolved, Some(excerpt), turn)
                        .await?;
                    transitions.push((id, SeedStatus::Resolved));
                }
                _ => {}
            }
        }
        Ok(transitions)
    }

    /// Elevate mentioned seeds past half their payoff window to
    /// ready-to-resolve, returning current callback opportunities for
    /// Block 2.
    pub async fn callback_opportunities(
        &mut self,
        store: &Store,
        turn: i64,
    ) -> Result<Vec<ForeshadowSeed>> {
        let to_elevate: Vec<i64> = self
            .seeds
            .values()
            .filter(|s| {
                s.status == SeedStatus::Mentioned
                    && turn - s.planted_turn >= s.max_turns_to_payoff / 2
            })
            .map(|s| s.id)
            .collect();
        for id in to_elevate {
            self.transition(store, id, SeedStatus::ReadyToResolve, None, turn).await?;
        }
        Ok(self
            .seeds
            .values()
            .filter(|s| s.status == SeedStatus::ReadyToResolve)
            .cloned()
            .collect())
    }

    /// Mark seeds past their payoff window overdue. Returns how many are
    /// overdue (each contributes +0.05 tension).
    pub async fn sweep_overdue(&mut self, store: &Store, turn: i64) -> Result<usize> {
        let to_mark: Vec<i64> = self
            .seeds
            .values()
            .filter(|s| {
                s.status.is_active()
                    && s.status != SeedStatus::Overdue
                    && turn - s.planted_turn > s.max_turns_to_payoff
            })
            .map(|s| s.id)
            .collect();
        for id in to_mark {
            self.transition(store, id, SeedStatus::Overdue, None, turn).await?;
        }
        Ok(self
            .seeds
            .values()
            .filter(|s| s.status == SeedStatus::Overdue)
            .count())
    }

    /// Seeds past twice their payoff window: the next director review must
    /// resolve or abandon each.
    pub fn stale_seeds(&self, turn: i64) -> Vec<&ForeshadowSeed> {
        self.seeds
            .values()
            .filter(|s| {
                s.status.is_active() && turn - s.planted_turn >= 2 * s.max_turns_to_payoff
            })
            .collect()
    }
}

fn seed_matches(seed: &ForeshadowSeed, lowered_narrative: &str) -> bool {
    let keyword_hit = significant_words(&seed.description)
        .iter()
        .filter(|word| lowered_narrative.contains(word.as_str()))
        .count()
        >= 2;
    let npc_hit = seed
        .related_npcs
        .iter()
        .any(|npc| lowered_narrative.contains(&npc.to_lowercase()));
    keyword_hit || npc_hit
}

fn payoff_matches(seed: &ForeshadowSeed, lowered_narrative: &str) -> bool {
    significant_words(&seed.expected_payoff)
        .iter()
        .filter(|word| lowered_narrative.contains(word.as_str()))
        .count()
        >= 2
}

fn significant_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(str::to_string)
        .collect()
}

fn excerpt_around(narrative: &str, _payoff: &str) -> String {
    let excerpt: String = narrative.chars().take(240).collect();
    excerpt
}

// ── Arc gates ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ArcGateInputs {
    pub seeds_planted: usize,
    pub seeds_ready: usize,
    pub tension_level: f64,
    pub turns_in_phase: i64,
    /// A PacingDirective at override strength demands the transition.
    pub director_override: bool,
    /// Climax key moment detected in the latest narrative.
    pub key_moment: bool,
    pub urgent_seeds_active: bool,
}

/// Evaluate the current phase's gate. `Some(next)` authorizes (or forces)
/// the transition.
pub fn evaluate_arc_gate(phase: ArcPhase, inputs: &ArcGateInputs) -> Option<ArcPhase> {
    match phase {
        ArcPhase::Setup => {
            (inputs.seeds_planted >= 3 || inputs.turns_in_phase >= 5)
                .then_some(ArcPhase::RisingAction)
        }
        ArcPhase::RisingAction => {
            let organic = inputs.seeds_ready >= 1 && inputs.tension_level >= 0.7;
            (organic || inputs.turns_in_phase >= 15 || inputs.director_override)
                .then_some(ArcPhase::Climax)
        }
        ArcPhase::Climax => {
            (inputs.key_moment || inputs.turns_in_phase >= 3).then_some(ArcPhase::Resolution)
        }
        ArcPhase::Resolution => {
            (inputs.turns_in_phase >= 2 && !inputs.urgent_seeds_active)
                .then_some(ArcPhase::Epilogue)
        }
        ArcPhase::Epilogue => {
            (inputs.turns_in_phase >= 2 && !inputs.urgent_seeds_active).then_some(ArcPhase::Setup)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidm_store::Store;

    async fn ledger_with_store() -> (Store, SeedLedger, i64) {
        let store = Store::open_in_memory().await.unwrap();
        let campaign = store.create_campaign("Test", "profile").await.unwrap();
        let ledger = SeedLedger::load(&store, campaign.id).await.unwrap();
        (store, ledger, campaign.id)
    }

    fn stranger_seed() -> NewSeed {
        NewSeed {
            description: "A hooded stranger watches from the crowd".to_string(),
            expected_payoff: "The stranger finally approaches and speaks".to_string(),
            max_turns_to_payoff: 10,
            ..NewSeed::default()
        }
    }

    #[test]
    fn lifecycle_edges_are_enforced() {
        use SeedStatus::*;
        assert!(is_legal_transition(Planted, Mentioned));
        assert!(is_legal_transition(Mentioned, ReadyToResolve));
        assert!(is_legal_transition(ReadyToResolve, Resolved));
        assert!(is_legal_transition(Overdue, Abandoned));
        assert!(is_legal_transition(Overdue, Resolved));
        // Skipping states is illegal.
        assert!(!is_legal_transition(Planted, Resolved));
        assert!(!is_legal_transition(Planted, ReadyToResolve));
        assert!(!is_legal_transition(Resolved, Planted));
        assert!(!is_legal_transition(Abandoned, Mentioned));
    }

    #[tokio::test]
    async fn plant_to_resolve_walkthrough() -> anyhow::Result<()> {
        let (store, mut ledger, _) = ledger_with_store().await;
        let seed = ledger.plant(&store, stranger_seed(), 1).await?.unwrap();

        // Turn 4: narrative mentions the stranger in the crowd.
        let transitions = ledger
            .detect_in_narrative(&store, "A hooded stranger lingers in the crowd again.", 4)
            .await?;
        assert_eq!(transitions, vec![(seed.id, SeedStatus::Mentioned)]);

        // Turn 7: past half the window, it becomes a callback opportunity.
        let opportunities = ledger.callback_opportunities(&store, 7).await?;
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].status, SeedStatus::ReadyToResolve);

        // Turn 8: the payoff lands in the narrative.
        let transitions = ledger
            .detect_in_narrative(
                &store,
                "At last the stranger approaches, lowering their hood, and speaks.",
                8,
            )
            .await?;
        assert_eq!(transitions, vec![(seed.id, SeedStatus::Resolved)]);

        // Write-through: the store sees the final state + narrative.
        let persisted = store.seed(seed.id).await?;
        assert_eq!(persisted.status, SeedStatus::Resolved);
        assert!(persisted.resolution_narrative.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn direct_plant_to_resolve_is_rejected() -> anyhow::Result<()> {
        let (store, mut ledger, _) = ledger_with_store().await;
        let seed = ledger.plant(&store, stranger_seed(), 1).await?.unwrap();
        let result = ledger
            .transition(&store, seed.id, SeedStatus::Resolved, None, 2)
            .await;
        assert!(matches!(result, Err(EngineError::IllegalSeedTransition(_))));
        Ok(())
    }

    #[tokio::test]
    async fn overdue_sweep_and_stale_detection() -> anyhow::Result<()> {
        let (store, mut ledger, _) = ledger_with_store().await;
        let mut quick = stranger_seed();
        quick.max_turns_to_payoff = 5;
        let seed = ledger.plant(&store, quick, 1).await?.unwrap();

        // Turn 6: within window (1 + 5), not yet overdue.
        assert_eq!(ledger.sweep_overdue(&store, 6).await?, 0);
        // Turn 7: past the window.
        assert_eq!(ledger.sweep_overdue(&store, 7).await?, 1);
        assert_eq!(ledger.get(seed.id).unwrap().status, SeedStatus::Overdue);

        // Turn 11 = 2× window: the director must settle it.
        assert_eq!(ledger.stale_seeds(10).len(), 0);
        assert_eq!(ledger.stale_seeds(11).len(), 1);

        // Abandoning from overdue is legal and recorded.
        ledger
            .transition(
                &store,
                seed.id,
                SeedStatus::Abandoned,
                Some("The stranger slipped away unremarked.".to_string()),
                11,
            )
            .await?;
        assert_eq!(store.seed(seed.id).await?.status, SeedStatus::Abandoned);
        Ok(())
    }

    #[tokio::test]
    async fn dependent_seed_cannot_resolve_first() -> anyhow::Result<()> {
        let (store, mut ledger, _) = ledger_with_store().await;
        let gate = ledger.plant(&store, stranger_seed(), 1).await?.unwrap();
        let mut dependent = stranger_seed();
        dependent.depends_on = vec![gate.id];
        let dependent = ledger.plant(&store, dependent, 1).await?.unwrap();

        ledger
            .transition(&store, dependent.id, SeedStatus::Mentioned, None, 2)
            .await?;
        ledger
            .transition(&store, dependent.id, SeedStatus::ReadyToResolve, None, 3)
            .await?;
        let blocked = ledger
            .transition(&store, dependent.id, SeedStatus::Resolved, None, 4)
            .await;
        assert!(matches!(blocked, Err(EngineError::IllegalSeedTransition(_))));
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_seed_is_not_planted() -> anyhow::Result<()> {
        let (store, mut ledger, _) = ledger_with_store().await;
        let first = ledger.plant(&store, stranger_seed(), 1).await?.unwrap();
        let mut rival = stranger_seed();
        rival.conflicts_with = vec![first.id];

        assert!(ledger.plant(&store, rival, 2).await?.is_none());
        Ok(())
    }

    #[test]
    fn arc_gates_follow_the_predicates() {
        // Setup → rising: 3 seeds OR 5 turns.
        assert_eq!(
            evaluate_arc_gate(ArcPhase::Setup, &ArcGateInputs { seeds_planted: 3, ..Default::default() }),
            Some(ArcPhase::RisingAction)
        );
        assert_eq!(
            evaluate_arc_gate(ArcPhase::Setup, &ArcGateInputs { turns_in_phase: 5, ..Default::default() }),
            Some(ArcPhase::RisingAction)
        );
        assert_eq!(
            evaluate_arc_gate(ArcPhase::Setup, &ArcGateInputs { seeds_planted: 2, turns_in_phase: 4, ..Default::default() }),
            None
        );

        // Rising → climax: ready seed + tension, 15 turns, or override.
        assert_eq!(
            evaluate_arc_gate(
                ArcPhase::RisingAction,
                &ArcGateInputs { seeds_ready: 1, tension_level: 0.7, ..Default::default() }
            ),
            Some(ArcPhase::Climax)
        );
        assert_eq!(
            evaluate_arc_gate(
                ArcPhase::RisingAction,
                &ArcGateInputs { seeds_ready: 1, tension_level: 0.5, ..Default::default() }
            ),
            None
        );
        assert_eq!(
            evaluate_arc_gate(
                ArcPhase::RisingAction,
                &ArcGateInputs { director_override: true, ..Default::default() }
            ),
            Some(ArcPhase::Climax)
        );

        // Resolution → epilogue blocked by urgent seeds.
        assert_eq!(
            evaluate_arc_gate(
                ArcPhase::Resolution,
                &ArcGateInputs { turns_in_phase: 2, urgent_seeds_active: true, ..Default::default() }
            ),
            None
        );
        assert_eq!(
            evaluate_arc_gate(
                ArcPhase::Resolution,
                &ArcGateInputs { turns_in_phase: 2, ..Default::default() }
            ),
            Some(ArcPhase::Epilogue)
        );
    }
}
