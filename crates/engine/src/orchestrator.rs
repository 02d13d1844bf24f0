//! Turn orchestrator.
//!
//! One `Engine` per process, one active campaign at a time; `&mut self` on
//! [`Engine::play_turn`] is what serializes turns. Within a turn, Stage-A
//! agents run under `tokio::join!`; primary state commits through one
//! deferred transaction; background work is spawned after the reply and
//! never touches the player response.
//!
//! Cancellation: dropping the `play_turn` future before stage 8 commits
//! nothing — every mutation up to that point lives in the in-flight
//! `StateTransaction`. Background tasks from already-committed turns are
//! never cancelled.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use aidm_config::Settings;
use aidm_llm::{LlmRouter, PromptBlocks};
use aidm_memory::{
    DecayRate, MemoryCategory, MemoryManager, MemoryRecord, PinSource, SearchFilter, SlidingWindow,
    WindowTurn,
};
use aidm_profile::{AliasIndex, NarrativeProfile, ProfileStore};
use aidm_research::{ResearchPhase, ResearchPipeline};
use aidm_scrape::TtlCache;
use aidm_store::{
    ArcPhase, Campaign, Character, NewCharacter, NewTurn, Npc, Session, StateTransaction, Store,
    WorldState,
};

use crate::agents::{
    self, animator, combat, compactor, director, extraction, intent, outcome, production,
    relationship, scales, validator,
};
use crate::agents::{CombatResult, Intent, IntentReport, OutcomeRecord, PacingDirective, Roller};
use crate::composition::{self, EffectiveComposition};
use crate::foreshadow::{ArcGateInputs, OVERDUE_TENSION_PRESSURE, SeedLedger, evaluate_arc_gate};
use crate::guard::{GuardVerdict, ResourceGuard};
use crate::session_zero::{CharacterDraft, SessionZeroPhase, derive_power_tier};
use crate::{EngineError, Result};

const STAGE_A_TIMEOUT: Duration = Duration::from_secs(30);
const RECENT_NPC_WINDOW: i64 = 10;
const MEDIA_COST_ESTIMATE_USD: f64 = 0.08;

/// Filesystem layout under the configured data directory.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub data_dir: PathBuf,
}

impl EnginePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn db(&self) -> PathBuf {
        self.data_dir.join("aidm.db")
    }

    pub fn profiles(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    pub fn vectors(&self) -> PathBuf {
        self.data_dir.join("vector")
    }

    pub fn scrape_cache(&self) -> PathBuf {
        self.data_dir.join("cache").join("scrape.redb")
    }

    pub fn settings(&self) -> PathBuf {
        self.data_dir.join("settings.toml")
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub turn_number: i64,
    pub intent: Intent,
    pub narrative: String,
    pub outcome: Option<OutcomeRecord>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_hit_ratio: f32,
}

struct ActiveCampaign {
    campaign: Campaign,
    profile: NarrativeProfile,
    window: SlidingWindow,
    ledger: Arc<Mutex<SeedLedger>>,
    previous_composition: Option<EffectiveComposition>,
    epicness: f64,
    last_review_turn: i64,
}

pub struct Engine {
    settings: Settings,
    paths: EnginePaths,
    router: Arc<LlmRouter>,
    store: Store,
    profiles: ProfileStore,
    memory: Arc<Mutex<MemoryManager>>,
    alias: AliasIndex,
    research: ResearchPipeline,
    roller: Arc<dyn Roller>,
    /// Micro-beats queued by background analyzers for the next scene.
    queued_beats: Arc<Mutex<Vec<String>>>,
    active: Option<ActiveCampaign>,
}

impl Engine {
    pub async fn open(settings: Settings, paths: EnginePaths) -> Result<Self> {
        let router = Arc::new(LlmRouter::from_settings(&settings));
        let store = Store::open(paths.db()).await?;
        let profiles = ProfileStore::open(paths.profiles())?;
        let memory = Arc::new(Mutex::new(MemoryManager::open(paths.vectors())?));
        let cache = Arc::new(
            TtlCache::open(paths.scrape_cache())
                .map_err(|e| EngineError::Research(e.into()))?,
        );
        let alias = AliasIndex::build(&profiles.load_all()?);
        let research = ResearchPipeline::new(cache, router.clone());

        Ok(Self {
            settings,
            paths,
            router,
            store,
            profiles,
            memory,
            alias,
            research,
            roller: Arc::new(outcome::ThreadRngRoller),
            queued_beats: Arc::new(Mutex::new(Vec::new())),
            active: None,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── Session zero ─────────────────────────────────────────────────────────

    /// Resolve or research the profile for a player-named title. Known
    /// titles (via the alias index) skip research entirely.
    pub async fn prepare_profile(
        &mut self,
        title: &str,
        progress: Option<&mpsc::Sender<ResearchPhase>>,
    ) -> Result<NarrativeProfile> {
        if let Some((profile_id, kind)) = self.alias.resolve(title) {
            debug!(%profile_id, ?kind, "profile resolved from alias index");
            return Ok(self.profiles.load(&profile_id)?);
        }
        let mut memory = self.memory.lock().await;
        let profile = self
            .research
            .research(title, &self.profiles, &mut memory, progress)
            .await?;
        drop(memory);
        self.alias = AliasIndex::build(&self.profiles.load_all()?);
        Ok(profile)
    }

    /// Calibration handoff: persist campaign + character and enter play.
    pub async fn handoff(
        &mut self,
        profile: &NarrativeProfile,
        draft: &CharacterDraft,
    ) -> Result<()> {
        let power_tier = derive_power_tier(draft, profile, self.settings.game.op_tier_gap);
        let campaign = self
            .store
            .create_campaign(&format!("{} campaign", profile.name), &profile.id)
            .await?;
        self.store
            .init_world_state(campaign.id, &format!("The story opens in the world of {}.", profile.name))
            .await?;
        let character = self
            .store
            .insert_character(NewCharacter {
                campaign_id: campaign.id,
                name: draft.name.clone(),
                power_tier,
                level: 1,
                hp: 30,
                mp: 20,
                sp: 10,
                op_enabled: draft.op_enabled,
                op_tension_source: draft.op_tension_source.clone(),
                op_power_expression: draft.op_power_expression.clone(),
                op_narrative_focus: draft.op_narrative_focus.clone(),
            })
            .await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        self.store
            .save_session(&Session {
                id: session_id.clone(),
                campaign_id: Some(campaign.id),
                phase: SessionZeroPhase::Play.as_str().to_string(),
                updated_at: String::new(),
            })
            .await?;

        // Session-zero memories start at full heat.
        {
            let mut memory = self.memory.lock().await;
            memory.upsert_memory(
                MemoryRecord::new(
                    campaign.id,
                    format!(
                        "{} is the player character, tier {}{}.",
                        character.name,
                        character.power_tier,
                        if character.op_enabled { ", overwhelmingly powerful for this world" } else { "" }
                    ),
                    MemoryCategory::CharacterMoment,
                    0,
                )
                .from_session_zero()
                .plot_critical(),
            )
            .await?;
        }

        self.settings.active_profile_id = profile.id.clone();
        self.settings.active_session_id = Some(session_id.clone());
        self.settings.save_to(self.paths.settings()).ok();

        self.activate(campaign, profile.clone(), session_id).await?;
        info!(character = %character.name, tier = %character.power_tier, "handoff complete");
        Ok(())
    }

    /// Resume the campaign recorded in settings, if any.
    pub async fn resume(&mut self) -> Result<bool> {
        let Some(session_id) = self.settings.active_session_id.clone() else {
            return Ok(false);
        };
        let Some(session) = self.store.session(&session_id).await? else {
            return Ok(false);
        };
        let Some(campaign_id) = session.campaign_id else {
            return Ok(false);
        };
        let campaign = self.store.campaign(campaign_id).await?;
        let profile = self.profiles.load(&campaign.profile_id)?;

        // Rebuild the sliding window from the stored turns.
        self.activate(campaign, profile, session_id).await?;
        Ok(true)
    }

    async fn activate(
        &mut self,
        campaign: Campaign,
        profile: NarrativeProfile,
        session_id: String,
    ) -> Result<()> {
        let mut window = SlidingWindow::new(
            self.settings.memory.window_size,
            self.settings.memory.pinned_max,
        );
        let recent = self
            .store
            .recent_turns(campaign.id, self.settings.memory.window_size as i64)
            .await?;
        for turn in recent {
            window.push(WindowTurn {
                turn_number: turn.turn_number,
                player_input: turn.player_input,
                narrative: turn.narrative,
            });
        }
        let ledger = SeedLedger::load(&self.store, campaign.id).await?;
        let last_review_turn = self.store.latest_turn_number(campaign.id).await?;
        info!(session = %session_id, campaign_id = campaign.id, "session active");

        self.active = Some(ActiveCampaign {
            campaign,
            profile,
            window,
            ledger: Arc::new(Mutex::new(ledger)),
            previous_composition: None,
            epicness: 0.0,
            last_review_turn,
        });
        Ok(())
    }

    // ── The turn pipeline ────────────────────────────────────────────────────

    pub async fn play_turn(
        &mut self,
        player_input: &str,
        stream: Option<mpsc::Sender<String>>,
    ) -> Result<TurnOutput> {
        let active = self.active.as_ref().ok_or(EngineError::NoActiveCampaign)?;
        let campaign_id = active.campaign.id;

        // Stage 1 — load context.
        let character = self.store.character_for_campaign(campaign_id).await?;
        let world = self.store.world_state(campaign_id).await?;
        let bible = self.store.bible(campaign_id).await?;
        let npcs = self.store.npcs_for(campaign_id).await?;
        let npc_names: Vec<String> = npcs.iter().map(|n| n.name.clone()).collect();
        let turn_number = self.store.latest_turn_number(campaign_id).await? + 1;
        let last_narrative = self
            .active
            .as_ref()
            .and_then(|a| a.window.turns().last().map(|t| t.narrative.clone()))
            .unwrap_or_default();

        // Stage 2 — intent classification (empty input short-circuits).
        let report = intent::classify(&self.router, player_input, &npc_names).await;
        debug!(turn = turn_number, intent = report.intent.as_str(), risk = report.risk, "intent classified");

        if report.intent == Intent::Trivial {
            return self.trivial_turn(turn_number, player_input, &character).await;
        }

        // Stage 3 — parallel fan-in.
        let (hits, scale_result, mut directive) = self
            .stage_a(campaign_id, player_input, &report, &world, &bible, &last_narrative)
            .await;

        // Queued micro-beats from background analyzers ride the directive.
        {
            let mut queued = self.queued_beats.lock().await;
            directive.must_reference.append(&mut queued);
        }

        // Arc gates: the director may demand a transition; gates may
        // authorize one on their own.
        let ledger_arc = self.active.as_ref().expect("active checked").ledger.clone();
        let mut world = world;
        let phase_change = {
            let ledger = ledger_arc.lock().await;
            let (planted, ready, _) = ledger.counts();
            let urgent = ledger.active().iter().any(|s| s.urgency == "high");
            let gate_inputs = ArcGateInputs {
                seeds_planted: planted,
                seeds_ready: ready,
                tension_level: world.tension_level,
                turns_in_phase: world.turns_in_phase,
                director_override: matches!(
                    directive.strength,
                    agents::DirectiveStrength::Override
                ) && directive.requested_phase().is_some(),
                key_moment: directive.requested_phase() == Some(ArcPhase::Resolution),
                urgent_seeds_active: urgent,
            };
            directive
                .requested_phase()
                .filter(|_| {
                    matches!(
                        directive.strength,
                        agents::DirectiveStrength::Strong | agents::DirectiveStrength::Override
                    )
                })
                .or_else(|| evaluate_arc_gate(world.arc_phase, &gate_inputs))
        };
        let scene_boundary = phase_change.is_some() || turn_number == 1;
        if let Some(next_phase) = phase_change {
            info!(from = world.arc_phase.as_str(), to = next_phase.as_str(), "arc phase transition");
            world.arc_phase = next_phase;
            world.turns_in_phase = 0;
        } else {
            world.turns_in_phase += 1;
        }

        // Stages 4–5 — mechanics before narrative.
        let differential = composition::power_differential(
            world
                .threat_tier
                .as_deref()
                .unwrap_or(&self.active_profile().power_distribution.typical_tier),
            &character.power_tier,
        );
        let (combat_result, outcome_record) = self
            .resolve_mechanics(&report, &scale_result, &character, &world, differential, player_input)
            .await?;

        // Stage 6 — composition, applied only at scene boundaries.
        let profile = self.active_profile().clone();
        let next_composition =
            composition::compose(&profile, &character, world.threat_tier.as_deref());
        let effective = composition::apply_at_boundary(
            self.active.as_ref().expect("active checked").previous_composition,
            next_composition,
            scene_boundary,
        );

        // Stage 7 — key animator.
        let callbacks = {
            let mut ledger = ledger_arc.lock().await;
            ledger.callback_opportunities(&self.store, turn_number).await?
        };
        let present: Vec<Npc> = npcs
            .iter()
            .filter(|n| report.present_npcs.iter().any(|p| p.eq_ignore_ascii_case(&n.name)))
            .cloned()
            .collect();
        let excerpts = self.last_interaction_excerpts(campaign_id, &present).await;
        let voice_cards = animator::enrich_voice_cards(&profile, &present, &excerpts);

        let blocks = PromptBlocks::new(
            animator::build_stable_block(&profile, &effective),
            animator::build_session_block(&bible, &callbacks, world.arc_phase.as_str()),
            animator::build_dynamic_block(&animator::KeyAnimatorInputs {
                window_render: &self.active.as_ref().expect("active checked").window.render(),
                ranked_memories: &hits,
                intent: report.intent,
                player_input,
                outcome: outcome_record.as_ref(),
                combat: combat_result.as_ref(),
                voice_cards: &voice_cards,
                directive: &directive,
            }),
        );

        let completion = match animator::narrate(&self.router, &blocks, None, stream.clone()).await
        {
            Ok(completion) => completion,
            Err(EngineError::Llm(_)) => {
                return Err(EngineError::AnimatorSilent(
                    "The director is momentarily silent — please resend your action.".to_string(),
                ));
            }
            Err(other) => return Err(other),
        };

        // Narrative validator: one cited soft retry, second draft wins.
        let verdict = validator::check(
            &self.router,
            &completion.content,
            &present,
            &world.situation,
            &bible.active_threads,
        )
        .await;
        let completion = if verdict.consistent {
            completion
        } else {
            let cited = verdict
                .contradiction
                .unwrap_or_else(|| "state contradiction".to_string());
            warn!(%cited, "validator flagged draft, retrying animator once");
            animator::narrate(&self.router, &blocks, Some(&cited), stream).await?
        };

        // Stage 8 — atomic commit.
        let mut tx = StateTransaction::new(campaign_id);
        tx.insert_turn(NewTurn {
            campaign_id,
            turn_number,
            player_input: player_input.to_string(),
            intent: report.intent.as_str().to_string(),
            decisions: serde_json::json!({
                "scales": { "difficulty": scale_result.difficulty, "danger": scale_result.danger },
                "outcome": outcome_record,
                "combat": combat_result,
                "directive_strength": format!("{:?}", directive.strength),
            }),
            narrative: completion.content.clone(),
            prompt_tokens: completion.usage.prompt_tokens as i64,
            completion_tokens: completion.usage.completion_tokens as i64,
            cache_hit_ratio: completion.cache_hit_ratio as f64,
        });
        if let Some(combat) = &combat_result {
            tx.adjust_resources(
                character.id,
                -combat.resource_cost.hp,
                -combat.resource_cost.mp,
                -combat.resource_cost.sp,
            );
        } else if let Some(outcome) = &outcome_record {
            if let Some(cost) = &outcome.cost {
                let guard = self.guard();
                let clamped = guard.clamped_cost(&character, cost);
                tx.adjust_resources(character.id, -clamped.hp, -clamped.mp, -clamped.sp);
            }
        }
        for npc in &present {
            tx.touch_npc(npc.id, turn_number);
        }
        world.tension_level =
            (world.tension_level * 0.7 + directive.escalation_target as f64 * 0.3).clamp(0.0, 1.0);
        tx.update_world_state(world.clone());

        self.store.commit(tx, &character).await?;

        // Retrieval side effects happen only after a successful commit.
        let retrieved_ids: Vec<String> = hits
            .iter()
            .filter_map(|hit| match &hit.item {
                aidm_memory::Retrieved::Memory(m) => Some(m.id.clone()),
                aidm_memory::Retrieved::Lore(_) => None,
            })
            .collect();
        {
            let mut memory = self.memory.lock().await;
            memory.boost_retrieved(&retrieved_ids, turn_number).await?;
        }

        // Stage 9 — window upkeep and epicness accounting. The review
        // decision is made here (where the counters live) and handed to the
        // background task.
        let (rolled_off, review_due) = {
            let active = self.active.as_mut().expect("active checked");
            active.previous_composition = Some(effective);
            active.epicness += scale_result.narrative_weight as f64 / 5.0;
            let review_due = director::should_review(
                active.epicness,
                false,
                turn_number - active.last_review_turn,
            );
            if review_due {
                active.last_review_turn = turn_number;
                active.epicness = 0.0;
            }
            let rolled = active.window.push(WindowTurn {
                turn_number,
                player_input: player_input.to_string(),
                narrative: completion.content.clone(),
            });
            (rolled, review_due)
        };

        // Stage 10 — background fan-out, fire-and-forget.
        self.spawn_background(
            turn_number,
            completion.content.clone(),
            present,
            rolled_off,
            review_due,
        );

        Ok(TurnOutput {
            turn_number,
            intent: report.intent,
            narrative: completion.content,
            outcome: outcome_record,
            prompt_tokens: completion.usage.prompt_tokens,
            completion_tokens: completion.usage.completion_tokens,
            cache_hit_ratio: completion.cache_hit_ratio,
        })
    }

    /// Fast path: no judge, no scales, no mechanical state change.
    async fn trivial_turn(
        &mut self,
        turn_number: i64,
        player_input: &str,
        character: &Character,
    ) -> Result<TurnOutput> {
        let narrative = "A quiet beat passes; the world waits for you to act.".to_string();
        let mut tx = StateTransaction::new(character.campaign_id);
        tx.insert_turn(NewTurn {
            campaign_id: character.campaign_id,
            turn_number,
            player_input: player_input.to_string(),
            intent: Intent::Trivial.as_str().to_string(),
            decisions: serde_json::json!({}),
            narrative: narrative.clone(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_hit_ratio: 0.0,
        });
        self.store.commit(tx, character).await?;
        if let Some(active) = self.active.as_mut() {
            active.window.push(WindowTurn {
                turn_number,
                player_input: player_input.to_string(),
                narrative: narrative.clone(),
            });
        }
        Ok(TurnOutput {
            turn_number,
            intent: Intent::Trivial,
            narrative,
            outcome: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_hit_ratio: 0.0,
        })
    }

    /// Stage A: memory retrieval, scale selection, and the director
    /// micro-check run concurrently; each degrades independently on
    /// timeout.
    async fn stage_a(
        &self,
        campaign_id: i64,
        player_input: &str,
        report: &IntentReport,
        world: &WorldState,
        bible: &aidm_store::CampaignBible,
        last_narrative: &str,
    ) -> (Vec<aidm_memory::RankedHit>, scales::ScaleResult, PacingDirective) {
        let profile_id = self.active_profile().id.clone();
        let retrieval = async {
            let query_embedding = self.router.embed(player_input).await.ok().filter(|v| !v.is_empty());
            let memory = self.memory.lock().await;
            memory.search(
                player_input,
                &SearchFilter {
                    campaign_id,
                    profile_id,
                    page_type: report.intent.page_type_filter().map(str::to_string),
                    query_embedding,
                    top_n: self.settings.memory.retrieval_top_n,
                },
            )
        };
        let scale_selection = async {
            if report.intent.is_mechanical() {
                scales::select_scales(&self.router, player_input, report, &world.situation).await
            } else {
                scales::ScaleResult::neutral()
            }
        };
        let micro = director::micro_check(&self.router, bible, world, last_narrative, player_input);

        let (hits, scale_result, directive) = tokio::join!(
            tokio::time::timeout(STAGE_A_TIMEOUT, retrieval),
            tokio::time::timeout(STAGE_A_TIMEOUT, scale_selection),
            tokio::time::timeout(STAGE_A_TIMEOUT, micro),
        );
        (
            hits.unwrap_or_default(),
            scale_result.unwrap_or_else(|_| scales::ScaleResult::neutral()),
            directive.unwrap_or_else(|_| PacingDirective::neutral()),
        )
    }

    /// Stages 4–5: combat pre-resolution or outcome judging, with the
    /// resource guard applied to the judged cost.
    async fn resolve_mechanics(
        &self,
        report: &IntentReport,
        scale_result: &scales::ScaleResult,
        character: &Character,
        world: &WorldState,
        differential: i64,
        player_input: &str,
    ) -> Result<(Option<CombatResult>, Option<OutcomeRecord>)> {
        if report.intent == Intent::Combat {
            let threat_tier = world
                .threat_tier
                .clone()
                .unwrap_or_else(|| self.active_profile().power_distribution.typical_tier.clone());
            let result = combat::resolve(
                &self.router,
                &combat::CombatContext {
                    character,
                    threat_tier: &threat_tier,
                    combat_style: self.active_profile().combat_style,
                    player_input,
                },
                self.roller.as_ref(),
            )
            .await;
            return Ok((Some(result), None));
        }

        if !report.intent.is_mechanical() {
            return Ok((None, None));
        }

        let relationship_modifier = 0; // applied per-NPC by the judge's caller when targeted
        let mut record = outcome::judge(
            &outcome::JudgeInputs {
                intent: report.intent,
                risk: report.risk,
                scales: *scale_result,
                differential,
                op_enabled: character.op_enabled,
                relationship_modifier,
                overdrawn: false,
            },
            self.roller.as_ref(),
        );

        if let Some(cost) = &record.cost {
            match self.guard().check(character, cost)? {
                GuardVerdict::Affordable => {}
                GuardVerdict::Overdrawn => {
                    record.consequence = Some(
                        "The character is overdrawn; the effort visibly costs more than they had to give."
                            .to_string(),
                    );
                }
            }
        }
        Ok((None, Some(record)))
    }

    fn guard(&self) -> ResourceGuard {
        ResourceGuard {
            narrative_override: self.settings.game.narrative_override_resources,
        }
    }

    fn active_profile(&self) -> &NarrativeProfile {
        &self.active.as_ref().expect("caller checked active").profile
    }

    async fn last_interaction_excerpts(
        &self,
        campaign_id: i64,
        present: &[Npc],
    ) -> BTreeMap<i64, String> {
        let mut excerpts = BTreeMap::new();
        for npc in present.iter().take(3) {
            if let Ok(turns) = self.store.search_narrative(campaign_id, &npc.name, 1).await {
                if let Some(turn) = turns.first() {
                    let excerpt: String = turn.narrative.chars().take(160).collect();
                    excerpts.insert(npc.id, excerpt);
                }
            }
        }
        excerpts
    }

    // ── Background fan-out ───────────────────────────────────────────────────

    fn spawn_background(
        &self,
        turn_number: i64,
        narrative: String,
        present: Vec<Npc>,
        rolled_off: Option<WindowTurn>,
        review_due: bool,
    ) {
        let active = self.active.as_ref().expect("caller checked active");
        let ctx = BackgroundCtx {
            router: self.router.clone(),
            store: self.store.clone(),
            memory: self.memory.clone(),
            ledger: active.ledger.clone(),
            queued_beats: self.queued_beats.clone(),
            campaign_id: active.campaign.id,
            turn_number,
            narrative,
            present,
            rolled_off,
            media_enabled: self.settings.media.enabled,
            media_budget_usd: self.settings.media.budget_per_session_usd,
            compaction_interval: self.settings.memory.compaction_interval as i64,
            review_due,
        };
        tokio::spawn(async move {
            if let Err(err) = run_background(ctx).await {
                warn!(error = %err, "background fan-out error (isolated)");
            }
        });
    }

    // ── Pinning, recall, reset ───────────────────────────────────────────────

    /// Player-flagged pin of a past exchange.
    pub async fn pin_exchange_player(&mut self, turn_number: i64) -> Result<()> {
        self.pin_exchange(turn_number, PinSource::Player).await
    }

    /// Director-flagged pin of a past exchange.
    pub async fn pin_exchange_director(&mut self, turn_number: i64) -> Result<()> {
        self.pin_exchange(turn_number, PinSource::Director).await
    }

    async fn pin_exchange(&mut self, turn_number: i64, source: PinSource) -> Result<()> {
        let active = self.active.as_mut().ok_or(EngineError::NoActiveCampaign)?;
        let turns = self.store.recent_turns(active.campaign.id, i64::MAX).await?;
        let turn = turns
            .into_iter()
            .find(|t| t.turn_number == turn_number)
            .ok_or_else(|| {
                EngineError::Store(aidm_store::StoreError::NotFound(format!(
                    "turn {turn_number}"
                )))
            })?;
        active.window.pin(
            WindowTurn {
                turn_number: turn.turn_number,
                player_input: turn.player_input,
                narrative: turn.narrative,
            },
            source,
        );
        Ok(())
    }

    /// Deep recall: verbatim excerpts from past turns, by keyword.
    pub async fn recall_scene(&self, keyword: &str) -> Result<Vec<String>> {
        let active = self.active.as_ref().ok_or(EngineError::NoActiveCampaign)?;
        let turns = self.store.search_narrative(active.campaign.id, keyword, 3).await?;
        Ok(turns
            .into_iter()
            .map(|t| {
                let excerpt: String = t.narrative.chars().take(400).collect();
                format!("[turn {}] {excerpt}", t.turn_number)
            })
            .collect())
    }

    /// Settings reset: purge all per-campaign state. Profile documents and
    /// lore chunks are shared canonical assets and survive.
    pub async fn reset(&mut self) -> Result<()> {
        let campaign_ids: Vec<i64> = self.store.campaigns().await?.iter().map(|c| c.id).collect();
        self.store.reset_all().await?;
        {
            let mut memory = self.memory.lock().await;
            for campaign_id in campaign_ids {
                memory.delete_campaign_memories(campaign_id).await?;
            }
        }
        self.settings.reset_active();
        self.settings.save_to(self.paths.settings()).ok();
        self.active = None;
        info!("reset complete, profiles preserved");
        Ok(())
    }
}

// ── The background task ──────────────────────────────────────────────────────

struct BackgroundCtx {
    router: Arc<LlmRouter>,
    store: Store,
    memory: Arc<Mutex<MemoryManager>>,
    ledger: Arc<Mutex<SeedLedger>>,
    queued_beats: Arc<Mutex<Vec<String>>>,
    campaign_id: i64,
    turn_number: i64,
    narrative: String,
    present: Vec<Npc>,
    rolled_off: Option<WindowTurn>,
    media_enabled: bool,
    media_budget_usd: f64,
    compaction_interval: i64,
    review_due: bool,
}

/// Everything after the reply: extraction, foreshadowing, production,
/// relationships, overdue pressure, heat upkeep, compaction, and the
/// director's post-review. Failures are logged, isolated, and tagged with
/// the originating turn so out-of-order completion stays idempotent.
async fn run_background(ctx: BackgroundCtx) -> Result<()> {
    let BackgroundCtx {
        router,
        store,
        memory,
        ledger,
        queued_beats,
        campaign_id,
        turn_number,
        narrative,
        present,
        rolled_off,
        media_enabled,
        media_budget_usd,
        compaction_interval,
        review_due,
    } = ctx;

    // Entity extraction + narrative-beat indexing.
    let known_npcs: Vec<String> = store
        .npcs_for(campaign_id)
        .await?
        .iter()
        .map(|n| n.name.clone())
        .collect();
    let known_locations: Vec<String> = store
        .locations_for(campaign_id)
        .await?
        .iter()
        .map(|l| l.name.clone())
        .collect();
    let extraction = extraction::extract(&router, &narrative, &known_npcs, &known_locations).await;
    for npc in &extraction.new_npcs {
        let mut row = store.upsert_npc(campaign_id, &npc.name).await?;
        row.notes = npc.note.clone();
        row.last_appeared = turn_number;
        store.save_npc(&row).await?;
    }
    for faction in &extraction.new_factions {
        store.upsert_faction(campaign_id, &faction.name, &faction.description).await?;
    }
    for location in &extraction.new_locations {
        store.upsert_location(campaign_id, &location.name, &location.description).await?;
    }
    for beat in &extraction.beats {
        let mut record = MemoryRecord::new(
            campaign_id,
            beat.text.clone(),
            MemoryCategory::NarrativeBeat,
            turn_number,
        )
        .with_decay(DecayRate::Slow)
        .tagged(beat.tagged_npcs.clone(), beat.tagged_locations.clone());
        if extraction.plot_critical {
            record = record.plot_critical();
        }
        store
            .enqueue_memory(campaign_id, turn_number, &serde_json::to_value(&record)?)
            .await?;
    }

    // Foreshadowing detection over the committed narrative.
    {
        let mut ledger = ledger.lock().await;
        ledger.detect_in_narrative(&store, &narrative, turn_number).await?;
    }

    // Production agent tool round.
    {
        let bible = store.bible(campaign_id).await?;
        let spent = store.media_cost_for(campaign_id).await?;
        let mut ledger_guard = ledger.lock().await;
        let _ = production::run(
            &router,
            &store,
            &mut ledger_guard,
            campaign_id,
            turn_number,
            &narrative,
            &bible.active_threads,
            production::MediaBudget {
                enabled: media_enabled,
                budget_usd: media_budget_usd,
                spent_usd: spent,
                estimated_cost_usd: MEDIA_COST_ESTIMATE_USD,
            },
        )
        .await;
    }

    // Relationship analyzer + stage-transition micro-beats.
    let updates = relationship::analyze(&router, &narrative, &present).await;
    for update in updates {
        let mut npc = store.npc(update.npc_id).await?;
        for milestone in update.new_milestones {
            if !npc.milestones.contains(&milestone) {
                npc.milestones.push(milestone);
            }
        }
        if let Some(stage) = update.stage_transition {
            npc.intelligence_stage = stage;
            queued_beats
                .lock()
                .await
                .push(relationship::stage_transition_beat(&npc.name, stage));
        }
        store.save_npc(&npc).await?;
    }

    // Overdue-seed pressure on world tension.
    {
        let mut ledger = ledger.lock().await;
        let overdue = ledger.sweep_overdue(&store, turn_number).await?;
        if overdue > 0 {
            let mut world = store.world_state(campaign_id).await?;
            world.tension_level =
                (world.tension_level + overdue as f64 * OVERDUE_TENSION_PRESSURE).min(1.0);
            store.save_world_state(&world).await?;
        }
    }

    // Heat upkeep: decay, milestone floors, NPC sweep, then drain the
    // pending queue into the vector store with idempotent upserts.
    {
        let npcs = store.npcs_for(campaign_id).await?;
        let milestone_npcs: BTreeSet<String> = npcs
            .iter()
            .filter(|n| n.milestones.iter().any(|m| m.starts_with("first_")))
            .map(|n| n.name.clone())
            .collect();
        let recent_npcs: BTreeSet<String> = npcs
            .iter()
            .filter(|n| turn_number - n.last_appeared <= RECENT_NPC_WINDOW)
            .map(|n| n.name.clone())
            .collect();

        let mut memory = memory.lock().await;
        memory.decay_turn(&milestone_npcs).await?;
        memory.npc_interaction_sweep(&recent_npcs).await?;

        let pending = store.drain_pending(64).await?;
        for item in pending {
            match serde_json::from_value::<MemoryRecord>(item.payload.clone()) {
                Ok(record) => {
                    if let Err(err) = memory.upsert_memory(record).await {
                        warn!(error = %err, "vector upsert failed, requeueing");
                        store.requeue_memory(&item).await?;
                    }
                }
                Err(err) => warn!(error = %err, "unreadable pending memory dropped"),
            }
        }
    }

    // Roll-off summary for the sliding window's tail.
    if let Some(turn) = rolled_off {
        let summary = compactor::summarize_rolloff(&router, &turn).await;
        store
            .enqueue_memory(
                campaign_id,
                turn_number,
                &serde_json::to_value(&MemoryRecord::new(
                    campaign_id,
                    summary,
                    MemoryCategory::Event,
                    turn.turn_number,
                ))?,
            )
            .await?;
    }

    // Compaction cycle.
    if compaction_interval > 0 && turn_number % compaction_interval == 0 {
        let groups = {
            let memory = memory.lock().await;
            memory.cold_groups(campaign_id)
        };
        for group in groups {
            let summary = compactor::summarize_cluster(&router, &group.cluster_key, &group.texts).await;
            let mut memory = memory.lock().await;
            memory
                .apply_compression(campaign_id, &group, summary, turn_number)
                .await?;
        }
    }

    // Director post-review: the orchestrator's hybrid-trigger decision,
    // plus a forced pass whenever stale seeds demand settling.
    let stale_seeds_pending = {
        let ledger = ledger.lock().await;
        !ledger.stale_seeds(turn_number).is_empty()
    };
    if review_due || stale_seeds_pending {
        run_post_review(&router, &store, &ledger, &queued_beats, campaign_id, turn_number).await?;
    }

    debug!(turn = turn_number, "background fan-out complete");
    Ok(())
}

async fn run_post_review(
    router: &LlmRouter,
    store: &Store,
    ledger: &Arc<Mutex<SeedLedger>>,
    queued_beats: &Arc<Mutex<Vec<String>>>,
    campaign_id: i64,
    turn_number: i64,
) -> Result<()> {
    let world = store.world_state(campaign_id).await?;
    let recent = store.recent_turns(campaign_id, 6).await?;
    let recent_narratives: String = recent
        .iter()
        .map(|t| format!("[turn {}] {}\n", t.turn_number, t.narrative))
        .collect();
    let mut bible = store.bible(campaign_id).await?;

    // Seeds at twice their payoff window MUST settle now.
    {
        let mut ledger = ledger.lock().await;
        let stale: Vec<i64> = ledger.stale_seeds(turn_number).iter().map(|s| s.id).collect();
        for id in stale {
            let seed_status = ledger.get(id).map(|s| s.status);
            // Overdue seeds resolve or abandon; anything not yet overdue is
            // first marked overdue, then abandoned.
            if seed_status != Some(aidm_store::SeedStatus::Overdue) {
                let _ = ledger
                    .transition(store, id, aidm_store::SeedStatus::Overdue, None, turn_number)
                    .await;
            }
            let _ = ledger
                .transition(
                    store,
                    id,
                    aidm_store::SeedStatus::Abandoned,
                    Some("The thread quietly slipped out of the story.".to_string()),
                    turn_number,
                )
                .await;
        }
    }

    if let Some(review) = director::post_review(router, &bible, &world, &recent_narratives).await {
        bible.push_arc_entry(aidm_store::ArcEntry {
            turn_number,
            summary: review.arc_summary,
        });
        bible.active_threads = review.active_threads;
        bible
            .resolved_threads
            .extend(review.resolved_threads.into_iter());
        bible
            .world_state_changelog
            .push(format!("turn {turn_number}: {}", review.situation));
        bible.bible_version += 1;
        store.save_bible(&bible).await?;

        let mut world = world;
        world.situation = review.situation;
        store.save_world_state(&world).await?;

        // Spotlight rebalancing notes surface as soft references in the
        // next scene's directive.
        queued_beats.lock().await.extend(review.spotlight_notes);

        // Seed recommendations route through the production agent's tool
        // surface semantics: plant directly on the ledger.
        let mut ledger = ledger.lock().await;
        for rec in review.seed_recommendations.into_iter().take(2) {
            let _ = ledger
                .plant(
                    store,
                    crate::foreshadow::NewSeed {
                        description: rec.description,
                        expected_payoff: rec.expected_payoff,
                        max_turns_to_payoff: rec.max_turns_to_payoff.max(3),
                        related_npcs: rec.related_npcs,
                        ..Default::default()
                    },
                    turn_number,
                )
                .await;
        }
        info!(turn = turn_number, version = bible.bible_version, "bible updated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::sample_profile;

    async fn engine_with_tempdir() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let paths = EnginePaths::new(dir.path());
        let engine = Engine::open(Settings::default(), paths).await.unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn handoff_derives_op_tier_and_persists_everything() -> anyhow::Result<()> {
        let (_dir, mut engine) = engine_with_tempdir().await;
        let profile = sample_profile("frieren_beyond_journeys_end");
        engine.profiles.save(&profile)?;

        let draft = CharacterDraft {
            name: "Aster".to_string(),
            power_tier: None,
            op_enabled: true,
            op_tension_source: Some("existential".to_string()),
            op_power_expression: Some("passive".to_string()),
            op_narrative_focus: None,
        };
        engine.handoff(&profile, &draft).await?;

        let campaigns = engine.store.campaigns().await?;
        assert_eq!(campaigns.len(), 1);
        let character = engine.store.character_for_campaign(campaigns[0].id).await?;
        // Typical T7 − gap 4 = T3; never a silent hardcoded tier.
        assert_eq!(character.power_tier, "T3");
        assert!(character.op_enabled);
        assert_eq!(engine.settings.active_profile_id, profile.id);

        // The session-zero memory is pinned at full heat.
        let memory = engine.memory.lock().await;
        let records = memory.memories_for(campaigns[0].id);
        assert_eq!(records.len(), 1);
        assert!(records[0].plot_critical);
        Ok(())
    }

    #[tokio::test]
    async fn reset_purges_campaign_state_but_preserves_profiles() -> anyhow::Result<()> {
        let (_dir, mut engine) = engine_with_tempdir().await;
        let profile = sample_profile("frieren_beyond_journeys_end");
        engine.profiles.save(&profile)?;
        {
            let mut memory = engine.memory.lock().await;
            memory
                .upsert_lore(aidm_memory::LoreChunk {
                    id: aidm_memory::LoreChunk::stable_id(&profile.id, "CHARACTER", "Fern"),
                    profile_id: profile.id.clone(),
                    page_type: "CHARACTER".to_string(),
                    page_title: "Fern".to_string(),
                    text: "Fern is Frieren's apprentice.".to_string(),
                    embedding: None,
                })
                .await?;
        }

        engine
            .handoff(&profile, &CharacterDraft { name: "Aster".to_string(), ..Default::default() })
            .await?;
        assert_eq!(engine.store.campaigns().await?.len(), 1);

        engine.reset().await?;

        assert_eq!(engine.store.campaigns().await?.len(), 0);
        assert!(engine.settings.active_profile_id.is_empty());
        assert!(engine.settings.active_session_id.is_none());
        // Profile document AND lore chunks unchanged.
        assert!(engine.profiles.exists(&profile.id));
        let memory = engine.memory.lock().await;
        assert_eq!(memory.stats().lore_chunks, 1);
        assert_eq!(memory.stats().memories, 0);
        Ok(())
    }

    #[tokio::test]
    async fn resume_restores_the_active_campaign_window() -> anyhow::Result<()> {
        let (_dir, mut engine) = engine_with_tempdir().await;
        let profile = sample_profile("frieren_beyond_journeys_end");
        engine.profiles.save(&profile)?;
        engine
            .handoff(&profile, &CharacterDraft { name: "Aster".to_string(), ..Default::default() })
            .await?;
        let campaign_id = engine.store.campaigns().await?[0].id;
        let character = engine.store.character_for_campaign(campaign_id).await?;

        let mut tx = StateTransaction::new(campaign_id);
        tx.insert_turn(NewTurn {
            campaign_id,
            turn_number: 1,
            player_input: "look".to_string(),
            intent: "exploration".to_string(),
            decisions: serde_json::json!({}),
            narrative: "The village square is quiet.".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_hit_ratio: 0.0,
        });
        engine.store.commit(tx, &character).await?;

        engine.active = None;
        assert!(engine.resume().await?);
        let active = engine.active.as_ref().unwrap();
        assert_eq!(active.window.len(), 1);
        assert_eq!(active.campaign.id, campaign_id);
        Ok(())
    }

    #[tokio::test]
    async fn pinning_requires_an_existing_turn() -> anyhow::Result<()> {
        let (_dir, mut engine) = engine_with_tempdir().await;
        let profile = sample_profile("frieren_beyond_journeys_end");
        engine.profiles.save(&profile)?;
        engine
            .handoff(&profile, &CharacterDraft { name: "Aster".to_string(), ..Default::default() })
            .await?;

        assert!(engine.pin_exchange_player(99).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn recall_scene_finds_keyword_excerpts() -> anyhow::Result<()> {
        let (_dir, mut engine) = engine_with_tempdir().await;
        let profile = sample_profile("frieren_beyond_journeys_end");
        engine.profiles.save(&profile)?;
        engine
            .handoff(&profile, &CharacterDraft { name: "Aster".to_string(), ..Default::default() })
            .await?;
        let campaign_id = engine.store.campaigns().await?[0].id;
        let character = engine.store.character_for_campaign(campaign_id).await?;

        let mut tx = StateTransaction::new(campaign_id);
        tx.insert_turn(NewTurn {
            campaign_id,
            turn_number: 1,
            player_input: "visit the lighthouse".to_string(),
            intent: "exploration".to_string(),
            decisions: serde_json::json!({}),
            narrative: "The lighthouse keeper nods as you climb the stairs.".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_hit_ratio: 0.0,
        });
        engine.store.commit(tx, &character).await?;

        let excerpts = engine.recall_scene("lighthouse").await?;
        assert_eq!(excerpts.len(), 1);
        assert!(excerpts[0].contains("[turn 1]"));
        Ok(())
    }

    #[tokio::test]
    async fn play_turn_without_campaign_is_an_error() {
        let (_dir, mut engine) = engine_with_tempdir().await;
        let result = engine.play_turn("hello", None).await;
        assert!(matches!(result, Err(EngineError::NoActiveCampaign)));
    }
}
