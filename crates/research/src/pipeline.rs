//! The research pipeline itself.
//!
//! Phases: AniList resolution (with sequential-season merge) → Fandom
//! harvest → four interpretation calls → persistence and lore indexing.
//! Each phase degrades independently; only a Call-1 failure aborts the run
//! with nothing persisted.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use aidm_llm::{AgentCall, LlmRouter};
use aidm_memory::{LoreChunk, MemoryManager};
use aidm_profile::{
    Composition, NarrativeProfile, ProfileStore, normalize_voice_key, slugify,
};
use aidm_scrape::{AniListClient, FandomClient, MediaEntry, ScrapeError, TtlCache, pick_best_match};

use crate::interpret::{
    self, NarrativeSynthesis, PowerSystemExtraction, RESEARCH_AGENT, StructuralDials,
    VoiceCardExtraction,
};
use crate::merge::{MergedSeries, is_sequential_relation, merge_sequential};
use crate::validate::validate_scraped;
use crate::{ResearchError, Result};

const CALL_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_SEASON_FETCHES: usize = 6;
const MAIN_CAST_SIZE: usize = 6;

/// Progress phases streamed to session zero while research runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchPhase {
    Resolving,
    DiscoveringWiki,
    HarvestingLore,
    InterpretingDna,
    ExtractingPowers,
    MiningVoices,
    SynthesizingVoice,
    Persisting,
}

impl ResearchPhase {
    pub fn description(self) -> &'static str {
        match self {
            ResearchPhase::Resolving => "resolving series",
            ResearchPhase::DiscoveringWiki => "discovering wiki",
            ResearchPhase::HarvestingLore => "harvesting lore",
            ResearchPhase::InterpretingDna => "interpreting DNA",
            ResearchPhase::ExtractingPowers => "extracting power system",
            ResearchPhase::MiningVoices => "mining character voices",
            ResearchPhase::SynthesizingVoice => "synthesizing voice",
            ResearchPhase::Persisting => "persisting profile",
        }
    }
}

/// One `## [PAGE_TYPE] Title` section of harvested lore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoreSection {
    pub page_type: String,
    pub page_title: String,
    pub text: String,
}

/// Split harvested `raw_content` on its section headers. The inverse of
/// the Fandom harvester's chunk assembly.
pub fn chunk_raw_content(raw_content: &str) -> Vec<LoreSection> {
    let mut sections = Vec::new();
    let mut current: Option<LoreSection> = None;

    for line in raw_content.lines() {
        if let Some(rest) = line.strip_prefix("## [") {
            if let Some((tag, title)) = rest.split_once("] ") {
                if let Some(section) = current.take() {
                    if !section.text.trim().is_empty() {
                        sections.push(section);
                    }
                }
                current = Some(LoreSection {
                    page_type: tag.to_string(),
                    page_title: title.trim().to_string(),
                    text: String::new(),
                });
                continue;
            }
        }
        if let Some(section) = &mut current {
            section.text.push_str(line);
            section.text.push('\n');
        }
    }
    if let Some(section) = current {
        if !section.text.trim().is_empty() {
            sections.push(section);
        }
    }
    for section in &mut sections {
        section.text = section.text.trim().to_string();
    }
    sections
}

pub struct ResearchPipeline {
    anilist: AniListClient,
    fandom: FandomClient,
    router: Arc<LlmRouter>,
}

impl ResearchPipeline {
    pub fn new(cache: Arc<TtlCache>, router: Arc<LlmRouter>) -> Self {
        Self {
            anilist: AniListClient::new(cache.clone()),
            fandom: FandomClient::new(cache),
            router,
        }
    }

    /// Run the full pipeline for a player-entered title.
    pub async fn research(
        &self,
        title: &str,
        profiles: &ProfileStore,
        memory: &mut MemoryManager,
        progress: Option<&mpsc::Sender<ResearchPhase>>,
    ) -> Result<NarrativeProfile> {
        report(progress, ResearchPhase::Resolving).await;
        let merged = self.resolve(title).await?;
        info!(name = %merged.name, seasons = merged.anilist_ids.len(), "series resolved");

        report(progress, ResearchPhase::DiscoveringWiki).await;
        let raw_content = self.harvest(&merged, progress).await;
        let validation = validate_scraped(&raw_content);
        let sections = chunk_raw_content(&raw_content);

        let lore_summary = join_sections(&sections, &["WORLDBUILDING", "ARC", "LOCATION"], 3000);
        let technique_lore = join_sections(&sections, &["TECHNIQUE"], 6000);
        let character_sections: Vec<(String, String)> = sections
            .iter()
            .filter(|s| s.page_type == "CHARACTER")
            .map(|s| (s.page_title.clone(), s.text.clone()))
            .collect();
        let character_lore = join_sections(&sections, &["CHARACTER"], 6000);

        // Call 1 — structural dials. The only call whose failure aborts.
        report(progress, ResearchPhase::InterpretingDna).await;
        let dials: StructuralDials = self
            .schema_call(interpret::structural_prompt(&merged, &lore_summary))
            .await
            .map_err(|err| ResearchError::Failed(format!("structural dials: {err}")))?;
        let mut needs_review = validation.needs_review();

        // Call 2 — power system.
        report(progress, ResearchPhase::ExtractingPowers).await;
        let power_system = match self
            .schema_call::<PowerSystemExtraction>(interpret::power_system_prompt(
                &merged,
                &technique_lore,
            ))
            .await
        {
            Ok(extraction) => extraction.power_system,
            Err(err) => {
                warn!(error = %err, "power-system call degraded to fallback");
                needs_review = true;
                interpret::fallback_power_system(&merged)
            }
        };

        // Call 3 — voice cards, wiki-mined plus main-cast synthesis.
        report(progress, ResearchPhase::MiningVoices).await;
        let main_cast = interpret::main_cast_by_page_length(
            &character_sections,
            &merged.characters,
            MAIN_CAST_SIZE,
        );
        let voice_cards = match self
            .schema_call::<VoiceCardExtraction>(interpret::voice_cards_prompt(
                &merged,
                &character_lore,
                &main_cast,
            ))
            .await
        {
            Ok(extraction) => extraction
                .voice_cards
                .into_iter()
                .map(|(key, card)| (normalize_voice_key(&key), card))
                .collect(),
            Err(err) => {
                warn!(error = %err, "voice-card call degraded to empty set");
                needs_review = true;
                Default::default()
            }
        };

        // Call 4 — narrative synthesis, template fallback.
        report(progress, ResearchPhase::SynthesizingVoice).await;
        let synthesis = match self
            .schema_call::<NarrativeSynthesis>(interpret::synthesis_prompt(
                &merged,
                &dials,
                &power_system,
            ))
            .await
        {
            Ok(synthesis) => synthesis,
            Err(err) => {
                warn!(error = %err, "synthesis call degraded to DNA template");
                needs_review = true;
                interpret::fallback_synthesis(&merged, &dials)
            }
        };

        report(progress, ResearchPhase::Persisting).await;
        let tropes: BTreeSet<_> = dials.storytelling_tropes.iter().copied().collect();
        let composition = Composition::derive_from_dna(&dials.dna_scales, &tropes);
        let profile = NarrativeProfile {
            id: slugify(&merged.name),
            name: merged.name.clone(),
            aliases: vec![merged.series_group.replace('_', " ")],
            romanized_title: merged.romanized_title.clone(),
            native_title: merged.native_title.clone(),
            status: merged.status,
            series_group: merged.series_group.clone(),
            series_position: merged.series_position,
            dna_scales: dials.dna_scales,
            tone: dials.tone,
            storytelling_tropes: tropes,
            combat_style: dials.combat_style,
            power_system,
            power_distribution: dials.power_distribution,
            detected_genres: merged.genres.clone(),
            voice_cards,
            author_voice: synthesis.author_voice,
            director_personality: synthesis.director_personality,
            pacing_style: synthesis.pacing_style,
            composition,
            needs_review,
        };

        profiles.save(&profile)?;
        self.index_lore(&profile.id, &sections, memory).await?;
        info!(
            profile_id = %profile.id,
            lore_chunks = sections.len(),
            needs_review,
            "research complete"
        );
        Ok(profile)
    }

    /// AniList resolution: paged search, format-aware pick, then a 2-hop
    /// walk over SEQUEL/PREQUEL relations to collect mergeable seasons.
    async fn resolve(&self, title: &str) -> Result<MergedSeries> {
        let entries = self.anilist.search(title).await?;
        let best = pick_best_match(&entries)
            .ok_or_else(|| ScrapeError::NotFound(format!("no match for '{title}'")))?;
        let root = self.anilist.fetch_by_id(best.id).await?;

        let mut seen = BTreeSet::from([root.id]);
        let mut seasons: Vec<MediaEntry> = Vec::new();
        let mut frontier: Vec<i64> = root
            .relations
            .iter()
            .filter(|rel| is_sequential_relation(&rel.relation_type))
            .map(|rel| rel.id)
            .collect();

        for _hop in 0..2 {
            let mut next_frontier = Vec::new();
            for id in frontier.drain(..) {
                if !seen.insert(id) || seasons.len() >= MAX_SEASON_FETCHES {
                    continue;
                }
                match self.anilist.fetch_by_id(id).await {
                    Ok(entry) => {
                        next_frontier.extend(
                            entry
                                .relations
                                .iter()
                                .filter(|rel| is_sequential_relation(&rel.relation_type))
                                .map(|rel| rel.id),
                        );
                        seasons.push(entry);
                    }
                    Err(err) => warn!(id, error = %err, "season fetch failed, skipping"),
                }
            }
            frontier = next_frontier;
        }

        Ok(merge_sequential(&root, &seasons))
    }

    async fn harvest(
        &self,
        merged: &MergedSeries,
        progress: Option<&mpsc::Sender<ResearchPhase>>,
    ) -> String {
        let mut titles = vec![merged.name.clone()];
        if let Some(romanized) = &merged.romanized_title {
            titles.push(romanized.clone());
        }
        match self.fandom.discover(&titles).await {
            Ok(wiki) => {
                report(progress, ResearchPhase::HarvestingLore).await;
                let ongoing = merged.status == aidm_profile::ReleaseStatus::Releasing;
                match self.fandom.harvest(&wiki, ongoing).await {
                    Ok(lore) => lore.raw_content,
                    Err(err) => {
                        warn!(error = %err, "fandom harvest failed, proceeding AniList-only");
                        String::new()
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "no wiki discovered, proceeding AniList-only");
                String::new()
            }
        }
    }

    async fn schema_call<T>(&self, prompt: String) -> std::result::Result<T, aidm_llm::LlmError>
    where
        T: schemars::JsonSchema + serde::de::DeserializeOwned,
    {
        let call = AgentCall::new(RESEARCH_AGENT, prompt)
            .user("Produce the requested analysis.")
            .max_tokens(2048)
            .temperature(0.3);
        tokio::time::timeout(CALL_TIMEOUT, self.router.complete_with_schema::<T>(&call))
            .await
            .map_err(|_| aidm_llm::LlmError::retryable("research call timed out"))?
    }

    /// Index the harvested sections into the lore collection, with
    /// best-effort embeddings.
    async fn index_lore(
        &self,
        profile_id: &str,
        sections: &[LoreSection],
        memory: &mut MemoryManager,
    ) -> Result<()> {
        for section in sections {
            let embedding = match self.router.embed(&section.text).await {
                Ok(vector) if !vector.is_empty() => Some(vector),
                Ok(_) => None,
                Err(err) => {
                    warn!(error = %err, "embedding unavailable, lexical retrieval only");
                    None
                }
            };
            memory
                .upsert_lore(LoreChunk {
                    id: LoreChunk::stable_id(profile_id, &section.page_type, &section.page_title),
                    profile_id: profile_id.to_string(),
                    page_type: section.page_type.clone(),
                    page_title: section.page_title.clone(),
                    text: section.text.clone(),
                    embedding,
                })
                .await?;
        }
        Ok(())
    }
}

fn join_sections(sections: &[LoreSection], page_types: &[&str], max_chars: usize) -> String {
    let mut out = String::new();
    for section in sections {
        if !page_types.contains(&section.page_type.as_str()) {
            continue;
        }
        out.push_str(&format!("{}\n{}\n\n", section.page_title, section.text));
        if out.len() >= max_chars {
            break;
        }
    }
    interpret::truncate(&out, max_chars)
}

async fn report(progress: Option<&mpsc::Sender<ResearchPhase>>, phase: ResearchPhase) {
    if let Some(tx) = progress {
        let _ = tx.send(phase).await;
    }
}
