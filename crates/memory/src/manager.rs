//! `MemoryManager` — the facade over both vector collections.
//!
//! Retrieval ranks by `similarity × heat_factor × plot_critical_boost`.
//! Similarity uses cosine distance when embeddings are present and falls
//! back to lexical token overlap otherwise, so the engine degrades cleanly
//! when no embedding model is reachable.
//!
//! Reads (`search`, accessors) are pure in-memory and synchronous; every
//! write awaits the backing [`DocumentLog`], whose fsyncs run off the
//! async runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{debug, info};

use crate::log::{DocumentLog, LogEvent};
use crate::schema::{
    LoreChunk, MemoryRecord, NPC_SWEEP_BOOST, RETRIEVAL_BOOST,
};
use crate::Result;

const PLOT_CRITICAL_BOOST: f32 = 1.25;
const COLD_HEAT_THRESHOLD: f32 = 20.0;

#[derive(Debug, Clone)]
pub enum Retrieved {
    Memory(MemoryRecord),
    Lore(LoreChunk),
}

impl Retrieved {
    pub fn text(&self) -> &str {
        match self {
            Retrieved::Memory(m) => &m.text,
            Retrieved::Lore(l) => &l.text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankedHit {
    pub score: f32,
    pub item: Retrieved,
}

/// Retrieval request. `page_type` filters the lore collection when the
/// intent maps cleanly (COMBAT → techniques, SOCIAL → characters, …);
/// `None` searches unfiltered.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub campaign_id: i64,
    pub profile_id: String,
    pub page_type: Option<String>,
    pub query_embedding: Option<Vec<f32>>,
    pub top_n: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub memories: usize,
    pub archived: usize,
    pub plot_critical: usize,
    pub lore_chunks: usize,
}

/// A cluster of cold memories ready for compression, grouped by their
/// dominant NPC or location tag.
#[derive(Debug, Clone)]
pub struct CompressionGroup {
    pub cluster_key: String,
    pub record_ids: Vec<String>,
    pub texts: Vec<String>,
}

pub struct MemoryManager {
    memories: BTreeMap<String, MemoryRecord>,
    lore: BTreeMap<String, LoreChunk>,
    memory_log: DocumentLog,
    lore_log: DocumentLog,
}

impl MemoryManager {
    /// Open (or create) the two collection logs under `dir`. Startup-only;
    /// replay reads are synchronous.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let memory_log = DocumentLog::new(dir.join("memories.jsonl"));
        let lore_log = DocumentLog::new(dir.join("lore.jsonl"));
        let memories = memory_log.load()?;
        let lore = lore_log.load()?;
        info!(
            memories = memories.len(),
            lore_chunks = lore.len(),
            "memory collections loaded"
        );
        Ok(Self {
            memories,
            lore,
            memory_log,
            lore_log,
        })
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            memories: self.memories.values().filter(|m| !m.archived).count(),
            archived: self.memories.values().filter(|m| m.archived).count(),
            plot_critical: self
                .memories
                .values()
                .filter(|m| m.plot_critical && !m.archived)
                .count(),
            lore_chunks: self.lore.len(),
        }
    }

    // ── Upserts ──────────────────────────────────────────────────────────────

    /// Idempotent: repeated upserts of the same id produce one record with
    /// the latest metadata.
    pub async fn upsert_memory(&mut self, record: MemoryRecord) -> Result<()> {
        self.memory_log
            .append(&LogEvent::Upsert {
                id: record.id.clone(),
                doc: record.clone(),
            })
            .await?;
        self.memories.insert(record.id.clone(), record);
        Ok(())
    }

    pub async fn upsert_lore(&mut self, chunk: LoreChunk) -> Result<()> {
        self.lore_log
            .append(&LogEvent::Upsert {
                id: chunk.id.clone(),
                doc: chunk.clone(),
            })
            .await?;
        self.lore.insert(chunk.id.clone(), chunk);
        Ok(())
    }

    pub fn memory(&self, id: &str) -> Option<&MemoryRecord> {
        self.memories.get(id)
    }

    pub fn memories_for(&self, campaign_id: i64) -> Vec<&MemoryRecord> {
        self.memories
            .values()
            .filter(|m| m.campaign_id == campaign_id && !m.archived)
            .collect()
    }

    pub fn lore_for(&self, profile_id: &str) -> Vec<&LoreChunk> {
        self.lore
            .values()
            .filter(|l| l.profile_id == profile_id)
            .collect()
    }

    // ── Deletion ─────────────────────────────────────────────────────────────

    /// Cascade support: remove every memory owned by a campaign.
    pub async fn delete_campaign_memories(&mut self, campaign_id: i64) -> Result<usize> {
        let ids: Vec<String> = self
            .memories
            .values()
            .filter(|m| m.campaign_id == campaign_id)
            .map(|m| m.id.clone())
            .collect();
        for id in &ids {
            self.memory_log
                .append(&LogEvent::<MemoryRecord>::Delete { id: id.clone() })
                .await?;
            self.memories.remove(id);
        }
        Ok(ids.len())
    }

    /// Profile deletion: remove the document's lore chunks too.
    pub async fn delete_profile_lore(&mut self, profile_id: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .lore
            .values()
            .filter(|l| l.profile_id == profile_id)
            .map(|l| l.id.clone())
            .collect();
        for id in &ids {
            self.lore_log
                .append(&LogEvent::<LoreChunk>::Delete { id: id.clone() })
                .await?;
            self.lore.remove(id);
        }
        Ok(ids.len())
    }

    // ── Retrieval ────────────────────────────────────────────────────────────

    pub fn search(&self, query: &str, filter: &SearchFilter) -> Vec<RankedHit> {
        let query_terms = tokenize(query);
        let query_embedding = filter.query_embedding.as_deref();
        let mut hits: Vec<RankedHit> = Vec::new();

        for record in self.memories.values() {
            if record.campaign_id != filter.campaign_id || record.archived {
                continue;
            }
            let similarity =
                similarity(&record.text, record.embedding.as_deref(), &query_terms, query_embedding);
            if similarity <= 0.0 {
                continue;
            }
            let heat_factor = record.heat / 100.0;
            let boost = if record.plot_critical { PLOT_CRITICAL_BOOST } else { 1.0 };
            hits.push(RankedHit {
                score: similarity * heat_factor * boost,
                item: Retrieved::Memory(record.clone()),
            });
        }

        for chunk in self.lore.values() {
            if chunk.profile_id != filter.profile_id {
                continue;
            }
            if let Some(page_type) = &filter.page_type {
                if !chunk.page_type.eq_ignore_ascii_case(page_type) {
                    continue;
                }
            }
            let similarity =
                similarity(&chunk.text, chunk.embedding.as_deref(), &query_terms, query_embedding);
            if similarity <= 0.0 {
                continue;
            }
            hits.push(RankedHit {
                score: similarity,
                item: Retrieved::Lore(chunk.clone()),
            });
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        let top_n = if filter.top_n == 0 { 8 } else { filter.top_n };
        hits.truncate(top_n);
        debug!(query, results = hits.len(), "memory search");
        hits
    }

    /// Retrieval side effects: +20 heat and a fresh `last_accessed_turn` for
    /// every returned memory.
    pub async fn boost_retrieved(&mut self, ids: &[String], turn: i64) -> Result<()> {
        for id in ids {
            if let Some(record) = self.memories.get_mut(id) {
                record.heat = (record.heat + RETRIEVAL_BOOST).min(100.0);
                record.last_accessed_turn = turn;
                let record = record.clone();
                self.upsert_memory(record).await?;
            }
        }
        Ok(())
    }

    // ── Heat maintenance ─────────────────────────────────────────────────────

    /// Per-turn decay sweep. `milestone_npcs` are NPCs with any `first_*`
    /// milestone; memories tagged to them keep a heat floor of 40.
    ///
    /// Touches every record, so the log is compacted afterwards instead of
    /// appending one event per memory per turn.
    pub async fn decay_turn(&mut self, milestone_npcs: &BTreeSet<String>) -> Result<()> {
        for record in self.memories.values_mut() {
            if record.archived {
                continue;
            }
            record.heat *= record.decay_rate.multiplier(record.category);
            let milestone_tagged = record
                .tagged_npcs
                .iter()
                .any(|npc| milestone_npcs.contains(npc));
            record.clamp_heat(milestone_tagged);
        }
        self.memory_log.compact(&self.memories).await
    }

    /// Background sweep: +10 to every memory tagged with an NPC that
    /// appeared within the last 10 turns.
    pub async fn npc_interaction_sweep(&mut self, recent_npcs: &BTreeSet<String>) -> Result<usize> {
        let ids: Vec<String> = self
            .memories
            .values()
            .filter(|m| {
                !m.archived && m.tagged_npcs.iter().any(|npc| recent_npcs.contains(npc))
            })
            .map(|m| m.id.clone())
            .collect();
        for id in &ids {
            if let Some(record) = self.memories.get_mut(id) {
                record.heat = (record.heat + NPC_SWEEP_BOOST).min(100.0);
                let record = record.clone();
                self.upsert_memory(record).await?;
            }
        }
        Ok(ids.len())
    }

    // ── Cold compression ─────────────────────────────────────────────────────

    /// Cluster cold (< 20 heat), non-plot-critical memories by their first
    /// NPC or location tag. The compactor agent summarizes each cluster.
    pub fn cold_groups(&self, campaign_id: i64) -> Vec<CompressionGroup> {
        let mut clusters: BTreeMap<String, CompressionGroup> = BTreeMap::new();
        for record in self.memories.values() {
            if record.campaign_id != campaign_id
                || record.archived
                || record.plot_critical
                || record.heat >= COLD_HEAT_THRESHOLD
            {
                continue;
            }
            let key = record
                .tagged_npcs
                .first()
                .or_else(|| record.tagged_locations.first())
                .cloned()
                .unwrap_or_else(|| "general".to_string());
            let group = clusters.entry(key.clone()).or_insert_with(|| CompressionGroup {
                cluster_key: key,
                record_ids: Vec::new(),
                texts: Vec::new(),
            });
            group.record_ids.push(record.id.clone());
            group.texts.push(record.text.clone());
        }
        clusters.into_values().filter(|g| g.record_ids.len() > 1).collect()
    }

    /// Archive a compressed group's originals and insert the summary as a
    /// single slow-decay memory. Originals leave active retrieval but stay
    /// in the log.
    pub async fn apply_compression(
        &mut self,
        campaign_id: i64,
        group: &CompressionGroup,
        summary: String,
        turn: i64,
    ) -> Result<MemoryRecord> {
        for id in &group.record_ids {
            if let Some(record) = self.memories.get_mut(id) {
                record.archived = true;
                let record = record.clone();
                self.upsert_memory(record).await?;
            }
        }
        let mut compressed = MemoryRecord::new(
            campaign_id,
            summary,
            crate::schema::MemoryCategory::Event,
            turn,
        )
        .with_decay(crate::schema::DecayRate::Slow);
        compressed.tagged_npcs = vec![group.cluster_key.clone()];
        self.upsert_memory(compressed.clone()).await?;
        info!(
            cluster = %group.cluster_key,
            archived = group.record_ids.len(),
            "cold memories compressed"
        );
        Ok(compressed)
    }
}

// ── Similarity ───────────────────────────────────────────────────────────────

fn similarity(
    text: &str,
    embedding: Option<&[f32]>,
    query_terms: &BTreeSet<String>,
    query_embedding: Option<&[f32]>,
) -> f32 {
    if let (Some(doc_vec), Some(query_vec)) = (embedding, query_embedding) {
        let cos = cosine(doc_vec, query_vec);
        if cos > 0.0 {
            return cos;
        }
    }
    lexical_overlap(text, query_terms)
}

fn lexical_overlap(text: &str, query_terms: &BTreeSet<String>) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms = tokenize(text);
    let overlap = query_terms.intersection(&text_terms).count() as f32;
    overlap / query_terms.len() as f32
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}
