//! Process-global alias index.
//!
//! Built once at startup from every stored profile's names; read-only
//! thereafter. Resolution runs three stages of increasing looseness: exact
//! normalized match, token-overlap match, then normalized Levenshtein for
//! typo tolerance.

use std::collections::BTreeSet;

use tracing::debug;

use crate::model::NarrativeProfile;

const LEVENSHTEIN_THRESHOLD: f64 = 0.85;
const SUBSET_JACCARD_THRESHOLD: f64 = 0.30;
const REVERSE_CONTAINMENT_THRESHOLD: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    TokenOverlap,
    Levenshtein,
}

#[derive(Debug, Clone)]
struct AliasEntry {
    profile_id: String,
    normalized: String,
    tokens: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct AliasIndex {
    entries: Vec<AliasEntry>,
}

impl AliasIndex {
    pub fn build(profiles: &[NarrativeProfile]) -> Self {
        let mut entries = Vec::new();
        for profile in profiles {
            for name in profile.all_names() {
                let normalized = normalize(&name);
                if normalized.is_empty() {
                    continue;
                }
                entries.push(AliasEntry {
                    profile_id: profile.id.clone(),
                    tokens: tokenize(&name),
                    normalized,
                });
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a free-text reference to a profile id.
    pub fn resolve(&self, query: &str) -> Option<(String, MatchKind)> {
        let normalized_query = normalize(query);
        if normalized_query.is_empty() {
            return None;
        }

        // Stage 1: exact normalized match.
        for entry in &self.entries {
            if entry.normalized == normalized_query {
                return Some((entry.profile_id.clone(), MatchKind::Exact));
            }
        }

        // Stage 2: token overlap. When one token set contains the other,
        // Jaccard ≥ 0.30 is enough; otherwise 80% of the alias's tokens
        // must appear in the query.
        let query_tokens = tokenize(query);
        if !query_tokens.is_empty() {
            let mut best: Option<(&AliasEntry, f64)> = None;
            for entry in &self.entries {
                let overlap = entry.tokens.intersection(&query_tokens).count() as f64;
                if overlap == 0.0 {
                    continue;
                }
                let union = entry.tokens.union(&query_tokens).count() as f64;
                let jaccard = overlap / union;

                let subset = query_tokens.is_subset(&entry.tokens)
                    || entry.tokens.is_subset(&query_tokens);
                let alias_coverage = overlap / entry.tokens.len() as f64;
                let matched = (subset && jaccard >= SUBSET_JACCARD_THRESHOLD)
                    || (!subset && alias_coverage >= REVERSE_CONTAINMENT_THRESHOLD);

                if matched && best.map_or(true, |(_, score)| jaccard > score) {
                    best = Some((entry, jaccard));
                }
            }
            if let Some((entry, score)) = best {
                debug!(query, profile_id = %entry.profile_id, score, "token-overlap alias match");
                return Some((entry.profile_id.clone(), MatchKind::TokenOverlap));
            }
        }

        // Stage 3: normalized Levenshtein ≥ 0.85 for typos.
        let mut best: Option<(&AliasEntry, f64)> = None;
        for entry in &self.entries {
            let similarity = levenshtein_similarity(&entry.normalized, &normalized_query);
            if similarity >= LEVENSHTEIN_THRESHOLD
                && best.map_or(true, |(_, score)| similarity > score)
            {
                best = Some((entry, similarity));
            }
        }
        best.map(|(entry, _)| (entry.profile_id.clone(), MatchKind::Levenshtein))
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Optimal-string-alignment distance: Levenshtein plus adjacent
/// transpositions at cost 1, so common typos ("freiren") stay above the
/// similarity threshold.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let width = b.len() + 1;
    let mut matrix = vec![0usize; (a.len() + 1) * width];
    for j in 0..=b.len() {
        matrix[j] = j;
    }
    for i in 1..=a.len() {
        matrix[i * width] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut distance = (matrix[(i - 1) * width + j] + 1)
                .min(matrix[i * width + j - 1] + 1)
                .min(matrix[(i - 1) * width + j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                distance = distance.min(matrix[(i - 2) * width + j - 2] + 1);
            }
            matrix[i * width + j] = distance;
        }
    }
    matrix[a.len() * width + b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample_profile;

    fn index() -> AliasIndex {
        AliasIndex::build(&[sample_profile("frieren_beyond_journeys_end")])
    }

    #[test]
    fn profile_name_resolves_exactly_to_its_id() {
        let profiles = vec![sample_profile("frieren_beyond_journeys_end")];
        let index = AliasIndex::build(&profiles);
        for profile in &profiles {
            let (id, kind) = index.resolve(&profile.name).unwrap();
            assert_eq!(id, profile.id);
            assert_eq!(kind, MatchKind::Exact);
        }
    }

    #[test]
    fn alias_and_romanized_title_resolve() {
        let index = index();
        assert!(index.resolve("Frieren").is_some());
        assert!(index.resolve("Sousou no Frieren").is_some());
    }

    #[test]
    fn query_with_extra_tokens_matches_by_overlap() {
        let index = index();
        let (id, kind) = index.resolve("sousou no frieren season 2").unwrap();
        assert_eq!(id, "frieren_beyond_journeys_end");
        assert_eq!(kind, MatchKind::TokenOverlap);
    }

    #[test]
    fn small_typos_match_by_levenshtein() {
        let index = index();
        let (id, kind) = index.resolve("Freiren").unwrap();
        assert_eq!(id, "frieren_beyond_journeys_end");
        assert_eq!(kind, MatchKind::Levenshtein);
    }

    #[test]
    fn unrelated_titles_do_not_resolve() {
        let index = index();
        assert!(index.resolve("Cowboy Bebop").is_none());
        assert!(index.resolve("").is_none());
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert!(levenshtein_similarity("frieren", "freiren") >= 0.7);
    }
}
