//! Franchise resolution: which entries merge, which disambiguate.
//!
//! Sequential seasons of the same show are one story and merge silently.
//! Everything else on the relations graph — prequels set in other eras,
//! side-story films, alternate universes — is a player-facing choice.

use std::collections::BTreeSet;

use aidm_profile::{ReleaseStatus, slugify};
use aidm_scrape::{MediaEntry, MediaRelation};

/// Relation types treated as "the same ongoing story".
pub fn is_sequential_relation(relation_type: &str) -> bool {
    matches!(relation_type, "SEQUEL" | "PREQUEL")
}

/// Non-sequential siblings worth surfacing to the player during session
/// zero. Sequels and prequels never appear here.
pub fn disambiguation_candidates(root: &MediaEntry) -> Vec<&MediaRelation> {
    root.relations
        .iter()
        .filter(|rel| {
            !is_sequential_relation(&rel.relation_type)
                && matches!(
                    rel.relation_type.as_str(),
                    "SIDE_STORY" | "ALTERNATIVE" | "SPIN_OFF" | "PARENT"
                )
        })
        .collect()
}

/// One franchise entry after merging sequential seasons.
#[derive(Debug, Clone)]
pub struct MergedSeries {
    pub anilist_ids: Vec<i64>,
    pub name: String,
    pub romanized_title: Option<String>,
    pub native_title: Option<String>,
    pub status: ReleaseStatus,
    /// Longest synopsis across the merged entries.
    pub synopsis: String,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub characters: Vec<String>,
    pub series_group: String,
    pub series_position: u32,
}

/// Merge the root entry with its sequential seasons: union tags, genres,
/// and characters; take the highest-priority status; keep the longest
/// synopsis.
pub fn merge_sequential(root: &MediaEntry, seasons: &[MediaEntry]) -> MergedSeries {
    let mut all = Vec::with_capacity(seasons.len() + 1);
    all.push(root.clone());
    all.extend(seasons.iter().cloned());

    let mut ids = Vec::new();
    let mut genres = BTreeSet::new();
    let mut tags = BTreeSet::new();
    let mut characters = Vec::new();
    let mut seen_characters = BTreeSet::new();
    let mut status = ReleaseStatus::Finished;
    let mut synopsis = String::new();

    for entry in &all {
        ids.push(entry.id);
        genres.extend(entry.genres.iter().cloned());
        tags.extend(entry.tags.iter().cloned());
        for character in &entry.characters {
            if seen_characters.insert(character.clone()) {
                characters.push(character.clone());
            }
        }
        let entry_status = entry
            .status
            .as_deref()
            .map(ReleaseStatus::from_anilist)
            .unwrap_or(ReleaseStatus::Finished);
        if entry_status.priority() > status.priority() {
            status = entry_status;
        }
        if let Some(description) = &entry.description {
            if description.len() > synopsis.len() {
                synopsis = description.clone();
            }
        }
    }

    let series_group = root
        .title
        .romaji
        .as_deref()
        .map(slugify)
        .unwrap_or_else(|| slugify(root.title.display()));

    MergedSeries {
        anilist_ids: ids,
        name: root.title.display().to_string(),
        romanized_title: root.title.romaji.clone(),
        native_title: root.title.native.clone(),
        status,
        synopsis,
        genres: genres.into_iter().collect(),
        tags: tags.into_iter().collect(),
        characters,
        series_group,
        series_position: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidm_scrape::MediaTitle;

    fn entry(id: i64, status: &str, description: &str) -> MediaEntry {
        MediaEntry {
            id,
            title: MediaTitle {
                romaji: Some("Sousou no Frieren".to_string()),
                english: Some("Frieren: Beyond Journey's End".to_string()),
                native: None,
            },
            format: Some("TV".to_string()),
            status: Some(status.to_string()),
            popularity: 100,
            genres: vec!["Fantasy".to_string()],
            tags: vec![],
            description: Some(description.to_string()),
            characters: vec!["Frieren".to_string()],
            relations: vec![],
        }
    }

    #[test]
    fn sequential_seasons_merge_to_releasing_status() {
        // Scenario: TV S1 finished, TV S2 releasing — no disambiguation, one
        // merged entry with status releasing.
        let mut s1 = entry(154587, "FINISHED", "An elf mage outlives her hero party.");
        s1.characters.push("Himmel".to_string());
        let mut s2 = entry(182255, "RELEASING", "Short synopsis");
        s2.characters.push("Fern".to_string());
        s2.genres.push("Adventure".to_string());

        let merged = merge_sequential(&s1, &[s2]);
        assert_eq!(merged.status, ReleaseStatus::Releasing);
        assert_eq!(merged.series_group, "sousou_no_frieren");
        assert_eq!(merged.anilist_ids, vec![154587, 182255]);
        // Union of characters and genres.
        assert!(merged.characters.contains(&"Himmel".to_string()));
        assert!(merged.characters.contains(&"Fern".to_string()));
        assert!(merged.genres.contains(&"Adventure".to_string()));
        // Longest synopsis wins.
        assert!(merged.synopsis.contains("outlives"));
    }

    #[test]
    fn characters_are_deduplicated_across_seasons() {
        let s1 = entry(1, "FINISHED", "a");
        let s2 = entry(2, "FINISHED", "b");
        let merged = merge_sequential(&s1, &[s2]);
        assert_eq!(
            merged
                .characters
                .iter()
                .filter(|c| *c == "Frieren")
                .count(),
            1
        );
    }

    #[test]
    fn sequels_never_appear_as_disambiguation_choices() {
        let mut root = entry(1, "FINISHED", "x");
        root.relations = vec![
            MediaRelation {
                relation_type: "SEQUEL".to_string(),
                id: 2,
                title: MediaTitle::default(),
                format: Some("TV".to_string()),
            },
            MediaRelation {
                relation_type: "SIDE_STORY".to_string(),
                id: 3,
                title: MediaTitle::default(),
                format: Some("MOVIE".to_string()),
            },
            MediaRelation {
                relation_type: "CHARACTER".to_string(),
                id: 4,
                title: MediaTitle::default(),
                format: None,
            },
        ];

        let candidates = disambiguation_candidates(&root);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].relation_type, "SIDE_STORY");
    }

    #[test]
    fn sequential_relation_classification() {
        assert!(is_sequential_relation("SEQUEL"));
        assert!(is_sequential_relation("PREQUEL"));
        assert!(!is_sequential_relation("SIDE_STORY"));
        assert!(!is_sequential_relation("ALTERNATIVE"));
    }
}
