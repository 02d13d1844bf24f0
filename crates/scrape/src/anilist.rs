//! AniList GraphQL client.
//!
//! Three queries: single-best-match search, paged multi-result search (the
//! disambiguation path), and fetch-by-id with the full relations graph.
//! AniList allows roughly 90 requests a minute; a minimum inter-request gap
//! keeps research runs comfortably under that.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::cache_key;
use crate::{Result, ScrapeError, TtlCache};

const GRAPHQL_ENDPOINT: &str = "https://graphql.anilist.co";
const MIN_REQUEST_GAP: Duration = Duration::from_millis(700);

const TTL_FINISHED: Duration = Duration::from_secs(7 * 24 * 3600);
const TTL_RELEASING: Duration = Duration::from_secs(3 * 24 * 3600);

const MEDIA_FIELDS: &str = r#"
  id
  format
  status
  popularity
  title { romaji english native }
  genres
  tags { name }
  description(asHtml: false)
  characters(sort: ROLE, perPage: 25) { nodes { name { full } } }
  relations {
    edges {
      relationType
      node { id format title { romaji english native } }
    }
  }
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaTitle {
    pub romaji: Option<String>,
    pub english: Option<String>,
    pub native: Option<String>,
}

impl MediaTitle {
    /// Preferred display name: English, then romaji, then native.
    pub fn display(&self) -> &str {
        self.english
            .as_deref()
            .or(self.romaji.as_deref())
            .or(self.native.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct MediaRelation {
    pub relation_type: String,
    pub id: i64,
    pub title: MediaTitle,
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MediaEntry {
    pub id: i64,
    pub title: MediaTitle,
    pub format: Option<String>,
    pub status: Option<String>,
    pub popularity: i64,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub characters: Vec<String>,
    pub relations: Vec<MediaRelation>,
}

impl MediaEntry {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("id")?.as_i64()?;
        Some(Self {
            id,
            title: parse_title(value.get("title")),
            format: value.get("format").and_then(|v| v.as_str()).map(str::to_string),
            status: value.get("status").and_then(|v| v.as_str()).map(str::to_string),
            popularity: value.get("popularity").and_then(|v| v.as_i64()).unwrap_or(0),
            genres: string_array(value.get("genres")),
            tags: value
                .get("tags")
                .and_then(|v| v.as_array())
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            description: value
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            characters: value
                .pointer("/characters/nodes")
                .and_then(|v| v.as_array())
                .map(|nodes| {
                    nodes
                        .iter()
                        .filter_map(|n| n.pointer("/name/full").and_then(|v| v.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            relations: value
                .pointer("/relations/edges")
                .and_then(|v| v.as_array())
                .map(|edges| {
                    edges
                        .iter()
                        .filter_map(|edge| {
                            let node = edge.get("node")?;
                            Some(MediaRelation {
                                relation_type: edge
                                    .get("relationType")?
                                    .as_str()?
                                    .to_string(),
                                id: node.get("id")?.as_i64()?,
                                title: parse_title(node.get("title")),
                                format: node
                                    .get("format")
                                    .and_then(|v| v.as_str())
                                    .map(str::to_string),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn is_releasing(&self) -> bool {
        self.status.as_deref() == Some("RELEASING")
    }
}

fn parse_title(value: Option<&Value>) -> MediaTitle {
    let get = |field: &str| {
        value
            .and_then(|t| t.get(field))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    MediaTitle {
        romaji: get("romaji"),
        english: get("english"),
        native: get("native"),
    }
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|x| x.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Format-aware scoring: TV beats movies beats ONA/OVA/specials, popularity
/// breaks ties.
pub fn pick_best_match(entries: &[MediaEntry]) -> Option<&MediaEntry> {
    entries.iter().max_by(|a, b| {
        let key = |e: &MediaEntry| (format_rank(e.format.as_deref()), e.popularity);
        key(a).cmp(&key(b))
    })
}

fn format_rank(format: Option<&str>) -> i32 {
    match format {
        Some("TV") => 3,
        Some("MOVIE") => 2,
        Some("ONA") | Some("OVA") | Some("SPECIAL") | Some("TV_SHORT") => 1,
        _ => 0,
    }
}

pub struct AniListClient {
    http: reqwest::Client,
    cache: Arc<TtlCache>,
    last_request: Mutex<Option<Instant>>,
}

impl AniListClient {
    pub fn new(cache: Arc<TtlCache>) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache,
            last_request: Mutex::new(None),
        }
    }

    /// Single best match for a title, or `NotFound`.
    pub async fn search_best(&self, title: &str) -> Result<MediaEntry> {
        let query = format!("query ($search: String) {{ Media(search: $search, type: ANIME) {{ {MEDIA_FIELDS} }} }}");
        let body = self
            .cached_query("anilist:best", title, &query, json!({ "search": title }))
            .await?;
        body.pointer("/data/Media")
            .and_then(MediaEntry::from_value)
            .ok_or_else(|| ScrapeError::NotFound(format!("no AniList match for '{title}'")))
    }

    /// Multi-result page search. Empty result is `NotFound`.
    pub async fn search(&self, title: &str) -> Result<Vec<MediaEntry>> {
        let query = format!(
            "query ($search: String) {{ Page(perPage: 10) {{ media(search: $search, type: ANIME) {{ {MEDIA_FIELDS} }} }} }}"
        );
        let body = self
            .cached_query("anilist:search", title, &query, json!({ "search": title }))
            .await?;
        let entries: Vec<MediaEntry> = body
            .pointer("/data/Page/media")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(MediaEntry::from_value).collect())
            .unwrap_or_default();
        if entries.is_empty() {
            return Err(ScrapeError::NotFound(format!("no AniList results for '{title}'")));
        }
        Ok(entries)
    }

    /// Fetch a single entry with full relations.
    pub async fn fetch_by_id(&self, id: i64) -> Result<MediaEntry> {
        let query = format!("query ($id: Int) {{ Media(id: $id, type: ANIME) {{ {MEDIA_FIELDS} }} }}");
        let body = self
            .cached_query("anilist:id", &id.to_string(), &query, json!({ "id": id }))
            .await?;
        body.pointer("/data/Media")
            .and_then(MediaEntry::from_value)
            .ok_or_else(|| ScrapeError::NotFound(format!("AniList id {id} not found")))
    }

    async fn cached_query(
        &self,
        namespace: &str,
        identity: &str,
        query: &str,
        variables: Value,
    ) -> Result<Value> {
        let key = cache_key(namespace, identity);
        if let Some(raw) = self.cache.get(&key, TTL_FINISHED).await {
            let body: Value = serde_json::from_str(&raw)?;
            // Releasing series refresh on the shorter TTL.
            let releasing = body
                .pointer("/data/Media/status")
                .or_else(|| body.pointer("/data/Page/media/0/status"))
                .and_then(|v| v.as_str())
                == Some("RELEASING");
            if !releasing || self.cache.get(&key, TTL_RELEASING).await.is_some() {
                debug!(namespace, identity, "anilist cache hit");
                return Ok(body);
            }
        }

        self.throttle().await;
        let response = self
            .http
            .post(GRAPHQL_ENDPOINT)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Http(format!("AniList HTTP {status}")));
        }
        let raw = response.text().await?;
        let body: Value = serde_json::from_str(&raw)?;
        if body.get("errors").is_some_and(|e| !e.is_null()) {
            return Err(ScrapeError::Http(format!("AniList GraphQL errors: {}", body["errors"])));
        }
        self.cache.put(&key, &raw).await?;
        Ok(body)
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < MIN_REQUEST_GAP {
                tokio::time::sleep(MIN_REQUEST_GAP - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(format: &str, popularity: i64) -> MediaEntry {
        MediaEntry {
            id: popularity,
            title: MediaTitle::default(),
            format: Some(format.to_string()),
            status: Some("FINISHED".to_string()),
            popularity,
            genres: vec![],
            tags: vec![],
            description: None,
            characters: vec![],
            relations: vec![],
        }
    }

    #[test]
    fn tv_beats_more_popular_movie() {
        let entries = vec![entry("MOVIE", 100_000), entry("TV", 50_000)];
        let best = pick_best_match(&entries).unwrap();
        assert_eq!(best.format.as_deref(), Some("TV"));
    }

    #[test]
    fn popularity_breaks_format_ties() {
        let entries = vec![entry("TV", 10_000), entry("TV", 90_000)];
        let best = pick_best_match(&entries).unwrap();
        assert_eq!(best.popularity, 90_000);
    }

    #[test]
    fn ova_ranks_below_movie() {
        let entries = vec![entry("OVA", 500_000), entry("MOVIE", 10)];
        let best = pick_best_match(&entries).unwrap();
        assert_eq!(best.format.as_deref(), Some("MOVIE"));
    }

    #[test]
    fn parses_media_value_with_relations() {
        let value = serde_json::json!({
            "id": 154587,
            "format": "TV",
            "status": "FINISHED",
            "popularity": 400000,
            "title": {"romaji": "Sousou no Frieren", "english": "Frieren: Beyond Journey's End"},
            "genres": ["Adventure", "Fantasy"],
            "tags": [{"name": "Elf"}, {"name": "Iyashikei"}],
            "description": "An elf mage outlives her hero party.",
            "characters": {"nodes": [{"name": {"full": "Frieren"}}, {"name": {"full": "Fern"}}]},
            "relations": {"edges": [{
                "relationType": "SEQUEL",
                "node": {"id": 182255, "format": "TV", "title": {"romaji": "Sousou no Frieren 2nd Season"}}
            }]}
        });
        let entry = MediaEntry::from_value(&value).unwrap();
        assert_eq!(entry.title.display(), "Frieren: Beyond Journey's End");
        assert_eq!(entry.characters, vec!["Frieren", "Fern"]);
        assert_eq!(entry.relations.len(), 1);
        assert_eq!(entry.relations[0].relation_type, "SEQUEL");
        assert!(!entry.is_releasing());
    }

    #[test]
    fn display_falls_back_through_titles() {
        let title = MediaTitle {
            romaji: Some("Sousou no Frieren".to_string()),
            english: None,
            native: Some("葬送のフリーレン".to_string()),
        };
        assert_eq!(title.display(), "Sousou no Frieren");
    }
}
