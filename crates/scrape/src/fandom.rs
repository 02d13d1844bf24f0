//! Fandom (MediaWiki) client.
//!
//! Fandom has no registry mapping a series to its wiki, and category names
//! vary per wiki (`Techniques` vs `Abilities` vs `Powers`). Discovery is
//! therefore probe-driven: generate slug candidates from the series titles,
//! find the first live `api.php`, then probe a fixed category superset and
//! record what exists. Articles come from the parsed-HTML endpoint rather
//! than raw wikitext — the rendered structure is far more consistent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::cache_key;
use crate::{Result, ScrapeError, TtlCache};

const TTL_FINISHED: Duration = Duration::from_secs(30 * 24 * 3600);
const TTL_ONGOING: Duration = Duration::from_secs(7 * 24 * 3600);

const MAX_PAGES_PER_CATEGORY: usize = 20;
const MAX_ARTICLE_CHARS: usize = 12_000;

/// Known misses where the obvious slug is wrong.
const SLUG_OVERRIDES: &[(&str, &str)] = &[
    ("frieren: beyond journey's end", "frieren"),
    ("sousou no frieren", "frieren"),
    ("attack on titan", "attackontitan"),
    ("shingeki no kyojin", "attackontitan"),
    ("demon slayer: kimetsu no yaiba", "kimetsu-no-yaiba"),
    ("my hero academia", "myheroacademia"),
];

const TITLE_STOPWORDS: &[&str] = &["the", "a", "an", "of", "no", "wa", "to", "and"];

/// Structural tag attached to every harvested chunk; drives intent-filtered
/// retrieval downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageType {
    Character,
    Technique,
    Location,
    Faction,
    Arc,
    Worldbuilding,
}

impl PageType {
    pub const ALL: [PageType; 6] = [
        PageType::Character,
        PageType::Technique,
        PageType::Location,
        PageType::Faction,
        PageType::Arc,
        PageType::Worldbuilding,
    ];

    /// Tag used in `## [TAG] Title` section headers.
    pub fn header_tag(self) -> &'static str {
        match self {
            PageType::Character => "CHARACTER",
            PageType::Technique => "TECHNIQUE",
            PageType::Location => "LOCATION",
            PageType::Faction => "FACTION",
            PageType::Arc => "ARC",
            PageType::Worldbuilding => "WORLDBUILDING",
        }
    }

    pub fn from_header_tag(tag: &str) -> Option<Self> {
        match tag {
            "CHARACTER" => Some(PageType::Character),
            "TECHNIQUE" => Some(PageType::Technique),
            "LOCATION" => Some(PageType::Location),
            "FACTION" => Some(PageType::Faction),
            "ARC" => Some(PageType::Arc),
            "WORLDBUILDING" => Some(PageType::Worldbuilding),
            _ => None,
        }
    }

    /// The category-name superset probed per wiki.
    fn category_candidates(self) -> &'static [&'static str] {
        match self {
            PageType::Character => &["Characters", "Main Characters"],
            PageType::Technique => &["Techniques", "Abilities", "Powers", "Magic", "Spells"],
            PageType::Location => &["Locations", "Places"],
            PageType::Faction => &["Factions", "Organizations", "Groups"],
            PageType::Arc => &["Story Arcs", "Arcs", "Sagas"],
            PageType::Worldbuilding => &["Worldbuilding", "Lore", "Terminology", "World"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct FandomWiki {
    pub slug: String,
    pub base_url: String,
    /// Page type → the category name that actually exists on this wiki.
    pub category_mapping: BTreeMap<PageType, String>,
}

/// Output of a full harvest: one string with `## [PAGE_TYPE] Title` section
/// headers, consumed downstream by the lore chunker.
#[derive(Debug, Clone)]
pub struct HarvestedLore {
    pub raw_content: String,
    pub page_count: usize,
    pub category_mapping: BTreeMap<PageType, String>,
}

/// Ranked wiki slug candidates for a set of titles (English first, then
/// romaji): override map, normalized full title, then significant-keyword
/// extractions.
pub fn slug_candidates(titles: &[String]) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut push = |slug: String| {
        if !slug.is_empty() && !candidates.contains(&slug) {
            candidates.push(slug);
        }
    };

    for title in titles {
        let lowered = title.trim().to_lowercase();
        if let Some((_, slug)) = SLUG_OVERRIDES.iter().find(|(name, _)| *name == lowered) {
            push(slug.to_string());
        }
    }

    for title in titles {
        let lowered = title.trim().to_lowercase();
        push(normalize_slug(&lowered));

        // Drop a colon suffix ("Frieren: Beyond Journey's End" → "frieren").
        if let Some((head, _)) = lowered.split_once(':') {
            push(normalize_slug(head));
        }

        // Significant keywords: stopwords removed, joined bare.
        let keywords: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty() && !TITLE_STOPWORDS.contains(w))
            .collect();
        if keywords.len() > 1 {
            push(keywords.join(""));
            push(keywords[0].to_string());
        }
    }

    candidates
}

fn normalize_slug(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
}

/// Obvious per-episode pages pollute the Arc category on many wikis.
pub(crate) fn looks_like_episode_page(title: &str) -> bool {
    let lowered = title.to_lowercase();
    if lowered.starts_with("list of") || lowered.contains("episode") {
        return true;
    }
    // "Something 12" style titles are almost always episode stubs.
    lowered
        .rsplit(' ')
        .next()
        .is_some_and(|tail| !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()))
}

/// Strip the rendered article down to headline + paragraph text.
pub fn parse_article_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let selector = Selector::parse(".mw-parser-output > p, .mw-parser-output > h2, .mw-parser-output > h3")
        .expect("static selector");

    let mut sections = Vec::new();
    let mut total = 0usize;
    for element in document.select(&selector) {
        let text = element.text().collect::<String>();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() || text == "Contents" {
            continue;
        }
        total += text.len();
        sections.push(text);
        if total > MAX_ARTICLE_CHARS {
            break;
        }
    }
    sections.join("\n\n")
}

pub struct FandomClient {
    http: reqwest::Client,
    cache: Arc<TtlCache>,
}

impl FandomClient {
    pub fn new(cache: Arc<TtlCache>) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache,
        }
    }

    /// Probe slug candidates until a live wiki answers, then discover which
    /// categories it actually has.
    pub async fn discover(&self, titles: &[String]) -> Result<FandomWiki> {
        let candidates = slug_candidates(titles);
        if candidates.is_empty() {
            return Err(ScrapeError::NotFound("no slug candidates".to_string()));
        }

        for slug in &candidates {
            let base_url = format!("https://{slug}.fandom.com");
            let probe = format!("{base_url}/api.php?action=query&meta=siteinfo&format=json");
            match self.http.get(&probe).send().await {
                Ok(response) if response.status().is_success() => {
                    // Some dead slugs answer with an HTML placeholder page.
                    let body = response.text().await.unwrap_or_default();
                    if serde_json::from_str::<Value>(&body).is_err() {
                        continue;
                    }
                    info!(slug, "fandom wiki discovered");
                    let category_mapping = self.discover_categories(&base_url).await;
                    return Ok(FandomWiki {
                        slug: slug.clone(),
                        base_url,
                        category_mapping,
                    });
                }
                Ok(_) => continue,
                Err(err) => {
                    debug!(slug, error = %err, "slug probe failed");
                    continue;
                }
            }
        }

        Err(ScrapeError::NotFound(format!(
            "no live wiki among {} slug candidates",
            candidates.len()
        )))
    }

    async fn discover_categories(&self, base_url: &str) -> BTreeMap<PageType, String> {
        let mut mapping = BTreeMap::new();
        for page_type in PageType::ALL {
            for candidate in page_type.category_candidates() {
                match self.category_members(base_url, candidate, 1, false).await {
                    Ok(members) if !members.is_empty() => {
                        mapping.insert(page_type, candidate.to_string());
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(candidate, error = %err, "category probe failed");
                        continue;
                    }
                }
            }
        }
        mapping
    }

    /// Harvest every mapped category into one tagged `raw_content` string.
    pub async fn harvest(&self, wiki: &FandomWiki, ongoing: bool) -> Result<HarvestedLore> {
        let mut raw_content = String::new();
        let mut page_count = 0usize;

        for (page_type, category) in &wiki.category_mapping {
            let members = self
                .category_members(&wiki.base_url, category, MAX_PAGES_PER_CATEGORY, ongoing)
                .await
                .unwrap_or_default();

            for title in members {
                if *page_type == PageType::Arc && looks_like_episode_page(&title) {
                    continue;
                }
                match self.article_text(&wiki.base_url, &title, ongoing).await {
                    Ok(text) if !text.is_empty() => {
                        raw_content.push_str(&format!(
                            "## [{}] {}\n\n{}\n\n",
                            page_type.header_tag(),
                            title,
                            text
                        ));
                        page_count += 1;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%title, error = %err, "article fetch failed, skipping"),
                }
            }
        }

        if page_count == 0 {
            return Err(ScrapeError::NotFound(format!(
                "wiki {} yielded no usable articles",
                wiki.slug
            )));
        }

        info!(slug = %wiki.slug, page_count, "fandom harvest complete");
        Ok(HarvestedLore {
            raw_content,
            page_count,
            category_mapping: wiki.category_mapping.clone(),
        })
    }

    async fn category_members(
        &self,
        base_url: &str,
        category: &str,
        limit: usize,
        ongoing: bool,
    ) -> Result<Vec<String>> {
        let encoded = utf8_percent_encode(category, NON_ALPHANUMERIC).to_string();
        let url = format!(
            "{base_url}/api.php?action=query&list=categorymembers&cmtitle=Category:{encoded}&cmlimit={limit}&cmtype=page&format=json"
        );
        let body = self.cached_get(&url, ongoing).await?;
        let members = body
            .pointer("/query/categorymembers")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("title").and_then(|t| t.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(members)
    }

    async fn article_text(&self, base_url: &str, title: &str, ongoing: bool) -> Result<String> {
        let encoded = utf8_percent_encode(title, NON_ALPHANUMERIC).to_string();
        let url =
            format!("{base_url}/api.php?action=parse&page={encoded}&prop=text&format=json");
        let body = self.cached_get(&url, ongoing).await?;
        let html = body
            .pointer("/parse/text/*")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(parse_article_html(html))
    }

    async fn cached_get(&self, url: &str, ongoing: bool) -> Result<Value> {
        let ttl = if ongoing { TTL_ONGOING } else { TTL_FINISHED };
        let key = cache_key("fandom", url);
        if let Some(raw) = self.cache.get(&key, ttl).await {
            return Ok(serde_json::from_str(&raw)?);
        }

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Http(format!("fandom HTTP {status} for {url}")));
        }
        let raw = response.text().await?;
        let body: Value = serde_json::from_str(&raw)?;
        self.cache.put(&key, &raw).await?;
        Ok(body)
    }
}
