use crate::api::{CatalogQuery, DestinationCatalog};
use crate::auth::AuthorizationManager;
use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::models::{CatalogHit, CollectionItem, MatchResult, ProviderRole};
use crate::util::normalize_for_match;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// One fielded search per item; the top hit is the match.
    FirstResult,
    /// Up to three searches per item, each hit scored against the item.
    Similarity { threshold: u32 },
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy::FirstResult
    }
}

impl MatchPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        match cfg.match_policy.as_str() {
            "similarity" => MatchPolicy::Similarity {
                threshold: cfg.similarity_threshold,
            },
            _ => MatchPolicy::FirstResult,
        }
    }
}

/// Resolves collection items against the destination catalog.
pub struct CatalogMatcher {
    catalog: Arc<dyn DestinationCatalog>,
    auth: Arc<AuthorizationManager>,
    policy: MatchPolicy,
    concurrency: usize,
}

impl CatalogMatcher {
    pub fn new(
        catalog: Arc<dyn DestinationCatalog>,
        auth: Arc<AuthorizationManager>,
        policy: MatchPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            catalog,
            auth,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub async fn match_item(&self, item: &CollectionItem) -> Result<MatchResult> {
        self.auth.require_authorized()?;
        let res = match self.policy {
            MatchPolicy::FirstResult => self.first_result(item).await,
            MatchPolicy::Similarity { threshold } => self.similarity(item, threshold).await,
        };
        if let Err(e) = &res {
            if e.is_unauthorized() {
                self.auth.invalidate().await;
            }
        }
        res
    }

    /// One result per input item, in input order. Searches run concurrently
    /// up to the configured bound; the first failing search fails the batch.
    pub async fn match_all(&self, items: &[CollectionItem]) -> Result<Vec<MatchResult>> {
        self.auth.require_authorized()?;
        let total = items.len();
        let done = AtomicUsize::new(0);
        let mut slots: Vec<Option<MatchResult>> = vec![None; total];

        let mut results = stream::iter(0..total)
            .map(|idx| {
                let item = &items[idx];
                let done = &done;
                async move {
                    let res = self.match_item(item).await?;
                    let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(
                        "[{} out of {}] {}: {}",
                        n,
                        total,
                        item.display_name(),
                        if res.is_matched() { "matched" } else { "not found" }
                    );
                    Ok::<_, TransferError>((idx, res))
                }
            })
            .buffer_unordered(self.concurrency);

        while let Some(res) = results.next().await {
            let (idx, result) = res?;
            debug_assert!(slots[idx].is_none(), "slot {} written twice", idx);
            slots[idx] = Some(result);
        }

        let results: Vec<MatchResult> = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TransferError::upstream(ProviderRole::Destination, "match batch incomplete"))?;
        let matched = results.iter().filter(|r| r.is_matched()).count();
        info!("Matched {} of {} items, {} not found", matched, total, total - matched);
        Ok(results)
    }

    async fn first_result(&self, item: &CollectionItem) -> Result<MatchResult> {
        let query = CatalogQuery::fielded(&item.artist, &item.title);
        Ok(match self.catalog.search_catalog(&query).await? {
            Some(hit) => MatchResult::matched(item.clone(), &hit),
            None => MatchResult::not_found(item.clone()),
        })
    }

    async fn similarity(&self, item: &CollectionItem, threshold: u32) -> Result<MatchResult> {
        let passes = [
            CatalogQuery {
                artist: Some(item.artist.clone()),
                title: item.title.clone(),
                fielded: false,
            },
            CatalogQuery::title_only(&item.title),
            CatalogQuery {
                artist: None,
                title: item.title.clone(),
                fielded: false,
            },
        ];
        for query in passes.iter() {
            if let Some(hit) = self.catalog.search_catalog(query).await? {
                if let Some(score) = accept(item, &hit, threshold) {
                    debug!("{} accepted '{}' with score {}", item.display_name(), hit.title, score);
                    return Ok(MatchResult::matched(item.clone(), &hit));
                }
                debug!("{} rejected '{} - {}'", item.display_name(), hit.artist, hit.title);
            }
        }
        Ok(MatchResult::not_found(item.clone()))
    }
}

/// 0..=100 edit-distance similarity.
pub fn ratio(a: &str, b: &str) -> u32 {
    (strsim::normalized_levenshtein(a, b) * 100.0).round() as u32
}

/// Order-insensitive similarity: shared tokens are compared against each
/// side's shared-plus-remaining tokens and the best pairing wins.
pub fn token_set_ratio(a: &str, b: &str) -> u32 {
    let ta: BTreeSet<&str> = a.split_whitespace().collect();
    let tb: BTreeSet<&str> = b.split_whitespace().collect();
    let common = ta.intersection(&tb).copied().collect::<Vec<_>>().join(" ");
    let only_a = ta.difference(&tb).copied().collect::<Vec<_>>().join(" ");
    let only_b = tb.difference(&ta).copied().collect::<Vec<_>>().join(" ");

    let join = |head: &str, tail: &str| format!("{} {}", head, tail).trim().to_string();
    let left = join(&common, &only_a);
    let right = join(&common, &only_b);
    if common.is_empty() {
        return ratio(&left, &right);
    }
    ratio(&common, &left)
        .max(ratio(&common, &right))
        .max(ratio(&left, &right))
}

/// Score a hit against an item; Some(score) when it is good enough.
pub fn accept(item: &CollectionItem, hit: &CatalogHit, threshold: u32) -> Option<u32> {
    let item_artist = normalize_for_match(&item.artist);
    let item_title = normalize_for_match(&item.title);
    let hit_artist = normalize_for_match(&hit.artist);
    let hit_title = normalize_for_match(&hit.title);

    let combined_item = format!("{} {}", item_artist, item_title);
    let combined_hit = format!("{} {}", hit_artist, hit_title);

    let base = ratio(&combined_item, &combined_hit);
    let token = token_set_ratio(&combined_item, &combined_hit);
    let title = ratio(&item_title, &hit_title);
    let raw_title = ratio(&item.title, &hit.title);

    if base >= threshold {
        Some(base)
    } else if token > 92 && base >= 70 {
        Some(token)
    } else if title > 85 && token >= 70 {
        Some(title)
    } else if raw_title > 85 && token >= 70 {
        Some(raw_title)
    } else {
        None
    }
}
