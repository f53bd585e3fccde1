//! Eviction policies and the health-driven cleanup planner

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::store::CacheEntry;
use crate::cache::CacheStatistics;

/// Victim-selection policy. All policies share one frame: order candidates,
/// skip pinned entries, remove until back under budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    SizeBased,
    TimeBased,
    #[default]
    Hybrid,
}

/// Hybrid eviction score; lower scores are evicted first.
///
/// `0.4 * recency + 0.4 * frequency + 0.2 * inverse_size`, with
/// `recency = 1 / (hours_since_access + 1)` and
/// `inverse_size = 1 / (size_bytes + 1)`.
pub(crate) fn hybrid_score(entry: &CacheEntry, now: DateTime<Utc>) -> f64 {
    let hours = (now - entry.last_access).num_hours().max(0) as f64;
    let recency = 1.0 / (hours + 1.0);
    let frequency = entry.access_count as f64;
    let inverse_size = 1.0 / (entry.size_bytes as f64 + 1.0);
    0.4 * recency + 0.4 * frequency + 0.2 * inverse_size
}

/// Inputs for one eviction pass.
pub(crate) struct EvictionRequest<'a> {
    pub policy: EvictionPolicy,
    pub now: DateTime<Utc>,
    pub max_age: ChronoDuration,
    /// Evict until the remaining total size is at or under this.
    pub target_size: u64,
    /// Evict until the remaining item count is at or under this.
    pub target_items: usize,
    /// Never leave fewer than this many entries.
    pub min_keep_items: usize,
    /// Distance-from-tail per key; the tie-break for equal scores.
    pub lru_positions: &'a HashMap<String, usize>,
}

/// Select keys to evict, in eviction order. Pinned entries are never
/// selected; selection stops as soon as both targets are met or the
/// min-keep floor is reached.
pub(crate) fn select_victims(
    entries: &HashMap<String, CacheEntry>,
    total_size: u64,
    req: &EvictionRequest,
) -> Vec<String> {
    let pos = |key: &str| req.lru_positions.get(key).copied().unwrap_or(usize::MAX);

    let mut candidates: Vec<&CacheEntry> = entries.values().filter(|e| !e.pinned).collect();
    match req.policy {
        EvictionPolicy::Lru => {
            candidates.sort_by_key(|e| pos(&e.key));
        }
        EvictionPolicy::Lfu => {
            candidates.sort_by(|a, b| {
                a.access_count
                    .cmp(&b.access_count)
                    .then_with(|| pos(&a.key).cmp(&pos(&b.key)))
            });
        }
        EvictionPolicy::SizeBased => {
            candidates.sort_by(|a, b| {
                b.size_bytes
                    .cmp(&a.size_bytes)
                    .then_with(|| pos(&a.key).cmp(&pos(&b.key)))
            });
        }
        EvictionPolicy::TimeBased => {
            candidates.retain(|e| req.now - e.last_access > req.max_age);
            candidates.sort_by_key(|e| e.last_access);
        }
        EvictionPolicy::Hybrid => {
            candidates.sort_by(|a, b| {
                hybrid_score(a, req.now)
                    .partial_cmp(&hybrid_score(b, req.now))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| pos(&a.key).cmp(&pos(&b.key)))
            });
        }
    }

    let mut victims = Vec::new();
    let mut size = total_size;
    let mut count = entries.len();
    for entry in candidates {
        if size <= req.target_size && count <= req.target_items {
            break;
        }
        if count <= req.min_keep_items {
            break;
        }
        size = size.saturating_sub(entry.size_bytes);
        count -= 1;
        victims.push(entry.key.clone());
    }
    victims
}

/// Severity of a background cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupLevel {
    None,
    Light,
    Moderate,
    Aggressive,
}

impl CleanupLevel {
    /// Fraction of entries the pass removes, oldest first.
    pub fn fraction(&self) -> f64 {
        match self {
            CleanupLevel::None => 0.0,
            CleanupLevel::Light => 0.10,
            CleanupLevel::Moderate => 0.25,
            CleanupLevel::Aggressive => 0.50,
        }
    }
}

/// Plan produced by the background cleaner.
#[derive(Debug, Clone)]
pub struct CleanupRecommendation {
    pub level: CleanupLevel,
    pub estimated_freed_bytes: u64,
    pub victims: Vec<String>,
    pub reason: String,
}

/// Derive a cleanup plan from the tier's statistics: over 95% of the size
/// budget is aggressive (oldest 50% of entries), over 90% moderate (25%),
/// over 80% light (10%).
pub(crate) fn recommend(
    stats: &CacheStatistics,
    max_size: u64,
    min_keep_items: usize,
    entries: &HashMap<String, CacheEntry>,
) -> CleanupRecommendation {
    let usage = if max_size == 0 {
        0.0
    } else {
        stats.total_size_bytes as f64 / max_size as f64
    };

    let level = if usage > 0.95 {
        CleanupLevel::Aggressive
    } else if usage > 0.90 {
        CleanupLevel::Moderate
    } else if usage > 0.80 {
        CleanupLevel::Light
    } else {
        CleanupLevel::None
    };

    if level == CleanupLevel::None {
        return CleanupRecommendation {
            level,
            estimated_freed_bytes: 0,
            victims: Vec::new(),
            reason: format!("cache at {:.0}% of size budget", usage * 100.0),
        };
    }

    let mut by_age: Vec<&CacheEntry> = entries.values().filter(|e| !e.pinned).collect();
    by_age.sort_by_key(|e| e.last_access);

    let requested = ((entries.len() as f64) * level.fraction()).ceil() as usize;
    let removable = entries.len().saturating_sub(min_keep_items);
    let take = requested.min(removable).min(by_age.len());

    let victims: Vec<String> = by_age[..take].iter().map(|e| e.key.clone()).collect();
    let estimated_freed_bytes = by_age[..take].iter().map(|e| e.size_bytes).sum();

    CleanupRecommendation {
        level,
        estimated_freed_bytes,
        victims,
        reason: format!("cache at {:.0}% of size budget", usage * 100.0),
    }
}
