//! Frame volatility engine
//!
//! Tracks, per identifier and byte position, how often the byte value changes
//! and ranks identifiers by a weighted volatility score. Rates are measured
//! over a sliding window; old change timestamps are evicted lazily whenever a
//! byte position records a new change.
//!
//! # Scoring
//!
//! For the active byte positions of an identifier (rate > 0):
//!
//! ```text
//! score = 0.4 * sum(rate) + 0.3 * max(rate) + 0.2 * active
//!       + 0.1 * min(sum(rate) / max(active, 1), 10.0)
//! ```

use crate::types::{Frame, MAX_PAYLOAD_LEN};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Sliding window over which change rates are measured
pub const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Maximum change timestamps kept per byte position
pub const HISTORY_CAPACITY: usize = 100;

/// Lifetime of a computed ranking
pub const RANK_CACHE_TTL: Duration = Duration::from_secs(1);

const SUM_WEIGHT: f64 = 0.4;
const PEAK_WEIGHT: f64 = 0.3;
const ACTIVE_WEIGHT: f64 = 0.2;
const MEAN_WEIGHT: f64 = 0.1;
const MEAN_CAP: f64 = 10.0;

/// Change history of one byte position
#[derive(Debug, Clone, Default)]
pub struct ByteHistory {
    last_value: Option<u8>,
    change_times: VecDeque<Instant>,
    change_rate: f64,
}

impl ByteHistory {
    /// Feed the byte's value from a new frame
    ///
    /// Returns true if the value differs from the previous frame. The first
    /// value seen only initialises the history.
    fn update(&mut self, value: u8, now: Instant) -> bool {
        let changed = match self.last_value {
            Some(previous) => previous != value,
            None => false,
        };
        self.last_value = Some(value);

        if changed {
            if self.change_times.len() == HISTORY_CAPACITY {
                self.change_times.pop_front();
            }
            self.change_times.push_back(now);

            while let Some(&oldest) = self.change_times.front() {
                if now.duration_since(oldest) > RATE_WINDOW {
                    self.change_times.pop_front();
                } else {
                    break;
                }
            }

            self.change_rate = match (self.change_times.front(), self.change_times.back()) {
                (Some(&oldest), Some(&newest)) if self.change_times.len() >= 2 => {
                    let span = newest.duration_since(oldest).as_secs_f64();
                    if span > 0.0 {
                        (self.change_times.len() - 1) as f64 / span
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            };
        }

        changed
    }

    pub fn last_value(&self) -> Option<u8> {
        self.last_value
    }

    /// Changes per second over the sliding window
    pub fn change_rate(&self) -> f64 {
        self.change_rate
    }

    /// Number of change timestamps currently retained
    pub fn change_count(&self) -> usize {
        self.change_times.len()
    }

    pub fn level(&self) -> ChangeLevel {
        ChangeLevel::from_rate(self.change_rate)
    }
}

/// Everything known about one identifier
#[derive(Debug, Clone)]
pub struct IdentifierAggregate {
    identifier: u32,
    last_payload: Vec<u8>,
    last_seen: Instant,
    frame_count: u64,
    bytes: [ByteHistory; MAX_PAYLOAD_LEN],
}

impl IdentifierAggregate {
    fn new(identifier: u32, now: Instant) -> Self {
        Self {
            identifier,
            last_payload: Vec::new(),
            last_seen: now,
            frame_count: 0,
            bytes: Default::default(),
        }
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn last_payload(&self) -> &[u8] {
        &self.last_payload
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Per-position history (always 8 entries)
    pub fn byte_histories(&self) -> &[ByteHistory] {
        &self.bytes
    }

    pub fn byte_rates(&self) -> [f64; MAX_PAYLOAD_LEN] {
        let mut rates = [0.0; MAX_PAYLOAD_LEN];
        for (rate, history) in rates.iter_mut().zip(self.bytes.iter()) {
            *rate = history.change_rate();
        }
        rates
    }

    /// Number of byte positions with a non-zero change rate
    pub fn active_byte_count(&self) -> usize {
        self.bytes.iter().filter(|b| b.change_rate() > 0.0).count()
    }

    pub fn score(&self) -> f64 {
        volatility_score(&self.byte_rates())
    }
}

/// Weighted volatility score of a set of per-byte change rates
pub fn volatility_score(rates: &[f64]) -> f64 {
    let active: Vec<f64> = rates.iter().copied().filter(|r| *r > 0.0).collect();
    let sum: f64 = active.iter().sum();
    let peak = active.iter().copied().fold(0.0, f64::max);
    let count = active.len() as f64;
    let mean = (sum / count.max(1.0)).min(MEAN_CAP);

    SUM_WEIGHT * sum + PEAK_WEIGHT * peak + ACTIVE_WEIGHT * count + MEAN_WEIGHT * mean
}

/// Seven-step shading of a byte's change rate (changes per second)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ChangeLevel {
    /// No change in the window
    None,
    /// < 0.5
    VeryRare,
    /// < 1.0
    Rare,
    /// < 3.0
    Moderate,
    /// < 6.0
    Frequent,
    /// < 10.0
    VeryFrequent,
    /// >= 10.0
    Constant,
}

impl ChangeLevel {
    pub fn from_rate(rate: f64) -> Self {
        if rate <= 0.0 {
            ChangeLevel::None
        } else if rate < 0.5 {
            ChangeLevel::VeryRare
        } else if rate < 1.0 {
            ChangeLevel::Rare
        } else if rate < 3.0 {
            ChangeLevel::Moderate
        } else if rate < 6.0 {
            ChangeLevel::Frequent
        } else if rate < 10.0 {
            ChangeLevel::VeryFrequent
        } else {
            ChangeLevel::Constant
        }
    }

    /// Ordinal 0 (none) ..= 6 (constant)
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ChangeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeLevel::None => "none",
            ChangeLevel::VeryRare => "very rare",
            ChangeLevel::Rare => "rare",
            ChangeLevel::Moderate => "moderate",
            ChangeLevel::Frequent => "frequent",
            ChangeLevel::VeryFrequent => "very frequent",
            ChangeLevel::Constant => "constant",
        };
        write!(f, "{}", name)
    }
}

/// Textual form of an identifier used for display and filtering
pub fn format_identifier(identifier: u32) -> String {
    format!("{:08X}", identifier)
}

/// Snapshot of one ranked identifier, for presentation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub identifier: u32,
    pub score: f64,
    pub frame_count: u64,
    pub payload: Vec<u8>,
    pub byte_rates: Vec<f64>,
    pub byte_levels: Vec<ChangeLevel>,
}

#[derive(Debug, Clone)]
struct RankCache {
    sorted: Vec<u32>,
    computed_at: Instant,
}

/// Per-identifier change tracking and ranking
#[derive(Debug, Default)]
pub struct VolatilityEngine {
    aggregates: HashMap<u32, IdentifierAggregate>,
    cache: Option<RankCache>,
    observed: u64,
}

impl VolatilityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame at the current instant
    pub fn observe(&mut self, frame: &Frame) {
        self.observe_at(frame, Instant::now());
    }

    /// Record a frame at an explicit instant
    pub fn observe_at(&mut self, frame: &Frame, now: Instant) {
        let aggregate = self
            .aggregates
            .entry(frame.identifier())
            .or_insert_with(|| IdentifierAggregate::new(frame.identifier(), now));

        for (history, &value) in aggregate.bytes.iter_mut().zip(frame.data()) {
            history.update(value, now);
        }

        aggregate.last_payload.clear();
        aggregate.last_payload.extend_from_slice(frame.data());
        aggregate.last_seen = now;
        aggregate.frame_count += 1;
        self.observed += 1;
    }

    /// Identifiers by descending volatility, optionally filtered
    ///
    /// The filter is a case-insensitive substring of the identifier's
    /// 8-digit hex form (a leading `0x` is ignored). Filtering is applied
    /// after sorting and never reorders.
    pub fn ranked_view(&mut self, filter: Option<&str>) -> Vec<u32> {
        self.ranked_view_at(filter, Instant::now())
    }

    pub fn ranked_view_at(&mut self, filter: Option<&str>, now: Instant) -> Vec<u32> {
        let fresh = self
            .cache
            .as_ref()
            .map(|cache| now.saturating_duration_since(cache.computed_at) < RANK_CACHE_TTL)
            .unwrap_or(false);

        if !fresh {
            self.cache = Some(RankCache {
                sorted: self.rank(),
                computed_at: now,
            });
        }

        let sorted = match &self.cache {
            Some(cache) => cache.sorted.as_slice(),
            None => &[],
        };

        match normalise_filter(filter) {
            Some(needle) => sorted
                .iter()
                .copied()
                .filter(|id| format_identifier(*id).to_ascii_lowercase().contains(&needle))
                .collect(),
            None => sorted.to_vec(),
        }
    }

    /// Ranked view with per-identifier detail
    pub fn ranked_entries(&mut self, filter: Option<&str>, limit: usize) -> Vec<RankedEntry> {
        self.ranked_view(filter)
            .into_iter()
            .filter_map(|id| self.aggregates.get(&id))
            .take(limit)
            .map(|aggregate| RankedEntry {
                identifier: aggregate.identifier,
                score: aggregate.score(),
                frame_count: aggregate.frame_count,
                payload: aggregate.last_payload.clone(),
                byte_rates: aggregate.byte_rates().to_vec(),
                byte_levels: aggregate.bytes.iter().map(ByteHistory::level).collect(),
            })
            .collect()
    }

    fn rank(&self) -> Vec<u32> {
        let mut scored: Vec<(u32, f64)> = self
            .aggregates
            .values()
            .map(|aggregate| (aggregate.identifier, aggregate.score()))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.into_iter().map(|(id, _)| id).collect()
    }

    pub fn aggregate(&self, identifier: u32) -> Option<&IdentifierAggregate> {
        self.aggregates.get(&identifier)
    }

    pub fn score(&self, identifier: u32) -> Option<f64> {
        self.aggregates.get(&identifier).map(IdentifierAggregate::score)
    }

    /// Number of distinct identifiers seen
    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Total frames observed since the last reset
    pub fn observed_frames(&self) -> u64 {
        self.observed
    }

    /// Forget all identifiers (start of a new session)
    pub fn clear(&mut self) {
        self.aggregates.clear();
        self.cache = None;
        self.observed = 0;
    }
}

fn normalise_filter(filter: Option<&str>) -> Option<String> {
    let trimmed = filter?.trim().to_ascii_lowercase();
    let needle = trimmed.strip_prefix("0x").unwrap_or(&trimmed);
    if needle.is_empty() {
        None
    } else {
        Some(needle.to_string())
    }
}
