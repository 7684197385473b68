//! Recurring-failure pattern detection.
//!
//! # Algorithm
//!
//! 1. Snapshot the embedded failure events in the window, sorted by id.
//! 2. Union every pair scoring at or above `similarity_threshold` in a
//!    [`DisjointSet`] indexed by snapshot position. The set root is
//!    always the smallest position, i.e. the smallest event id.
//! 3. Drop components with fewer than `min_cluster_size` members.
//! 4. Summarize each surviving component as a [`FailurePattern`].
//! 5. Supersede stored patterns that share a majority of their members
//!    with a new one, reusing the stored id. Stored patterns with no
//!    remaining embedded member are retired. The result is written in one
//!    atomic [`replace_patterns`](crate::store::Store::replace_patterns).
//!
//! Because the snapshot is sorted by id and every pair is compared, the
//! clusters depend only on the event set and the thresholds, never on
//! arrival order.
//!
//! Detection runs on a fixed cadence via [`spawn_runner`], reading a
//! snapshot so it never holds locks that ingestion needs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PatternConfig;
use crate::index::SimilarityIndex;
use crate::models::{FailureEvent, FailurePattern};
use crate::store::{EventFilters, Store};

/// Union-find over positions `0..n`.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    /// Root of `x`'s set, compressing the path on the way.
    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Merge the sets of `a` and `b`; the smaller root wins.
    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[merge] = keep;
    }

    /// Components as sorted position lists, ordered by their root.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for x in 0..self.parent.len() {
            let root = self.find(x);
            groups.entry(root).or_default().push(x);
        }
        groups.into_values().collect()
    }
}

pub struct PatternDetector {
    index: Arc<SimilarityIndex>,
    store: Arc<dyn Store>,
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(index: Arc<SimilarityIndex>, store: Arc<dyn Store>, config: PatternConfig) -> Self {
        Self {
            index,
            store,
            config,
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Detect over the last `window_days` days.
    pub async fn detect_recent(&self) -> Result<Vec<FailurePattern>> {
        let window = EventFilters {
            since: Some(Utc::now() - chrono::Duration::days(self.config.window_days)),
            ..Default::default()
        };
        self.detect_patterns(&window).await
    }

    /// Cluster the embedded events matching `window` and persist the
    /// resulting patterns. Returns the patterns found in this run,
    /// sorted by id.
    pub async fn detect_patterns(&self, window: &EventFilters) -> Result<Vec<FailurePattern>> {
        let events = self.index.snapshot(window).await?;
        let clusters = self.cluster(&events);

        let detected_at = Utc::now();
        let candidates: Vec<FailurePattern> = clusters
            .iter()
            .map(|members| self.summarize(members, detected_at))
            .collect();

        let prior = self.store.patterns().await?;
        let (mut patterns, mut superseded) = supersede(&prior, candidates);
        patterns.sort_by(|a, b| a.id.cmp(&b.id));

        let retired = self.retire_orphans(&prior, &patterns, &superseded, &events).await?;
        superseded.extend(retired.iter().cloned());

        self.store.replace_patterns(&superseded, &patterns).await?;

        info!(
            events = events.len(),
            patterns = patterns.len(),
            superseded = superseded.len() - retired.len(),
            retired = retired.len(),
            "pattern detection finished"
        );
        Ok(patterns)
    }

    /// Ids of prior patterns that no new cluster replaced and whose
    /// members are all gone: deleted, or no longer carrying a vector for
    /// their current text. Members outside the window keep a pattern.
    async fn retire_orphans(
        &self,
        prior: &[FailurePattern],
        patterns: &[FailurePattern],
        superseded: &[String],
        snapshot: &[FailureEvent],
    ) -> Result<Vec<String>> {
        let kept: HashSet<&str> = patterns
            .iter()
            .map(|p| p.id.as_str())
            .chain(superseded.iter().map(String::as_str))
            .collect();
        let live: HashSet<&str> = snapshot.iter().map(|e| e.id.as_str()).collect();

        let mut retired = Vec::new();
        'prior: for old in prior.iter().filter(|p| !kept.contains(p.id.as_str())) {
            for member in &old.member_ids {
                if live.contains(member.as_str()) {
                    continue 'prior;
                }
                if let Some(event) = self.store.get_failure_event(member).await? {
                    if event.embedding().is_some() {
                        continue 'prior;
                    }
                }
            }
            debug!(pattern_id = %old.id, "retiring pattern with no remaining members");
            retired.push(old.id.clone());
        }
        Ok(retired)
    }

    /// Group `events` (sorted by id) into clusters of at least
    /// `min_cluster_size` members.
    pub fn cluster<'a>(&self, events: &'a [FailureEvent]) -> Vec<Vec<&'a FailureEvent>> {
        let vectors: Vec<Option<&[f32]>> = events.iter().map(|e| e.embedding()).collect();
        let mut sets = DisjointSet::new(events.len());

        for i in 0..events.len() {
            let Some(a) = vectors[i] else { continue };
            for j in (i + 1)..events.len() {
                let Some(b) = vectors[j] else { continue };
                if self.index.score(a, b) >= self.config.similarity_threshold {
                    sets.union(i, j);
                }
            }
        }

        let clusters: Vec<Vec<&FailureEvent>> = sets
            .components()
            .into_iter()
            .filter(|c| c.len() >= self.config.min_cluster_size)
            .map(|c| c.into_iter().map(|i| &events[i]).collect())
            .collect();

        debug!(
            events = events.len(),
            clusters = clusters.len(),
            threshold = self.config.similarity_threshold,
            "clustered failure events"
        );
        clusters
    }

    fn summarize(&self, members: &[&FailureEvent], detected_at: DateTime<Utc>) -> FailurePattern {
        let mut member_ids: Vec<String> = members.iter().map(|e| e.id.clone()).collect();
        member_ids.sort();

        let centroid = centroid(members);
        let representative = members
            .iter()
            .map(|e| {
                let score = e
                    .embedding()
                    .map(|v| self.index.score(v, &centroid))
                    .unwrap_or(f32::MIN);
                (*e, score)
            })
            .max_by(|(a, sa), (b, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.id.cmp(&a.id))
            })
            .map(|(e, _)| e);

        let first_occurrence = members
            .iter()
            .map(|e| e.reported_at)
            .min()
            .unwrap_or(detected_at);
        let last_occurrence = members
            .iter()
            .map(|e| e.reported_at)
            .max()
            .unwrap_or(detected_at);
        let equipment_tags: Vec<String> = members
            .iter()
            .map(|e| e.equipment_tag.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let summary = format!(
            "{} similar failures on {} between {} and {}: {}",
            members.len(),
            equipment_tags.join(", "),
            first_occurrence.format("%Y-%m-%d"),
            last_occurrence.format("%Y-%m-%d"),
            representative.map(|e| e.description()).unwrap_or_default()
        );

        let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, member_ids.join(",").as_bytes())
            .to_string();

        FailurePattern {
            id,
            member_ids,
            centroid,
            first_occurrence,
            last_occurrence,
            equipment_tags,
            summary,
            detected_at,
        }
    }
}

/// Element-wise mean of the members' vectors. Vectors whose length
/// differs from the first are skipped.
fn centroid(members: &[&FailureEvent]) -> Vec<f32> {
    let vectors: Vec<&[f32]> = members.iter().filter_map(|e| e.embedding()).collect();
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let dims = first.len();
    let mut sum = vec![0.0f32; dims];
    let mut count = 0usize;
    for v in vectors.iter().filter(|v| v.len() == dims) {
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += x;
        }
        count += 1;
    }
    sum.iter_mut().for_each(|s| *s /= count as f32);
    sum
}

/// Match new patterns against `prior` ones.
///
/// A prior pattern is superseded by a new one that contains more than
/// half of its members. The new pattern takes over the id of the prior
/// it overlaps most (ties to the smaller id), so a recurring issue keeps
/// a stable id across runs. Returns the patterns to write and the prior
/// ids to delete.
fn supersede(
    prior: &[FailurePattern],
    mut patterns: Vec<FailurePattern>,
) -> (Vec<FailurePattern>, Vec<String>) {
    let mut superseded: BTreeSet<String> = BTreeSet::new();
    let mut claimed: HashSet<String> = HashSet::new();

    for pattern in patterns.iter_mut() {
        let members: HashSet<&str> = pattern.member_ids.iter().map(String::as_str).collect();
        let mut best: Option<(&FailurePattern, usize)> = None;

        for old in prior {
            let overlap = old
                .member_ids
                .iter()
                .filter(|id| members.contains(id.as_str()))
                .count();
            if overlap * 2 <= old.member_count() {
                continue;
            }
            superseded.insert(old.id.clone());
            if claimed.contains(&old.id) {
                continue;
            }
            let better = match best {
                None => true,
                Some((b, b_overlap)) => {
                    overlap > b_overlap || (overlap == b_overlap && old.id < b.id)
                }
            };
            if better {
                best = Some((old, overlap));
            }
        }

        if let Some((old, _)) = best {
            claimed.insert(old.id.clone());
            pattern.id = old.id.clone();
        }
    }

    // Reused ids are overwritten in place, not deleted.
    let superseded = superseded
        .into_iter()
        .filter(|id| !claimed.contains(id))
        .collect();
    (patterns, superseded)
}

/// Run [`PatternDetector::detect_recent`] every `interval_secs` until
/// `shutdown` is cancelled. The first run starts immediately.
pub fn spawn_runner(detector: Arc<PatternDetector>, shutdown: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(detector.config.interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "pattern runner started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("pattern runner received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    match detector.detect_recent().await {
                        Ok(patterns) => debug!(patterns = patterns.len(), "scheduled detection complete"),
                        Err(e) => warn!(error = %e, "scheduled pattern detection failed"),
                    }
                }
            }
        }
    })
}
