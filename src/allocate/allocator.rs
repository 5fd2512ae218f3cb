//! Stratified, seeded allocation of training samples into splits.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::labels::PreferenceOutcome;
use super::plan::{SplitPlan, TiePolicy};
use crate::error::{AllocationError, StoreError};
use crate::expand::TrainingSample;
use crate::store::jsonl::write_atomic;
use crate::store::{digest_bytes, write_jsonl, ConversationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Fewer judged principles than the plan's minimum.
    BelowThreshold,
    /// Tie-only sample under `tie_policy: exclude`.
    TiePolicy,
    /// Its conversation already sits in a carve-out.
    ConversationLeak,
    /// Its conversation went to a split where its category has no share.
    SplitConflict,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::BelowThreshold => "below_threshold",
            ExclusionReason::TiePolicy => "tie_policy",
            ExclusionReason::ConversationLeak => "conversation_leak",
            ExclusionReason::SplitConflict => "split_conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedSample {
    pub reason: ExclusionReason,
    pub sample: TrainingSample,
}

/// Counts written to `allocation_report.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub seed: u64,
    pub pool: usize,
    /// Samples left after the threshold and tie policy.
    pub eligible: usize,
    /// Samples per split, carve-outs included.
    pub splits: BTreeMap<String, usize>,
    /// Excluded samples per reason.
    pub excluded: BTreeMap<String, usize>,
    /// Samples per category per split.
    pub categories: BTreeMap<String, BTreeMap<String, usize>>,
    /// Samples placed beyond their category's quota in a split to keep a
    /// conversation in one split.
    pub pinned_overflow: usize,
}

impl AllocationReport {
    /// Every pool sample is in exactly one split or excluded.
    pub fn is_conserved(&self) -> bool {
        self.splits.values().sum::<usize>() + self.excluded.values().sum::<usize>() == self.pool
    }
}

#[derive(Debug, Clone)]
pub struct Allocation {
    /// Samples per split, each carrying its split name.
    pub splits: BTreeMap<String, Vec<TrainingSample>>,
    pub excluded: Vec<ExcludedSample>,
    pub report: AllocationReport,
}

impl Allocation {
    /// Split name per sample id; excluded samples map to `excluded`.
    pub fn membership(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (split, samples) in &self.splits {
            for sample in samples {
                out.insert(sample.sample_id.clone(), split.clone());
            }
        }
        for excluded in &self.excluded {
            out.insert(excluded.sample.sample_id.clone(), "excluded".to_string());
        }
        out
    }

    /// Writes `<split>.jsonl` for every split, `excluded.jsonl` and
    /// `allocation_report.json` into `out_dir`.
    pub async fn write(&self, out_dir: &Path) -> Result<(), AllocationError> {
        for (split, samples) in &self.splits {
            write_jsonl(&out_dir.join(format!("{}.jsonl", split)), samples).await?;
        }
        write_jsonl(&out_dir.join("excluded.jsonl"), &self.excluded).await?;
        let report = serde_json::to_string_pretty(&self.report).map_err(StoreError::from)?;
        write_atomic(&out_dir.join("allocation_report.json"), report.as_bytes()).await?;
        info!(dir = %out_dir.display(), splits = self.splits.len(), "Wrote allocation");
        Ok(())
    }
}

/// Splits `total` into parts proportional to `weights` by largest remainder.
/// Leftover units go to the largest fractional parts, earlier entries first on
/// ties; zero weights never receive any.
pub fn apportion(total: usize, weights: &[f64]) -> Vec<usize> {
    let sum: f64 = weights.iter().sum();
    if total == 0 || sum <= 0.0 {
        return vec![0; weights.len()];
    }
    let exact: Vec<f64> = weights.iter().map(|w| total as f64 * w / sum).collect();
    let mut counts: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();
    let assigned: usize = counts.iter().sum();

    let mut order: Vec<usize> = (0..weights.len()).filter(|&i| weights[i] > 0.0).collect();
    order.sort_by(|&a, &b| {
        let fa = exact[a] - exact[a].floor();
        let fb = exact[b] - exact[b].floor();
        fb.partial_cmp(&fa).unwrap_or(Ordering::Equal).then(a.cmp(&b))
    });
    for &i in order.iter().take(total.saturating_sub(assigned)) {
        counts[i] += 1;
    }
    counts
}

/// Allocates a labelled sample pool according to a [`SplitPlan`].
#[derive(Debug, Clone)]
pub struct QualityAllocator {
    plan: SplitPlan,
}

impl QualityAllocator {
    pub fn new(plan: SplitPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &SplitPlan {
        &self.plan
    }

    /// Per-category RNG seed; stable across platforms and releases.
    fn category_seed(&self, category: &str) -> u64 {
        let digest = digest_bytes(category.as_bytes());
        let salt = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
        self.plan.seed ^ salt
    }

    /// How many samples each carve-out takes from each category, given the
    /// bucket sizes. Fails when the pool cannot satisfy the plan.
    fn carve_out_counts(
        &self,
        sizes: &BTreeMap<String, usize>,
    ) -> Result<Vec<BTreeMap<String, usize>>, AllocationError> {
        let mut left = sizes.clone();
        let mut counts = Vec::with_capacity(self.plan.carve_outs.len());

        for carve_out in &self.plan.carve_outs {
            let available: usize = left.values().sum();
            if carve_out.size > available {
                return Err(AllocationError::CarveOutTooLarge {
                    split: carve_out.name.clone(),
                    requested: carve_out.size,
                    available,
                });
            }

            let mut take = BTreeMap::new();
            for (category, &quota) in &carve_out.category_quotas {
                let in_bucket = left.get(category).copied().unwrap_or(0);
                if quota > in_bucket {
                    return Err(AllocationError::QuotaTooLarge {
                        split: carve_out.name.clone(),
                        category: category.clone(),
                        requested: quota,
                        available: in_bucket,
                    });
                }
                if quota > 0 {
                    take.insert(category.clone(), quota);
                }
            }

            let quota_total: usize = take.values().sum();
            let rest = carve_out.size - quota_total;
            let others: Vec<(&String, usize)> = left
                .iter()
                .filter(|(c, _)| !carve_out.category_quotas.contains_key(*c))
                .map(|(c, n)| (c, *n))
                .collect();
            let other_total: usize = others.iter().map(|(_, n)| n).sum();
            if rest > other_total {
                return Err(AllocationError::CarveOutTooLarge {
                    split: carve_out.name.clone(),
                    requested: carve_out.size,
                    available: quota_total + other_total,
                });
            }
            let weights: Vec<f64> = others.iter().map(|(_, n)| *n as f64).collect();
            for ((category, _), n) in others.iter().zip(apportion(rest, &weights)) {
                if n > 0 {
                    take.insert((*category).clone(), n);
                }
            }

            for (category, n) in &take {
                if let Some(remaining) = left.get_mut(category) {
                    *remaining -= n;
                }
            }
            counts.push(take);
        }
        Ok(counts)
    }

    /// Share weights of `category` over the plan's splits, in split order.
    fn weights_for(&self, category: &str) -> Vec<f64> {
        let tie = category == PreferenceOutcome::TieOnly.as_str();
        match &self.plan.tie_policy {
            TiePolicy::Route { split } if tie => self
                .plan
                .splits
                .iter()
                .map(|s| if s == split { 1.0 } else { 0.0 })
                .collect(),
            _ => {
                let shares = self.plan.shares_for(category);
                self.plan
                    .splits
                    .iter()
                    .map(|s| shares.get(s).copied().unwrap_or(0.0))
                    .collect()
            }
        }
    }

    /// Split for a whole conversation. Prefers the split that keeps the
    /// most of its samples, then the one whose quotas still fit them, then
    /// the one with the most room, then declaration order.
    fn pick_split(
        &self,
        members: &[(String, TrainingSample)],
        weights: &BTreeMap<String, Vec<f64>>,
        capacity: &BTreeMap<String, Vec<usize>>,
    ) -> usize {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for (category, _) in members {
            *counts.entry(category.as_str()).or_insert(0) += 1;
        }
        (0..self.plan.splits.len())
            .max_by_key(|&idx| {
                let mut kept = 0;
                let mut fit = 0;
                let mut room = 0;
                for (&category, &n) in &counts {
                    if weights[category][idx] <= 0.0 {
                        continue;
                    }
                    let left = capacity[category][idx];
                    kept += n;
                    fit += n.min(left);
                    room += left;
                }
                (kept, fit, room, Reverse(idx))
            })
            .unwrap_or(0)
    }

    /// Allocates the pool. Nothing is written; on error no partial result
    /// exists.
    pub fn allocate(&self, pool: Vec<TrainingSample>) -> Result<Allocation, AllocationError> {
        self.plan.validate()?;

        let mut report = AllocationReport {
            seed: self.plan.seed,
            pool: pool.len(),
            ..Default::default()
        };

        // Canonical order first, so arrival order never matters.
        let mut pool = pool;
        pool.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));
        if let Some(pair) = pool.windows(2).find(|w| w[0].sample_id == w[1].sample_id) {
            return Err(AllocationError::DuplicateSample(pair[0].sample_id.clone()));
        }

        let mut excluded = Vec::new();
        let mut buckets: BTreeMap<String, Vec<TrainingSample>> = BTreeMap::new();
        for sample in pool {
            if sample.labels.principle_count.unwrap_or(0) < self.plan.min_principles {
                excluded.push(ExcludedSample {
                    reason: ExclusionReason::BelowThreshold,
                    sample,
                });
                continue;
            }
            let category = sample.labels.category();
            if category == PreferenceOutcome::TieOnly.as_str()
                && self.plan.tie_policy == TiePolicy::Exclude
            {
                excluded.push(ExcludedSample {
                    reason: ExclusionReason::TiePolicy,
                    sample,
                });
                continue;
            }
            buckets.entry(category.to_string()).or_default().push(sample);
        }
        report.eligible = buckets.values().map(Vec::len).sum();

        for (category, bucket) in buckets.iter_mut() {
            let mut rng = ChaCha8Rng::seed_from_u64(self.category_seed(category));
            bucket.shuffle(&mut rng);
        }

        let sizes: BTreeMap<String, usize> =
            buckets.iter().map(|(c, b)| (c.clone(), b.len())).collect();
        let carve_counts = self.carve_out_counts(&sizes)?;

        let mut splits: BTreeMap<String, Vec<TrainingSample>> = self
            .plan
            .all_splits()
            .into_iter()
            .map(|s| (s.to_string(), Vec::new()))
            .collect();

        // Carve-outs: a conversation claimed by one carve-out is not taken
        // by another.
        let mut carved: HashMap<ConversationId, usize> = HashMap::new();
        for (idx, (carve_out, take)) in self.plan.carve_outs.iter().zip(&carve_counts).enumerate() {
            for (category, &count) in take {
                let Some(bucket) = buckets.get_mut(category) else {
                    continue;
                };
                let mut kept = Vec::with_capacity(bucket.len());
                let mut taken = 0;
                for mut sample in bucket.drain(..) {
                    let claimed = carved
                        .get(&sample.source)
                        .is_some_and(|&owner| owner != idx);
                    if taken < count && !claimed {
                        carved.insert(sample.source.clone(), idx);
                        sample.split = Some(carve_out.name.clone());
                        record(&mut report, category, &carve_out.name);
                        splits
                            .entry(carve_out.name.clone())
                            .or_default()
                            .push(sample);
                        taken += 1;
                    } else {
                        kept.push(sample);
                    }
                }
                *bucket = kept;
                if taken < count {
                    return Err(AllocationError::CarveOutShort {
                        split: carve_out.name.clone(),
                        category: category.clone(),
                        requested: count,
                        taken,
                    });
                }
            }
        }

        // Share-based splits take whole conversations. Leftovers of carved
        // conversations would leak and are dropped.
        let mut conversations: BTreeMap<ConversationId, Vec<(String, TrainingSample)>> =
            BTreeMap::new();
        let mut demand: BTreeMap<String, usize> = BTreeMap::new();
        for (category, bucket) in buckets {
            for sample in bucket {
                if carved.contains_key(&sample.source) {
                    excluded.push(ExcludedSample {
                        reason: ExclusionReason::ConversationLeak,
                        sample,
                    });
                } else {
                    *demand.entry(category.clone()).or_insert(0) += 1;
                    conversations
                        .entry(sample.source.clone())
                        .or_default()
                        .push((category.clone(), sample));
                }
            }
        }

        let weights: BTreeMap<String, Vec<f64>> = demand
            .keys()
            .map(|c| (c.clone(), self.weights_for(c)))
            .collect();
        let mut capacity: BTreeMap<String, Vec<usize>> = demand
            .iter()
            .map(|(c, &n)| (c.clone(), apportion(n, &weights[c])))
            .collect();
        debug!(quotas = ?capacity, "Split quotas");

        let mut order: Vec<ConversationId> = conversations.keys().cloned().collect();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(self.plan.seed));
        for source in order {
            let Some(members) = conversations.remove(&source) else {
                continue;
            };
            let idx = self.pick_split(&members, &weights, &capacity);
            let name = &self.plan.splits[idx];
            for (category, mut sample) in members {
                if weights[&category][idx] <= 0.0 {
                    excluded.push(ExcludedSample {
                        reason: ExclusionReason::SplitConflict,
                        sample,
                    });
                    continue;
                }
                if let Some(left) = capacity.get_mut(&category).map(|c| &mut c[idx]) {
                    if *left > 0 {
                        *left -= 1;
                    } else {
                        report.pinned_overflow += 1;
                    }
                }
                sample.split = Some(name.clone());
                record(&mut report, &category, name);
                splits.entry(name.clone()).or_default().push(sample);
            }
        }

        for samples in splits.values_mut() {
            samples.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));
        }
        excluded.sort_by(|a, b| a.sample.sample_id.cmp(&b.sample.sample_id));

        report.splits = splits.iter().map(|(s, v)| (s.clone(), v.len())).collect();
        for entry in &excluded {
            *report
                .excluded
                .entry(entry.reason.as_str().to_string())
                .or_insert(0) += 1;
        }
        info!(
            pool = report.pool,
            eligible = report.eligible,
            splits = ?report.splits,
            excluded = ?report.excluded,
            "Allocated samples"
        );
        Ok(Allocation {
            splits,
            excluded,
            report,
        })
    }
}

fn record(report: &mut AllocationReport, category: &str, split: &str) {
    *report
        .categories
        .entry(category.to_string())
        .or_default()
        .entry(split.to_string())
        .or_insert(0) += 1;
}
