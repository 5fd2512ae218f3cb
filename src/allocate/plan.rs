//! Split plan: target distribution for allocation, loaded from YAML.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AllocationError;

/// Shares must sum to one within this tolerance.
const SHARE_TOLERANCE: f64 = 1e-6;

/// A fixed-size split filled before any share-based split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarveOut {
    pub name: String,
    pub size: usize,
    /// Exact sample counts taken from specific categories; the rest of
    /// `size` is drawn from the other categories in proportion to their size.
    #[serde(default)]
    pub category_quotas: BTreeMap<String, usize>,
}

/// What happens to the `tie_only` bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TiePolicy {
    /// Distributed by its declared (or default) shares like any bucket.
    #[default]
    Proportional,
    /// Sent whole to one split.
    Route { split: String },
    /// Excluded with reason `tie_policy`.
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPlan {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Samples with fewer judged principles are excluded.
    #[serde(default = "default_min_principles")]
    pub min_principles: u32,
    #[serde(default)]
    pub carve_outs: Vec<CarveOut>,
    /// Share-based splits, in declaration order.
    pub splits: Vec<String>,
    /// Shares for categories without their own entry.
    pub default_shares: BTreeMap<String, f64>,
    #[serde(default)]
    pub category_shares: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub tie_policy: TiePolicy,
}

fn default_seed() -> u64 {
    42
}

fn default_min_principles() -> u32 {
    3
}

fn shares(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

impl Default for SplitPlan {
    /// SFT, RL and the two reward-model splits, plus a 200-sample RL test
    /// set holding five tie-only samples.
    fn default() -> Self {
        let mut category_shares = BTreeMap::new();
        category_shares.insert("tie_only".to_string(), shares(&[("sft", 0.9), ("rl", 0.1)]));
        category_shares.insert("no_winner".to_string(), shares(&[("sft", 1.0)]));
        Self {
            seed: default_seed(),
            min_principles: default_min_principles(),
            carve_outs: vec![CarveOut {
                name: "rl_test".to_string(),
                size: 200,
                category_quotas: [("tie_only".to_string(), 5)].into_iter().collect(),
            }],
            splits: vec![
                "sft".to_string(),
                "rl".to_string(),
                "rm_sft".to_string(),
                "rm_rl".to_string(),
            ],
            default_shares: shares(&[("sft", 0.5), ("rl", 0.3), ("rm_sft", 0.1), ("rm_rl", 0.1)]),
            category_shares,
            tie_policy: TiePolicy::Proportional,
        }
    }
}

impl SplitPlan {
    /// Loads and validates a plan file.
    pub fn load(path: &Path) -> Result<Self, AllocationError> {
        let content = std::fs::read_to_string(path)?;
        let plan: Self = serde_yaml::from_str(&content)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_yaml(&self) -> Result<String, AllocationError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Shares that apply to `category`.
    pub fn shares_for(&self, category: &str) -> &BTreeMap<String, f64> {
        self.category_shares
            .get(category)
            .unwrap_or(&self.default_shares)
    }

    /// Every output split: carve-outs first, then share-based splits.
    pub fn all_splits(&self) -> Vec<&str> {
        self.carve_outs
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.splits.iter().map(String::as_str))
            .collect()
    }

    /// Checks the plan on its own. Checks that depend on the sample pool run
    /// in the allocator, still before anything is written.
    pub fn validate(&self) -> Result<(), AllocationError> {
        if self.splits.is_empty() {
            return Err(AllocationError::InvalidPlan(
                "at least one split is required".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for name in self.all_splits() {
            if name.is_empty() || name == "excluded" || name.contains(|c: char| c == '/' || c == '\\') {
                return Err(AllocationError::InvalidPlan(format!(
                    "'{}' is not a usable split name",
                    name
                )));
            }
            if !seen.insert(name) {
                return Err(AllocationError::DuplicateSplit(name.to_string()));
            }
        }

        let declared: BTreeSet<&str> = self.splits.iter().map(String::as_str).collect();
        self.check_shares("default", &self.default_shares, &declared)?;
        for (category, shares) in &self.category_shares {
            self.check_shares(category, shares, &declared)?;
        }

        for carve_out in &self.carve_outs {
            let quota_total: usize = carve_out.category_quotas.values().sum();
            if quota_total > carve_out.size {
                return Err(AllocationError::InvalidPlan(format!(
                    "carve-out '{}' quotas total {} but its size is {}",
                    carve_out.name, quota_total, carve_out.size
                )));
            }
        }

        if let TiePolicy::Route { split } = &self.tie_policy {
            if !declared.contains(split.as_str()) {
                return Err(AllocationError::UnknownSplit(split.clone()));
            }
        }
        Ok(())
    }

    fn check_shares(
        &self,
        category: &str,
        shares: &BTreeMap<String, f64>,
        declared: &BTreeSet<&str>,
    ) -> Result<(), AllocationError> {
        for (split, share) in shares {
            if !declared.contains(split.as_str()) {
                return Err(AllocationError::UnknownSplit(split.clone()));
            }
            if !share.is_finite() || *share < 0.0 {
                return Err(AllocationError::InvalidPlan(format!(
                    "share {} for '{}' in category '{}' is not a non-negative number",
                    share, split, category
                )));
            }
        }
        let total: f64 = shares.values().sum();
        if (total - 1.0).abs() > SHARE_TOLERANCE {
            return Err(AllocationError::SharesDoNotSumToOne {
                category: category.to_string(),
                total,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_is_valid() {
        let plan = SplitPlan::default();
        plan.validate().expect("default plan");
        assert_eq!(plan.all_splits(), vec!["rl_test", "sft", "rl", "rm_sft", "rm_rl"]);
        assert_eq!(plan.shares_for("tie_only")["rl"], 0.1);
        assert_eq!(plan.shares_for("both_sides")["sft"], 0.5);
    }

    #[test]
    fn test_yaml_with_defaults() {
        let yaml = r#"
splits: [train, eval]
default_shares: {train: 0.8, eval: 0.2}
tie_policy:
  policy: route
  split: eval
"#;
        let plan: SplitPlan = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(plan.seed, 42);
        assert_eq!(plan.min_principles, 3);
        assert!(plan.carve_outs.is_empty());
        assert_eq!(
            plan.tie_policy,
            TiePolicy::Route {
                split: "eval".to_string()
            }
        );
        plan.validate().unwrap();
    }

    #[test]
    fn test_shares_must_sum_to_one() {
        let mut plan = SplitPlan::default();
        plan.default_shares.insert("sft".to_string(), 0.2);
        assert!(matches!(
            plan.validate(),
            Err(AllocationError::SharesDoNotSumToOne { .. })
        ));
    }

    #[test]
    fn test_unknown_split_rejected() {
        let mut plan = SplitPlan::default();
        plan.tie_policy = TiePolicy::Route {
            split: "dev".to_string(),
        };
        assert!(matches!(plan.validate(), Err(AllocationError::UnknownSplit(s)) if s == "dev"));

        let mut plan = SplitPlan::default();
        plan.category_shares
            .insert("first_only".to_string(), shares(&[("holdout", 1.0)]));
        assert!(matches!(plan.validate(), Err(AllocationError::UnknownSplit(_))));
    }

    #[test]
    fn test_duplicate_split_rejected() {
        let mut plan = SplitPlan::default();
        plan.carve_outs[0].name = "sft".to_string();
        assert!(matches!(plan.validate(), Err(AllocationError::DuplicateSplit(s)) if s == "sft"));
    }
}
