//! Category priority table

use gpuadmit_core::{AdmitError, AdmitResult, JobCategory};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Rank of one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRank {
    pub category: JobCategory,
    pub rank: u32,
}

/// Ordered list of categories, highest priority first
///
/// Ranks are positional: with `n` categories the first has rank `n` and
/// the last rank `1`. Callers never pick rank values themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityTable {
    order: Vec<JobCategory>,
}

impl PriorityTable {
    /// Build a table, rejecting empty or duplicated orders
    pub fn new(order: Vec<JobCategory>) -> AdmitResult<Self> {
        if order.is_empty() {
            return Err(AdmitError::Validation(
                "Priority order must name at least one category".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for category in &order {
            if !seen.insert(category) {
                return Err(AdmitError::Validation(format!(
                    "Category listed twice in priority order: {}",
                    category
                )));
            }
        }

        Ok(Self { order })
    }

    /// Rank of a category, `None` if it is not in the table
    pub fn rank(&self, category: &JobCategory) -> Option<u32> {
        self.order
            .iter()
            .position(|c| c == category)
            .map(|i| (self.order.len() - i) as u32)
    }

    pub fn contains(&self, category: &JobCategory) -> bool {
        self.order.contains(category)
    }

    pub fn order(&self) -> &[JobCategory] {
        &self.order
    }

    /// The full rank table, highest first
    pub fn ranks(&self) -> Vec<CategoryRank> {
        self.order
            .iter()
            .filter_map(|c| {
                self.rank(c).map(|rank| CategoryRank {
                    category: c.clone(),
                    rank,
                })
            })
            .collect()
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self {
            order: JobCategory::default_order(),
        }
    }
}
