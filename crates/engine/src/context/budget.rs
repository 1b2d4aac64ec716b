//! Budget allocation: which candidate content fits a token ceiling.
//!
//! Candidates carry a [`PriorityClass`]. Allocation fills the budget
//! class by class, highest first, keeping caller order inside a class.
//! An item larger than what is left is skipped, not truncated, and later
//! (smaller) items still get their chance. Every skipped item is reported
//! as an [`Omitted`] entry so callers can tell the user what was dropped.
//!
//! Two policies:
//!
//! | Policy | Behaviour |
//! |--------|-----------|
//! | Greedy | One pass over all classes against the whole budget |
//! | Shares | One pass over the classes interleaved by share, so each present class gets tokens in proportion to its share |
//!
//! Both policies are a single skip-if-too-big pass over an order that does
//! not depend on the budget. That makes them monotonic: a larger budget
//! never selects fewer tokens for the same candidates.

use crate::context::token::{Estimable, FileWarning};
use serde::{Deserialize, Serialize};
use std::path::Path;
use threadgate_core::thread::AttachedFile;
use tracing::debug;

// ── Types ─────────────────────────────────────────────────────────────────

/// Content priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Source,
    Config,
    Docs,
    /// Logs, data dumps, binaries-as-text, conversation text.
    Other,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 4] = [
        PriorityClass::Source,
        PriorityClass::Config,
        PriorityClass::Docs,
        PriorityClass::Other,
    ];

    /// Classify a file by name and extension.
    pub fn for_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if matches!(
            name.as_str(),
            "dockerfile" | "makefile" | "cmakelists.txt" | ".env" | ".gitignore" | ".editorconfig"
        ) {
            return PriorityClass::Config;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some(
                "rs" | "py" | "js" | "mjs" | "cjs" | "ts" | "jsx" | "tsx" | "go" | "java" | "kt"
                | "scala" | "c" | "h" | "cc" | "cpp" | "hpp" | "cs" | "rb" | "php" | "swift"
                | "m" | "sh" | "bash" | "ps1" | "sql" | "lua" | "dart" | "ex" | "exs" | "hs"
                | "vue" | "svelte" | "html" | "css" | "scss" | "tf",
            ) => PriorityClass::Source,
            Some(
                "toml" | "yaml" | "yml" | "json" | "ini" | "cfg" | "conf" | "env" | "lock"
                | "xml" | "properties" | "gradle",
            ) => PriorityClass::Config,
            Some("md" | "markdown" | "rst" | "txt" | "adoc" | "org") => PriorityClass::Docs,
            _ => PriorityClass::Other,
        }
    }

    /// Classify an attachment. An offloaded prompt is the caller's own
    /// input and ranks with source.
    pub fn for_attachment(file: &AttachedFile) -> Self {
        if file.offloaded {
            PriorityClass::Source
        } else {
            Self::for_path(&file.path)
        }
    }

    fn slot(self) -> usize {
        match self {
            PriorityClass::Source => 0,
            PriorityClass::Config => 1,
            PriorityClass::Docs => 2,
            PriorityClass::Other => 3,
        }
    }
}

/// Nominal split of a shared budget between priority classes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassShares {
    pub source: f64,
    pub config: f64,
    pub docs: f64,
    pub other: f64,
}

impl Default for ClassShares {
    fn default() -> Self {
        Self {
            source: 0.60,
            config: 0.25,
            docs: 0.10,
            other: 0.05,
        }
    }
}

impl ClassShares {
    pub fn share(&self, class: PriorityClass) -> f64 {
        match class {
            PriorityClass::Source => self.source,
            PriorityClass::Config => self.config,
            PriorityClass::Docs => self.docs,
            PriorityClass::Other => self.other,
        }
    }

}

/// How a budget is shared between classes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AllocationPolicy {
    #[default]
    Greedy,
    Shares(ClassShares),
}

/// A piece of content competing for the budget.
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    pub item: T,
    pub class: PriorityClass,
}

impl<T> Candidate<T> {
    pub fn new(item: T, class: PriorityClass) -> Self {
        Self { item, class }
    }
}

/// A candidate that made it in.
#[derive(Debug, Clone)]
pub struct Selected<T> {
    pub item: T,
    pub class: PriorityClass,
    pub tokens: usize,
}

/// Why a candidate was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmissionReason {
    BudgetExceeded,
}

impl std::fmt::Display for OmissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OmissionReason::BudgetExceeded => write!(f, "omitted: budget exceeded"),
        }
    }
}

/// A candidate that did not fit.
#[derive(Debug, Clone)]
pub struct Omitted<T> {
    pub item: T,
    pub class: PriorityClass,
    pub tokens: usize,
    pub reason: OmissionReason,
}

/// The outcome of one allocation.
#[derive(Debug, Clone)]
pub struct Allocation<T> {
    /// Included items, by class then caller order.
    pub selected: Vec<Selected<T>>,
    /// Skipped items, by class then caller order.
    pub omitted: Vec<Omitted<T>>,
    pub spent_tokens: usize,
    /// Estimation problems for items that were still allocated (at zero cost).
    pub warnings: Vec<FileWarning>,
}

// ── Allocator ─────────────────────────────────────────────────────────────

/// Greedy allocation against the whole budget.
pub fn allocate<T: Estimable>(total_budget: usize, items: Vec<Candidate<T>>) -> Allocation<T> {
    Allocator::new(AllocationPolicy::Greedy).allocate(total_budget, items)
}

/// The budget allocator. Stateless; create one and reuse it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Allocator {
    policy: AllocationPolicy,
}

struct Sized<T> {
    position: usize,
    item: T,
    class: PriorityClass,
    tokens: usize,
}

impl Allocator {
    pub fn new(policy: AllocationPolicy) -> Self {
        Self { policy }
    }

    pub fn with_shares(shares: ClassShares) -> Self {
        Self::new(AllocationPolicy::Shares(shares))
    }

    /// Decide which items fit `total_budget`.
    ///
    /// Each item is estimated exactly once.
    pub fn allocate<T: Estimable>(&self, total_budget: usize, items: Vec<Candidate<T>>) -> Allocation<T> {
        let mut warnings = Vec::new();
        let mut sized: Vec<Sized<T>> = items
            .into_iter()
            .enumerate()
            .map(|(position, candidate)| {
                let estimate = candidate.item.estimate();
                if let Some(warning) = estimate.warning {
                    warnings.push(warning);
                }
                Sized {
                    position,
                    item: candidate.item,
                    class: candidate.class,
                    tokens: estimate.tokens,
                }
            })
            .collect();
        // Stable: caller order survives within a class.
        sized.sort_by_key(|s| (s.class, s.position));

        let (mut selected, mut omitted) = match self.policy {
            AllocationPolicy::Greedy => Self::fill(total_budget, sized),
            AllocationPolicy::Shares(shares) => Self::fill_with_shares(total_budget, sized, shares),
        };
        selected.sort_by_key(|s| (s.class, s.position));
        omitted.sort_by_key(|s| (s.class, s.position));

        let spent_tokens = selected.iter().map(|s| s.tokens).sum();
        if !omitted.is_empty() {
            debug!(
                budget = total_budget,
                spent = spent_tokens,
                omitted = omitted.len(),
                "Budget exceeded, items omitted"
            );
        }

        Allocation {
            selected: selected
                .into_iter()
                .map(|s| Selected {
                    item: s.item,
                    class: s.class,
                    tokens: s.tokens,
                })
                .collect(),
            omitted: omitted
                .into_iter()
                .map(|s| Omitted {
                    item: s.item,
                    class: s.class,
                    tokens: s.tokens,
                    reason: OmissionReason::BudgetExceeded,
                })
                .collect(),
            spent_tokens,
            warnings,
        }
    }

    /// Single greedy pass over already-ordered items.
    fn fill<T>(budget: usize, ordered: Vec<Sized<T>>) -> (Vec<Sized<T>>, Vec<Sized<T>>) {
        let mut remaining = budget;
        let mut selected = Vec::new();
        let mut omitted = Vec::new();
        for item in ordered {
            if item.tokens <= remaining {
                remaining -= item.tokens;
                selected.push(item);
            } else {
                omitted.push(item);
            }
        }
        (selected, omitted)
    }

    /// Greedy pass in share order.
    ///
    /// An item's key is its class's running token total divided by the
    /// class share. Filling in key order hands each present class tokens at
    /// the rate of its share, and classes with no candidates simply never
    /// claim theirs. A zero share sorts after everything else.
    fn fill_with_shares<T>(
        budget: usize,
        ordered: Vec<Sized<T>>,
        shares: ClassShares,
    ) -> (Vec<Sized<T>>, Vec<Sized<T>>) {
        let mut running = [0usize; 4];
        let mut keyed: Vec<(f64, Sized<T>)> = ordered
            .into_iter()
            .map(|item| {
                let total = &mut running[item.class.slot()];
                *total += item.tokens;
                let share = shares.share(item.class);
                let key = if share > 0.0 {
                    *total as f64 / share
                } else {
                    f64::INFINITY
                };
                (key, item)
            })
            .collect();
        keyed.sort_by(|(ka, a), (kb, b)| {
            ka.total_cmp(kb)
                .then_with(|| (a.class, a.position).cmp(&(b.class, b.position)))
        });

        Self::fill(budget, keyed.into_iter().map(|(_, item)| item).collect())
    }
}
