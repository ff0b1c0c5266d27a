//! Ordered rule set with per-rule completion budgets.
//!
//! Rules are evaluated in registration order and the first non-exhausted
//! match wins. A rule's budget is consumed through a single synchronized
//! reserve/commit/release operation: matching reserves a slot, a handler
//! that completes successfully commits it, and anything else releases it.
//! Concurrent requests can therefore never drive a rule past its expected
//! completion count.

mod predicate;

pub use predicate::{CompiledPredicate, MatchContext, Predicate};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::RuleDefinitionError;
use crate::events::RequestRecord;
use crate::handlers::{ActionSpec, HandlerAction};

/// How many times a rule expects its handler to complete before it stops
/// matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Repeat {
    /// Still expecting more requests, forever.
    Always,
    /// Exhausted after this many completed handlings.
    Times(u64),
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat::Always
    }
}

/// Wire-facing rule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub predicates: Vec<Predicate>,
    /// Flattened so the action's discriminator and fields sit at the rule
    /// level on the wire.
    #[serde(flatten)]
    pub action: ActionSpec,
    #[serde(default)]
    pub repeat: Repeat,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A compiled rule: validated predicates plus the handler action to run on
/// match.
#[derive(Clone)]
pub struct Rule {
    pub id: String,
    pub predicates: Vec<CompiledPredicate>,
    pub action: HandlerAction,
    pub repeat: Repeat,
    pub tags: Vec<String>,
}

impl Rule {
    /// Compile a wire definition, validating regex predicates up front.
    pub fn compile(spec: RuleSpec) -> Result<Self, RuleDefinitionError> {
        let predicates = spec
            .predicates
            .iter()
            .map(CompiledPredicate::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Rule {
            id: spec
                .id
                .unwrap_or_else(|| format!("rule-{}", uuid::Uuid::new_v4())),
            predicates,
            action: HandlerAction::from(spec.action),
            repeat: spec.repeat,
            tags: spec.tags,
        })
    }

    /// Build a rule directly, for in-process embedders.
    pub fn new(id: impl Into<String>, predicates: Vec<CompiledPredicate>, action: HandlerAction) -> Self {
        Rule {
            id: id.into(),
            predicates,
            action,
            repeat: Repeat::Always,
            tags: Vec::new(),
        }
    }

    pub fn with_repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = repeat;
        self
    }

    fn needs_body(&self) -> bool {
        self.predicates.iter().any(CompiledPredicate::needs_body)
    }

    /// Evaluate only the predicates decidable without the body. `false`
    /// means the rule definitively cannot match this request.
    fn head_eligible(&self, ctx: &MatchContext<'_>) -> bool {
        self.predicates
            .iter()
            .filter(|p| !p.needs_body())
            .all(|p| p.eval(ctx))
    }

    fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        self.predicates.iter().all(|p| p.eval(ctx))
    }
}

#[derive(Debug, Default)]
struct Budget {
    completed: u64,
    reserved: u64,
}

/// One rule plus its runtime state: completion budget and the requests it
/// has handled.
pub struct RuleEntry {
    pub rule: Rule,
    budget: Mutex<Budget>,
    seen: RwLock<Vec<RequestRecord>>,
}

impl RuleEntry {
    fn new(rule: Rule) -> Self {
        RuleEntry {
            rule,
            budget: Mutex::new(Budget::default()),
            seen: RwLock::new(Vec::new()),
        }
    }

    /// Attempt to consume one completion slot. Fails once the budget is
    /// fully reserved or spent.
    fn try_reserve(&self) -> bool {
        let mut budget = self.budget.lock();
        match self.rule.repeat {
            Repeat::Always => {
                budget.reserved += 1;
                true
            }
            Repeat::Times(limit) => {
                if budget.completed + budget.reserved >= limit {
                    false
                } else {
                    budget.reserved += 1;
                    true
                }
            }
        }
    }

    fn commit(&self) {
        let mut budget = self.budget.lock();
        budget.reserved = budget.reserved.saturating_sub(1);
        budget.completed += 1;
    }

    fn release(&self) {
        let mut budget = self.budget.lock();
        budget.reserved = budget.reserved.saturating_sub(1);
    }

    /// Whether matching should skip this rule. Reservations count so that a
    /// concurrent in-flight handling already holds the last slot.
    fn exhausted(&self) -> bool {
        match self.rule.repeat {
            Repeat::Always => false,
            Repeat::Times(limit) => {
                let budget = self.budget.lock();
                budget.completed + budget.reserved >= limit
            }
        }
    }

    pub fn completed_count(&self) -> u64 {
        self.budget.lock().completed
    }

    pub fn record_seen(&self, record: RequestRecord) {
        self.seen.write().push(record);
    }

    pub fn seen_requests(&self) -> Vec<RequestRecord> {
        self.seen.read().clone()
    }

    pub fn summary(&self) -> RuleSummary {
        let (completed, reserved) = {
            let budget = self.budget.lock();
            (budget.completed, budget.reserved)
        };
        RuleSummary {
            id: self.rule.id.clone(),
            action: self.rule.action.kind().to_string(),
            repeat: self.rule.repeat,
            completed,
            in_flight: reserved,
            exhausted: self.exhausted(),
            seen_count: self.seen.read().len(),
            tags: self.rule.tags.clone(),
        }
    }
}

/// Control-plane view of a rule's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSummary {
    pub id: String,
    pub action: String,
    pub repeat: Repeat,
    pub completed: u64,
    pub in_flight: u64,
    pub exhausted: bool,
    pub seen_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A matched rule holding one reserved completion slot.
///
/// Dropping the lease without committing releases the slot, so an aborted
/// or failed handling never consumes budget.
pub struct RuleLease {
    entry: Arc<RuleEntry>,
    settled: bool,
}

impl RuleLease {
    pub fn rule_id(&self) -> &str {
        &self.entry.rule.id
    }

    pub fn action(&self) -> HandlerAction {
        self.entry.rule.action.clone()
    }

    pub fn tags(&self) -> &[String] {
        &self.entry.rule.tags
    }

    pub fn record_seen(&self, record: RequestRecord) {
        self.entry.record_seen(record);
    }

    /// The handler completed successfully: consume the reserved slot.
    pub fn commit(mut self) {
        self.entry.commit();
        self.settled = true;
    }
}

impl Drop for RuleLease {
    fn drop(&mut self) {
        if !self.settled {
            self.entry.release();
        }
    }
}

/// Outcome of an early (head-only) matching attempt.
pub enum HeadMatch {
    /// A head-only rule matched and holds a reservation.
    Matched(RuleLease),
    /// A body-dependent rule with passing head predicates sits ahead of any
    /// head-only match; resolution must wait for the body.
    Undecided,
    /// No rule can match this request regardless of its body.
    None,
}

/// The shared, ordered, mutable rule list.
#[derive(Default)]
pub struct RuleSet {
    entries: RwLock<Vec<Arc<RuleEntry>>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, rule: Rule) -> Arc<RuleEntry> {
        let entry = Arc::new(RuleEntry::new(rule));
        self.entries.write().push(Arc::clone(&entry));
        entry
    }

    /// Replace the whole ordered rule set, resetting all runtime state.
    pub fn replace_all(&self, rules: Vec<Rule>) {
        let entries: Vec<_> = rules
            .into_iter()
            .map(|rule| Arc::new(RuleEntry::new(rule)))
            .collect();
        *self.entries.write() = entries;
    }

    /// Clear rules and their seen-request logs.
    pub fn reset(&self) {
        self.entries.write().clear();
    }

    pub fn list(&self) -> Vec<Arc<RuleEntry>> {
        self.entries.read().clone()
    }

    /// Remove one rule by id. Returns whether anything was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.rule.id != id);
        entries.len() != before
    }

    pub fn get(&self, id: &str) -> Option<Arc<RuleEntry>> {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.rule.id == id)
            .cloned()
    }

    /// Attempt to resolve a match before the body has arrived.
    ///
    /// Resolution succeeds only when a head-only rule matches and no
    /// earlier body-dependent rule could still claim the request, so the
    /// priority order is never violated by resolving early.
    pub fn match_head(&self, ctx: &MatchContext<'_>) -> HeadMatch {
        let entries = self.entries.read().clone();
        for entry in entries {
            if entry.exhausted() {
                continue;
            }
            if !entry.rule.head_eligible(ctx) {
                continue;
            }
            if entry.rule.needs_body() {
                return HeadMatch::Undecided;
            }
            if entry.try_reserve() {
                debug!(rule_id = %entry.rule.id, "rule matched before body");
                return HeadMatch::Matched(RuleLease {
                    entry,
                    settled: false,
                });
            }
        }
        HeadMatch::None
    }

    /// Full match over the completed request, first non-exhausted rule
    /// wins.
    pub fn match_full(&self, ctx: &MatchContext<'_>) -> Option<RuleLease> {
        let entries = self.entries.read().clone();
        for entry in entries {
            if entry.exhausted() {
                continue;
            }
            if !entry.rule.matches(ctx) {
                continue;
            }
            if entry.try_reserve() {
                debug!(rule_id = %entry.rule.id, "rule matched");
                return Some(RuleLease {
                    entry,
                    settled: false,
                });
            }
        }
        None
    }

    pub fn summaries(&self) -> Vec<RuleSummary> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.summary())
            .collect()
    }
}
