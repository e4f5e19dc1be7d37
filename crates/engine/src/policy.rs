//! Retry/skip decisions.
//!
//! Rules are evaluated in declaration order and the first rule whose pattern
//! matches the error kind decides. No match means `Fail`. Limits are checked
//! against per-rule occurrence counters, which the caller records after acting
//! on a decision; `decide` itself never mutates anything.

use serde::{Deserialize, Serialize};

use batchforge_core::{CounterScope, ItemError, RetrySkipRule, RuleAction, StepOptions};

/// Outcome of consulting the policy for one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: RuleAction,
    /// Index of the matching rule, if any matched.
    pub rule: Option<usize>,
    /// The rule wanted to retry/skip but a limit was exhausted.
    pub limit_exceeded: bool,
}

impl Decision {
    fn fail(rule: Option<usize>, limit_exceeded: bool) -> Self {
        Self {
            action: RuleAction::Fail,
            rule,
            limit_exceeded,
        }
    }
}

/// Per-rule occurrence counters. Persisted inside the step checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCounters {
    occurrences: Vec<u32>,
}

impl PolicyCounters {
    pub fn occurrences(&self, rule: usize) -> u32 {
        self.occurrences.get(rule).copied().unwrap_or(0)
    }

    /// Count an acted-upon retry or skip.
    pub fn record(&mut self, decision: &Decision) {
        if decision.action == RuleAction::Fail {
            return;
        }
        if let Some(rule) = decision.rule {
            if self.occurrences.len() <= rule {
                self.occurrences.resize(rule + 1, 0);
            }
            self.occurrences[rule] += 1;
        }
    }

    /// Zero the counters of rules scoped to a single execution.
    pub fn reset_for_restart(&mut self, policy: &RetrySkipPolicy) {
        for (idx, rule) in policy.rules.iter().enumerate() {
            if rule.scope == CounterScope::ResetOnRestart {
                if let Some(count) = self.occurrences.get_mut(idx) {
                    *count = 0;
                }
            }
        }
    }

    /// Restore skip counters from `snapshot`, keeping retry counters as they
    /// are. Used when a chunk is rolled back for a retry: the skipped items will
    /// be read again.
    pub fn rewind_skips(&mut self, snapshot: &PolicyCounters, policy: &RetrySkipPolicy) {
        for (idx, rule) in policy.rules.iter().enumerate() {
            if rule.action == RuleAction::Skip {
                let before = snapshot.occurrences(idx);
                if let Some(count) = self.occurrences.get_mut(idx) {
                    *count = before;
                }
            }
        }
    }
}

/// Rules plus the step-wide caps from [`StepOptions`].
#[derive(Debug, Clone, Default)]
pub struct RetrySkipPolicy {
    rules: Vec<RetrySkipRule>,
    retry_limit: Option<u32>,
    skip_limit: Option<u32>,
}

impl RetrySkipPolicy {
    pub fn new(rules: Vec<RetrySkipRule>, options: &StepOptions) -> Self {
        Self {
            rules,
            retry_limit: options.retry_limit,
            skip_limit: options.skip_limit,
        }
    }

    pub fn rules(&self) -> &[RetrySkipRule] {
        &self.rules
    }

    fn total(&self, counters: &PolicyCounters, action: RuleAction) -> u64 {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.action == action)
            .map(|(idx, _)| counters.occurrences(idx) as u64)
            .sum()
    }

    pub fn total_skips(&self, counters: &PolicyCounters) -> u64 {
        self.total(counters, RuleAction::Skip)
    }

    pub fn total_retries(&self, counters: &PolicyCounters) -> u64 {
        self.total(counters, RuleAction::Retry)
    }

    /// Decide what to do about `error` given the counters so far.
    pub fn decide(&self, error: &ItemError, counters: &PolicyCounters) -> Decision {
        let Some((idx, rule)) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, r)| r.matches(error.kind))
        else {
            return Decision::fail(None, false);
        };

        let step_cap = match rule.action {
            RuleAction::Fail => return Decision::fail(Some(idx), false),
            RuleAction::Retry => self.retry_limit,
            RuleAction::Skip => self.skip_limit,
        };

        let occurrence = counters.occurrences(idx) + 1;
        let step_total = self.total(counters, rule.action) + 1;
        let within_rule = rule.limit.permits(occurrence);
        let within_step = step_cap.is_none_or(|cap| step_total <= cap as u64);

        if within_rule && within_step {
            Decision {
                action: rule.action,
                rule: Some(idx),
                limit_exceeded: false,
            }
        } else {
            Decision::fail(Some(idx), true)
        }
    }
}
