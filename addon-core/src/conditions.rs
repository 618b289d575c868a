//! Typed status conditions and their aggregation into a summary
//!
//! Conditions are kept in a fixed order: the summary [`READY`] condition first, then every
//! other condition sorted by type. Writers go through [`set`] so that
//! `lastTransitionTime` only moves when a condition actually flips.
use crate::metadata::Time;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Type of the summary condition
pub const READY: &str = "Ready";

/// How bad a false condition is
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Severity {
    /// Informational or not applicable, used for true conditions
    #[default]
    None,
    /// Degraded but expected to recover on its own
    Warning,
    /// Requires attention
    Error,
}

/// A typed, timestamped health signal
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, unique within one object's condition list
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition holds
    pub status: bool,
    /// Severity of a false condition
    #[serde(default)]
    pub severity: Severity,
    /// Machine readable reason code
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    /// A condition that holds
    pub fn truthy(type_: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: true,
            ..Default::default()
        }
    }

    /// A condition that does not hold
    pub fn falsy(
        type_: impl Into<String>,
        severity: Severity,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: false,
            severity,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    /// Whether this is false with the given severity
    pub fn is_false_with(&self, severity: Severity) -> bool {
        !self.status && self.severity == severity
    }
}

fn condition_order(a: &Condition, b: &Condition) -> Ordering {
    match (a.type_ == READY, b.type_ == READY) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.type_.cmp(&b.type_),
    }
}

/// Fold a set of conditions into a single [`READY`] summary
///
/// Existing `Ready` conditions in the input are ignored. The first false condition with
/// `Error` severity (ordered by type) determines the summary, then the first false `Warning`.
/// Otherwise the summary is true. False conditions without severity do not degrade the summary.
///
/// The returned condition carries no transition time, [`set`] assigns it.
pub fn summarize(conditions: &[Condition]) -> Condition {
    let mut sorted: Vec<&Condition> = conditions.iter().filter(|c| c.type_ != READY).collect();
    sorted.sort_by(|a, b| a.type_.cmp(&b.type_));

    [Severity::Error, Severity::Warning]
        .into_iter()
        .find_map(|severity| sorted.iter().find(|c| c.is_false_with(severity)))
        .map(|c| Condition::falsy(READY, c.severity, c.reason.clone(), c.message.clone()))
        .unwrap_or_else(|| Condition::truthy(READY))
}

/// Insert or replace a condition by type
///
/// When the replaced condition had the same `status`, its `lastTransitionTime` is carried
/// over, otherwise `now` is recorded. Keeps the list sorted.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition, now: Time) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.or(Some(now))
            } else {
                Some(now)
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
    conditions.sort_by(condition_order);
}

/// Recompute the [`READY`] summary from the other conditions in the list and store it
pub fn set_summary(conditions: &mut Vec<Condition>, now: Time) {
    let summary = summarize(conditions);
    set(conditions, summary, now);
}

/// Find a condition by type
pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type exists and holds
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).is_some_and(|c| c.status)
}
