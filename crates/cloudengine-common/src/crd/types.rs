//! Condition model shared by the Cluster and Experiment CRDs
//!
//! A [`Conditions`] ledger is an ordered list of typed conditions keyed by
//! condition type. Each type appears at most once; upserting an existing type
//! replaces it in place so the order of first insertion is stable.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// Marker for enums usable as a condition type key
pub trait ConditionType:
    Copy + Eq + Debug + Serialize + DeserializeOwned + JsonSchema + Send + Sync + 'static
{
}

impl<T> ConditionType for T where
    T: Copy + Eq + Debug + Serialize + DeserializeOwned + JsonSchema + Send + Sync + 'static
{
}

/// Kubernetes-style condition with probe and transition timestamps
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition<T> {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: T,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition was observed
    pub last_probe_time: DateTime<Utc>,

    /// Last time the condition status changed
    pub last_transition_time: DateTime<Utc>,
}

impl<T: ConditionType> Condition<T> {
    /// Create a new condition with both timestamps set to now
    pub fn new(
        type_: T,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::at(type_, status, reason, message, Utc::now())
    }

    /// Create a new condition with both timestamps set to `now`
    pub fn at(
        type_: T,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_probe_time: now,
            last_transition_time: now,
        }
    }

    /// True if the condition status is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Ordered condition ledger keyed by condition type
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct Conditions<T>(Vec<Condition<T>>);

impl<T> Default for Conditions<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: ConditionType> Conditions<T> {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the condition of the given type
    pub fn query(&self, type_: T) -> Option<&Condition<T>> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Check whether the condition of `type_` has `expected` status.
    ///
    /// An absent condition never satisfies `True` and always satisfies any
    /// other expected status.
    pub fn check(&self, type_: T, expected: ConditionStatus) -> bool {
        match self.query(type_) {
            Some(c) => c.status == expected,
            None => expected != ConditionStatus::True,
        }
    }

    /// Shorthand for `check(type_, ConditionStatus::True)`
    pub fn is_true(&self, type_: T) -> bool {
        self.check(type_, ConditionStatus::True)
    }

    /// Insert or replace the condition of the same type.
    ///
    /// A replaced condition keeps its position. When the status is unchanged
    /// the previous `last_transition_time` is kept; the probe time always
    /// comes from the incoming condition.
    pub fn upsert(&mut self, mut condition: Condition<T>) {
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.0.push(condition),
        }
    }

    /// Build a condition stamped at `now` and upsert it
    pub fn set(
        &mut self,
        type_: T,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.upsert(Condition::at(type_, status, reason, message, now));
    }

    /// Like [`Conditions::set`], but leaves an identical condition untouched.
    ///
    /// Returns `true` if the ledger changed. Use this for observations that
    /// are re-derived every pass so a steady state produces no status write.
    pub fn ensure(
        &mut self,
        type_: T,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();
        if let Some(existing) = self.query(type_) {
            if existing.status == status && existing.reason == reason && existing.message == message
            {
                return false;
            }
        }
        self.set(type_, status, reason, message, now);
        true
    }

    /// Iterate conditions in ledger order
    pub fn iter(&self) -> impl Iterator<Item = &Condition<T>> {
        self.0.iter()
    }

    /// Number of conditions
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no condition has been recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: ConditionType> FromIterator<Condition<T>> for Conditions<T> {
    fn from_iter<I: IntoIterator<Item = Condition<T>>>(iter: I) -> Self {
        let mut ledger = Self::new();
        for condition in iter {
            ledger.upsert(condition);
        }
        ledger
    }
}
