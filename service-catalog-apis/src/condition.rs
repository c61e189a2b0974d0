use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type signalling that the last reconciliation succeeded.
pub const READY: &str = "Ready";

/// Condition type signalling a terminal failure which is not retried.
pub const FAILED: &str = "Failed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(v: bool) -> Self {
        if v { Self::True } else { Self::False }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// We maintain our own Condition type as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// type of condition in CamelCase, `Ready` or `Failed`.
    #[serde(rename = "type")]
    pub type_: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,

    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last update.
    pub reason: String,

    /// message is a human readable message indicating details about the last update.
    pub message: String,
}

/// Ordered set of [`Condition`]s, keyed by condition type.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// Upsert the condition of type `type_`.
    ///
    /// `lastTransitionTime` is only moved to `now` if the condition is new or
    /// its status flips, reason and message are updated independently.
    /// Returns `true` if anything changed.
    pub fn set(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                let mut changed = false;
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = now;
                    changed = true;
                }
                if existing.reason != reason {
                    existing.reason = reason.to_string();
                    changed = true;
                }
                if existing.message != message {
                    existing.message = message.to_string();
                    changed = true;
                }
                changed
            }
            None => {
                self.0.push(Condition {
                    type_: type_.to_string(),
                    status,
                    last_transition_time: now,
                    reason: reason.to_string(),
                    message: message.to_string(),
                });
                true
            }
        }
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn is_false(&self, type_: &str) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::False)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }
}
