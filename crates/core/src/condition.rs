//! Status conditions recorded on a `HelmRelease`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    ChartFetched,
    Released,
    RolledBack,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::ChartFetched => "ChartFetched",
            ConditionType::Released => "Released",
            ConditionType::RolledBack => "RolledBack",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Machine readable reason attached to a condition transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    RepoFetchFailed,
    RepoChartInCache,
    HelmInstallFailed,
    UpdateDependencyFailed,
    HelmUpgradeFailed,
    HelmRollbackFailed,
    HelmSuccess,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::RepoFetchFailed => "RepoFetchFailed",
            Reason::RepoChartInCache => "RepoChartInCache",
            Reason::HelmInstallFailed => "HelmInstallFailed",
            Reason::UpdateDependencyFailed => "UpdateDependencyFailed",
            Reason::HelmUpgradeFailed => "HelmUpgradeFailed",
            Reason::HelmRollbackFailed => "HelmRollbackFailed",
            Reason::HelmSuccess => "HelmSuccess",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    pub reason: Reason,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_update_time: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(kind: ConditionType, status: ConditionStatus, reason: Reason, message: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            kind,
            status,
            reason,
            message: message.into(),
            last_update_time: Some(now.clone()),
            last_transition_time: Some(now),
        }
    }

    /// Replace the condition of the same type in `conditions`, keeping the
    /// previous transition time when the status did not flip. Other
    /// condition types are left alone.
    pub fn merge_into(mut self, conditions: &mut Vec<Condition>) {
        match conditions.iter_mut().find(|c| c.kind == self.kind) {
            Some(existing) => {
                if existing.status == self.status {
                    self.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = self;
            }
            None => conditions.push(self),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_transition_time_for_same_status() {
        let mut conds = vec![Condition {
            last_transition_time: Some("2020-01-01T00:00:00Z".into()),
            ..Condition::new(ConditionType::Released, ConditionStatus::True, Reason::HelmSuccess, "ok")
        }];
        Condition::new(ConditionType::Released, ConditionStatus::True, Reason::HelmSuccess, "again").merge_into(&mut conds);
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].message, "again");
        assert_eq!(conds[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));

        Condition::new(ConditionType::Released, ConditionStatus::False, Reason::HelmUpgradeFailed, "boom").merge_into(&mut conds);
        assert_ne!(conds[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));
    }

    #[test]
    fn conditions_are_independent() {
        let mut conds = Vec::new();
        Condition::new(ConditionType::ChartFetched, ConditionStatus::True, Reason::RepoChartInCache, "").merge_into(&mut conds);
        Condition::new(ConditionType::Released, ConditionStatus::False, Reason::HelmInstallFailed, "").merge_into(&mut conds);
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0].kind, ConditionType::ChartFetched);
        assert_eq!(conds[0].status, ConditionStatus::True);
    }

    #[test]
    fn serializes_with_wire_names() {
        let c = Condition::new(ConditionType::RolledBack, ConditionStatus::False, Reason::HelmRollbackFailed, "nope");
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "RolledBack");
        assert_eq!(v["status"], "False");
        assert_eq!(v["reason"], Reason::HelmRollbackFailed.as_str());
    }

    #[test]
    fn stored_unknown_status_flips_on_first_result() {
        let mut conds: Vec<Condition> = serde_json::from_value(serde_json::json!([
            { "type": "Released", "status": "Unknown", "reason": "HelmSuccess", "lastTransitionTime": "2020-01-01T00:00:00Z" }
        ]))
        .unwrap();
        assert_eq!(conds[0].status, ConditionStatus::Unknown);
        Condition::new(ConditionType::Released, ConditionStatus::True, Reason::HelmSuccess, "installed").merge_into(&mut conds);
        assert_eq!(conds[0].status, ConditionStatus::True);
        assert_ne!(conds[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));
    }
}
