use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alarm severity, ordered from lowest to highest.
///
/// Ordering follows rank, not spelling: `Low < Moderate < Critical`.
///
/// # Examples
///
/// ```
/// use vigil_common::types::Severity;
///
/// let sev: Severity = "moderate".parse().unwrap();
/// assert_eq!(sev, Severity::Moderate);
/// assert_eq!(sev.to_string(), "moderate");
/// assert!(Severity::Critical > Severity::Low);
/// assert_eq!(Severity::Critical.rank(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    Critical,
}

impl Severity {
    /// Numeric rank used wherever severities are compared or sorted.
    pub fn rank(self) -> i64 {
        match self {
            Severity::Low => 1,
            Severity::Moderate => 2,
            Severity::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::Critical => "critical",
        }
    }

    pub const ALL: [Severity; 3] = [Severity::Low, Severity::Moderate, Severity::Critical];
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "moderate" => Ok(Severity::Moderate),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Evaluation state of an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmState {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "alarm")]
    Alarm,
    #[serde(rename = "insufficient data")]
    InsufficientData,
}

impl AlarmState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmState::Ok => "ok",
            AlarmState::Alarm => "alarm",
            AlarmState::InsufficientData => "insufficient data",
        }
    }
}

impl std::fmt::Display for AlarmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlarmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ok" => Ok(AlarmState::Ok),
            "alarm" => Ok(AlarmState::Alarm),
            "insufficient data" | "insufficient_data" => Ok(AlarmState::InsufficientData),
            _ => Err(format!("unknown alarm state: {s}")),
        }
    }
}

/// A recurring window during which an alarm is allowed to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConstraint {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Cron expression marking the start of the window.
    pub start: String,
    /// Window length in seconds.
    pub duration: u64,
    #[serde(default)]
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub alarm_id: String,
    pub enabled: bool,
    pub name: String,
    #[serde(rename = "type")]
    pub alarm_type: String,
    pub description: String,
    pub severity: Severity,
    pub state: AlarmState,
    pub state_reason: String,
    pub state_timestamp: DateTime<Utc>,
    /// Evaluator-specific rule payload; the storage layer never inspects it.
    pub rule: serde_json::Value,
    pub ok_actions: Vec<String>,
    pub alarm_actions: Vec<String>,
    pub insufficient_data_actions: Vec<String>,
    pub time_constraints: Vec<TimeConstraint>,
    pub repeat_actions: bool,
    pub evaluate_timestamp: Option<DateTime<Utc>>,
    pub user_id: String,
    pub project_id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Alarm {
    /// Builds an enabled alarm in `insufficient data` with no actions.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_common::types::{Alarm, AlarmState, Severity};
    ///
    /// let alarm = Alarm::new("a-1", "cpu high", "threshold", "user-1", "proj-1");
    /// assert_eq!(alarm.state, AlarmState::InsufficientData);
    /// assert_eq!(alarm.severity, Severity::Low);
    /// assert!(alarm.enabled);
    /// ```
    pub fn new(
        alarm_id: impl Into<String>,
        name: impl Into<String>,
        alarm_type: impl Into<String>,
        user_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            alarm_id: alarm_id.into(),
            enabled: true,
            name: name.into(),
            alarm_type: alarm_type.into(),
            description: String::new(),
            severity: Severity::Low,
            state: AlarmState::InsufficientData,
            state_reason: "Not evaluated yet".to_string(),
            state_timestamp: now,
            rule: serde_json::Value::Object(serde_json::Map::new()),
            ok_actions: Vec::new(),
            alarm_actions: Vec::new(),
            insufficient_data_actions: Vec::new(),
            time_constraints: Vec::new(),
            repeat_actions: false,
            evaluate_timestamp: None,
            user_id: user_id.into(),
            project_id: project_id.into(),
            timestamp: now,
        }
    }
}

/// Kind of change recorded in alarm history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmChangeType {
    #[serde(rename = "creation")]
    Creation,
    #[serde(rename = "rule change")]
    RuleChange,
    #[serde(rename = "state transition")]
    StateTransition,
    #[serde(rename = "deletion")]
    Deletion,
}

impl AlarmChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmChangeType::Creation => "creation",
            AlarmChangeType::RuleChange => "rule change",
            AlarmChangeType::StateTransition => "state transition",
            AlarmChangeType::Deletion => "deletion",
        }
    }
}

impl std::fmt::Display for AlarmChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlarmChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creation" => Ok(AlarmChangeType::Creation),
            "rule change" | "rule_change" => Ok(AlarmChangeType::RuleChange),
            "state transition" | "state_transition" => Ok(AlarmChangeType::StateTransition),
            "deletion" => Ok(AlarmChangeType::Deletion),
            _ => Err(format!("unknown alarm change type: {s}")),
        }
    }
}

/// One immutable entry of an alarm's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmChange {
    pub event_id: String,
    pub alarm_id: String,
    #[serde(rename = "type")]
    pub change_type: AlarmChangeType,
    /// Serialized description of what changed (usually JSON).
    pub detail: String,
    pub severity: Severity,
    pub on_behalf_of: String,
    pub user_id: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AlarmChange {
    /// A history entry for `alarm` stamped now, with a freshly generated
    /// `event_id`. Severity and ownership are copied from the alarm.
    ///
    /// ```
    /// use vigil_common::types::{Alarm, AlarmChange, AlarmChangeType};
    ///
    /// let alarm = Alarm::new("a-1", "cpu high", "threshold", "user-1", "proj-1");
    /// let change = AlarmChange::for_alarm(&alarm, AlarmChangeType::Creation, "{}", "proj-1");
    /// assert_eq!(change.alarm_id, "a-1");
    /// assert!(change.event_id.parse::<i64>().is_ok());
    /// ```
    pub fn for_alarm(
        alarm: &Alarm,
        change_type: AlarmChangeType,
        detail: impl Into<String>,
        on_behalf_of: impl Into<String>,
    ) -> Self {
        Self {
            event_id: crate::id::next_id(),
            alarm_id: alarm.alarm_id.clone(),
            change_type,
            detail: detail.into(),
            severity: alarm.severity,
            on_behalf_of: on_behalf_of.into(),
            user_id: alarm.user_id.clone(),
            project_id: alarm.project_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-project resource limit. `-1` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub project_id: String,
    pub resource: String,
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_rank_not_spelling() {
        let mut sevs = vec![Severity::Critical, Severity::Low, Severity::Moderate];
        sevs.sort();
        assert_eq!(sevs, vec![Severity::Low, Severity::Moderate, Severity::Critical]);
        // "critical" < "low" lexically, the enum must disagree
        assert!(Severity::Critical > Severity::Low);
    }

    #[test]
    fn alarm_state_round_trips_through_strings() {
        for state in [AlarmState::Ok, AlarmState::Alarm, AlarmState::InsufficientData] {
            assert_eq!(state.as_str().parse::<AlarmState>(), Ok(state));
        }
        assert!("broken".parse::<AlarmState>().is_err());
    }

    #[test]
    fn alarm_serializes_type_field_name() {
        let alarm = Alarm::new("a-1", "n", "threshold", "u", "p");
        let json = serde_json::to_value(&alarm).unwrap();
        assert_eq!(json["type"], "threshold");
        assert_eq!(json["state"], "insufficient data");
    }

    #[test]
    fn change_for_alarm_copies_ownership_and_gets_unique_ids() {
        let mut alarm = Alarm::new("a-1", "cpu high", "threshold", "user-1", "proj-1");
        alarm.severity = Severity::Critical;
        let first = AlarmChange::for_alarm(&alarm, AlarmChangeType::StateTransition, "{}", "proj-9");
        let second = AlarmChange::for_alarm(&alarm, AlarmChangeType::StateTransition, "{}", "proj-9");
        assert_ne!(first.event_id, second.event_id);
        assert_eq!(first.severity, Severity::Critical);
        assert_eq!(first.user_id, "user-1");
        assert_eq!(first.project_id, "proj-1");
        assert_eq!(first.on_behalf_of, "proj-9");
    }
}
