use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key → value map handed to the execution layer untouched.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// How a schedule's occurrences are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fire once, immediately, when the caller asks for it.
    Now,
    /// Every `interval_minutes`.
    Interval,
    /// Top of every hour.
    Hourly,
    /// Every day at `start_time`.
    Daily,
    /// Once a week at `start_time`.
    Weekly,
    /// Once a month at `start_time`.
    Monthly,
    /// Cron expression in `cron_expression`.
    Custom,
}

impl ScheduleType {
    /// Whether `start_time` must be provided for this type.
    pub fn requires_start_time(&self) -> bool {
        matches!(
            self,
            ScheduleType::Daily | ScheduleType::Weekly | ScheduleType::Monthly
        )
    }

    /// Whether `start_time` carries any meaning for this type.
    pub fn uses_start_time(&self) -> bool {
        self.requires_start_time() || *self == ScheduleType::Hourly
    }
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleType::Now => "now",
            ScheduleType::Interval => "interval",
            ScheduleType::Hourly => "hourly",
            ScheduleType::Daily => "daily",
            ScheduleType::Weekly => "weekly",
            ScheduleType::Monthly => "monthly",
            ScheduleType::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "now" => Ok(ScheduleType::Now),
            "interval" => Ok(ScheduleType::Interval),
            "hourly" => Ok(ScheduleType::Hourly),
            "daily" => Ok(ScheduleType::Daily),
            "weekly" => Ok(ScheduleType::Weekly),
            "monthly" => Ok(ScheduleType::Monthly),
            "custom" => Ok(ScheduleType::Custom),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// A persisted schedule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// UUIDv7 string. Primary key, never changes.
    pub id: String,
    /// User-facing unique name.
    pub identifier: String,
    /// Reference to the work definition to execute.
    pub template_ref: String,
    pub schedule_type: ScheduleType,
    /// Set only for `custom`.
    pub cron_expression: Option<String>,
    /// Set only for `interval`.
    pub interval_minutes: Option<u32>,
    /// `HH:MM` (UTC) for hourly/daily/weekly/monthly.
    pub start_time: Option<String>,
    /// Anchor for the first occurrence and for the weekly weekday / monthly day.
    pub start_date: Option<NaiveDate>,
    pub is_active: bool,
    /// Global schedules are visible to everyone; private ones only to `owner_id`.
    pub is_global: bool,
    pub owner_id: Option<String>,
    /// Instant of the most recent trigger.
    pub last_run: Option<DateTime<Utc>>,
    /// Instant of the next planned trigger. `None` while inactive.
    pub next_run: Option<DateTime<Utc>>,
    pub parameters: Parameters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`ScheduleManager::create`](crate::manager::ScheduleManager::create).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub identifier: String,
    pub template_ref: String,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default = "bool_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub parameters: Parameters,
}

fn bool_true() -> bool {
    true
}

impl NewSchedule {
    /// An active, global schedule with no timing details filled in yet.
    pub fn new(
        identifier: impl Into<String>,
        template_ref: impl Into<String>,
        schedule_type: ScheduleType,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            template_ref: template_ref.into(),
            schedule_type,
            cron_expression: None,
            interval_minutes: None,
            start_time: None,
            start_date: None,
            is_active: true,
            is_global: true,
            owner_id: None,
            parameters: Parameters::new(),
        }
    }

    pub fn with_interval(mut self, minutes: u32) -> Self {
        self.interval_minutes = Some(minutes);
        self
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }

    pub fn with_start_time(mut self, hh_mm: impl Into<String>) -> Self {
        self.start_time = Some(hh_mm.into());
        self
    }

    pub fn with_start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    /// Make the schedule private to `owner_id`.
    pub fn owned_by(mut self, owner_id: impl Into<String>) -> Self {
        self.is_global = false;
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Partial update. `None` leaves a field unchanged.
///
/// `start_date` and `owner_id` can also be cleared: `Some(None)`, or an
/// explicit `null` in JSON. Timing fields that do not apply to the resulting
/// `schedule_type` are cleared on write regardless of what is passed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub identifier: Option<String>,
    pub template_ref: Option<String>,
    pub schedule_type: Option<ScheduleType>,
    pub cron_expression: Option<String>,
    pub interval_minutes: Option<u32>,
    pub start_time: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<Option<NaiveDate>>,
    pub is_active: Option<bool>,
    pub is_global: Option<bool>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<Option<String>>,
    pub parameters: Option<Parameters>,
}

/// Distinguishes an explicit `null` (`Some(None)`) from a missing field (`None`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Filters for [`ScheduleManager::list`](crate::manager::ScheduleManager::list).
/// All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub owner_id: Option<String>,
    pub is_global: Option<bool>,
    pub is_active: Option<bool>,
    /// Global schedules plus the private ones owned by this user.
    pub visible_to: Option<String>,
}
