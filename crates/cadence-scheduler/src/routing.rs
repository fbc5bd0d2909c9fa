use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SchedulerError};

/// Kind of work a template performs. Selects the execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Pull and store device configurations.
    Backup,
    /// Network discovery / reachability scan.
    Scan,
    /// Render configuration templates.
    Render,
    /// Push a flow deployment.
    Deploy,
    /// Synchronise inventory with an external source of truth.
    Sync,
    /// Run ad-hoc commands against a device set.
    Command,
    /// Housekeeping work.
    Cleanup,
    /// The template could not be resolved. Never routable.
    Unknown,
}

impl JobType {
    /// Every job type that can be routed to a queue.
    pub const ROUTABLE: [JobType; 7] = [
        JobType::Backup,
        JobType::Scan,
        JobType::Render,
        JobType::Deploy,
        JobType::Sync,
        JobType::Command,
        JobType::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Backup => "backup",
            JobType::Scan => "scan",
            JobType::Render => "render",
            JobType::Deploy => "deploy",
            JobType::Sync => "sync",
            JobType::Command => "command",
            JobType::Cleanup => "cleanup",
            JobType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "backup" => Ok(JobType::Backup),
            "scan" => Ok(JobType::Scan),
            "render" => Ok(JobType::Render),
            "deploy" => Ok(JobType::Deploy),
            "sync" => Ok(JobType::Sync),
            "command" => Ok(JobType::Command),
            "cleanup" => Ok(JobType::Cleanup),
            "unknown" => Ok(JobType::Unknown),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Execution lane on the broker. Lanes isolate heavy work from quick work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Default,
    Heavy,
    Network,
    Backup,
}

impl Queue {
    pub const ALL: [Queue; 4] = [Queue::Default, Queue::Heavy, Queue::Network, Queue::Backup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Default => "default",
            Queue::Heavy => "heavy",
            Queue::Network => "network",
            Queue::Backup => "backup",
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Queue {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "default" => Ok(Queue::Default),
            "heavy" => Ok(Queue::Heavy),
            "network" => Ok(Queue::Network),
            "backup" => Ok(Queue::Backup),
            other => Err(format!("unknown queue: {other}")),
        }
    }
}

/// Static job type → queue table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<JobType, Queue>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let routes = JobType::ROUTABLE
            .iter()
            .map(|&job_type| (job_type, builtin_queue(job_type)))
            .collect();
        Self { routes }
    }
}

/// Built-in lane for each routable job type.
fn builtin_queue(job_type: JobType) -> Queue {
    match job_type {
        JobType::Backup => Queue::Backup,
        JobType::Scan | JobType::Command => Queue::Network,
        JobType::Deploy | JobType::Sync => Queue::Heavy,
        JobType::Render | JobType::Cleanup | JobType::Unknown => Queue::Default,
    }
}

impl RoutingTable {
    /// Built-in table with textual overrides applied (e.g. from config).
    ///
    /// Every key must be a routable job type and every value a known queue;
    /// anything else fails startup instead of silently falling through.
    pub fn with_overrides<'a, I>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut table = Self::default();
        for (job_type, queue) in overrides {
            let parsed_type: JobType = job_type.parse().map_err(SchedulerError::Config)?;
            if parsed_type == JobType::Unknown {
                return Err(SchedulerError::Config(
                    "the 'unknown' job type cannot be routed".into(),
                ));
            }
            let parsed_queue: Queue = queue.parse().map_err(SchedulerError::Config)?;
            info!(job_type = %parsed_type, queue = %parsed_queue, "routing override");
            table.routes.insert(parsed_type, parsed_queue);
        }
        Ok(table)
    }

    /// Lane for `job_type`, or `None` when the job cannot be dispatched.
    pub fn route(&self, job_type: JobType) -> Option<Queue> {
        self.routes.get(&job_type).copied()
    }
}
