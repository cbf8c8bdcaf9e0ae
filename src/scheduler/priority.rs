//! Job priority tiers and the slot-to-queue assignment policy.
//!
//! Workers are assigned queues by their ordinal position in the pool. The
//! first `high` slots serve only `HIGH`, the next `medium` serve only
//! `MEDIUM`, the next `low` serve only `LOW`, and every remaining slot
//! serves all three tiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Priority class of a job. Each variant maps 1:1 onto a Redis queue name.
///
/// The derived ordering is the serving order: a worker that serves several
/// tiers always drains `High` before `Medium` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPriority {
    High,
    Medium,
    Low,
}

impl JobPriority {
    /// All tiers in serving order.
    pub const ALL: [JobPriority; 3] = [JobPriority::High, JobPriority::Medium, JobPriority::Low];

    /// Returns the queue name for this tier.
    pub fn name(&self) -> &'static str {
        match self {
            JobPriority::High => "HIGH",
            JobPriority::Medium => "MEDIUM",
            JobPriority::Low => "LOW",
        }
    }

    /// Parses a priority name, falling back to `Medium` for anything unknown.
    ///
    /// Used on the enqueue path where a bad priority should not reject the job.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(priority = name, "Received job with invalid priority, using MEDIUM");
            JobPriority::Medium
        })
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "HIGH" => Ok(JobPriority::High),
            "MEDIUM" => Ok(JobPriority::Medium),
            "LOW" => Ok(JobPriority::Low),
            other => Err(format!("Unknown job priority: {}", other)),
        }
    }
}

/// The set of priority queues a worker slot consumes from.
///
/// A slot serves either exactly one tier or every tier; there is no other
/// shape, so the set is never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueAssignment {
    /// Serves a single named tier.
    Single(JobPriority),
    /// Serves every tier, in serving order.
    All,
}

impl QueueAssignment {
    /// Tiers served by this assignment, in serving order.
    pub fn priorities(&self) -> Vec<JobPriority> {
        match self {
            QueueAssignment::Single(priority) => vec![*priority],
            QueueAssignment::All => JobPriority::ALL.to_vec(),
        }
    }

    /// Queue names served by this assignment, in serving order.
    pub fn queue_names(&self) -> Vec<&'static str> {
        self.priorities().iter().map(JobPriority::name).collect()
    }

    /// Returns whether this assignment includes the given tier.
    pub fn serves(&self, priority: JobPriority) -> bool {
        match self {
            QueueAssignment::Single(p) => *p == priority,
            QueueAssignment::All => true,
        }
    }
}

impl fmt::Display for QueueAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.queue_names().join(","))
    }
}

impl FromStr for QueueAssignment {
    type Err = String;

    /// Parses `HIGH` or `HIGH,MEDIUM,LOW` (any order, case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tiers = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse::<JobPriority>)
            .collect::<Result<Vec<_>, _>>()?;
        tiers.sort();
        tiers.dedup();

        match tiers.as_slice() {
            [] => Err("Queue assignment must name at least one priority".to_string()),
            [single] => Ok(QueueAssignment::Single(*single)),
            all if all.len() == JobPriority::ALL.len() => Ok(QueueAssignment::All),
            _ => Err(format!(
                "Queue assignment must be a single priority or all priorities, got '{}'",
                s
            )),
        }
    }
}

/// Number of workers dedicated to each tier. Slots beyond
/// `high + medium + low` serve all tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityCounts {
    pub fn new(high: usize, medium: usize, low: usize) -> Self {
        Self { high, medium, low }
    }

    /// Total number of tier-dedicated slots.
    pub fn dedicated(&self) -> usize {
        self.high + self.medium + self.low
    }

    /// Queue assignment for the slot at `slot_index`.
    pub fn assign(&self, slot_index: usize) -> QueueAssignment {
        assign_queue_names(slot_index, self.high, self.medium, self.low)
    }
}

/// Maps a worker's ordinal position to the tiers it serves.
///
/// Pure function of its inputs. Called once per slot at pool start and again
/// with the same inputs whenever the slot is respawned.
pub fn assign_queue_names(
    slot_index: usize,
    high: usize,
    medium: usize,
    low: usize,
) -> QueueAssignment {
    if slot_index < high {
        QueueAssignment::Single(JobPriority::High)
    } else if slot_index < high + medium {
        QueueAssignment::Single(JobPriority::Medium)
    } else if slot_index < high + medium + low {
        QueueAssignment::Single(JobPriority::Low)
    } else {
        QueueAssignment::All
    }
}
