//! Partitioned execution
//!
//! Break totals only hold under strictly sequential processing, so the one
//! supported form of parallelism is splitting the input by group key into
//! fully independent jobs. Each partition job owns its accumulator, fault
//! state, checkpoint and run lock; nothing is shared between them.

use std::collections::{BTreeMap, BTreeSet};

use ledgerflow_common::Money;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::control::JobControl;
use super::coordinator::BatchJob;
use super::report::JobReport;
use super::types::{Amounted, JobStatus, Record};
use crate::error::{BatchError, BatchResult};

/// Split records into `partitions` groups with disjoint group keys
///
/// Distinct group keys are dealt out round-robin in key order; records keep
/// their relative order inside a partition. Always returns `partitions`
/// vectors (some may be empty).
pub fn partition_by_group<P>(records: Vec<Record<P>>, partitions: usize) -> Vec<Vec<Record<P>>> {
    let partitions = partitions.max(1);
    let groups: BTreeSet<&str> = records.iter().map(|r| r.group_key.as_str()).collect();
    let assignment: BTreeMap<String, usize> = groups
        .into_iter()
        .enumerate()
        .map(|(idx, group)| (group.to_string(), idx % partitions))
        .collect();

    let mut out: Vec<Vec<Record<P>>> = (0..partitions).map(|_| Vec::new()).collect();
    for record in records {
        let idx = assignment.get(&record.group_key).copied().unwrap_or(0);
        out[idx].push(record);
    }
    out
}

/// Reports of all partitions of one logical job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionedReport {
    pub partitions: Vec<JobReport>,
}

impl PartitionedReport {
    /// Worst partition status: FAILED, then STOPPED, then COMPLETED_WITH_SKIPS
    pub fn status(&self) -> JobStatus {
        let statuses: Vec<JobStatus> = self.partitions.iter().map(|r| r.status).collect();
        [
            JobStatus::Failed,
            JobStatus::Stopped,
            JobStatus::CompletedWithSkips,
        ]
        .into_iter()
        .find(|s| statuses.contains(s))
        .unwrap_or(JobStatus::Completed)
    }

    pub fn committed(&self) -> u64 {
        self.partitions.iter().map(|r| r.committed).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.partitions.iter().map(|r| r.skipped).sum()
    }

    pub fn grand_total(&self) -> Money {
        self.partitions.iter().map(|r| r.grand_total).sum()
    }
}

/// Run one job per partition concurrently
///
/// Every job gets a child of `control`, so stopping the parent stops all
/// partitions. Fails only if a partition could not start or its task died.
pub async fn run_partitioned<P>(jobs: Vec<BatchJob<P>>, control: &JobControl) -> BatchResult<PartitionedReport>
where
    P: Amounted + Clone + Send + Sync + 'static,
{
    let count = jobs.len();
    tracing::info!(partitions = count, "Starting partitioned run");

    let mut set = JoinSet::new();
    for (idx, job) in jobs.into_iter().enumerate() {
        let control = control.child();
        set.spawn(async move { (idx, job.run(&control).await) });
    }

    let mut reports: Vec<(usize, JobReport)> = Vec::with_capacity(count);
    let mut first_error: Option<BatchError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, Ok(report))) => reports.push((idx, report)),
            Ok((idx, Err(e))) => {
                tracing::error!(partition = idx, error = %e, "Partition did not start");
                first_error.get_or_insert(e);
            },
            Err(e) => {
                tracing::error!(error = %e, "Partition task failed");
                first_error.get_or_insert(BatchError::Unknown(format!("partition task failed: {}", e)));
            },
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    reports.sort_by_key(|(idx, _)| *idx);
    Ok(PartitionedReport {
        partitions: reports.into_iter().map(|(_, r)| r).collect(),
    })
}
