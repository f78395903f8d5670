use crate::internal::step::error::StepError;
use crate::internal::step::request::TaskDistribution;

/// Task counts and task ranks per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskPlacement {
    pub tasks: Vec<u16>,
    pub tids: Vec<Vec<u32>>,
}

/// Spreads `num_tasks` over nodes with the given task capacities.
///
/// Every node gets at least one task. Block fills nodes in order, cyclic and plane deal
/// tasks (one or `plane` at a time) round robin. With `overcommit` the capacities may be
/// exceeded once all of them are used up.
pub(crate) fn distribute_tasks(
    num_tasks: u32,
    capacities: &[u32],
    distribution: TaskDistribution,
    overcommit: bool,
) -> Result<TaskPlacement, StepError> {
    let n = capacities.len();
    if n == 0 || (num_tasks as usize) < n {
        return Err(StepError::BadTaskCount);
    }
    let mut counts = vec![1u32; n];
    let mut remaining = num_tasks - n as u32;

    match distribution {
        TaskDistribution::Block | TaskDistribution::Arbitrary => {
            for (count, capacity) in counts.iter_mut().zip(capacities) {
                let add = remaining.min(capacity.saturating_sub(*count));
                *count += add;
                remaining -= add;
            }
        }
        TaskDistribution::Cyclic | TaskDistribution::Plane(_) => {
            let chunk = match distribution {
                TaskDistribution::Plane(size) => size.max(1) as u32,
                _ => 1,
            };
            while remaining > 0 {
                let mut progress = false;
                for (count, capacity) in counts.iter_mut().zip(capacities) {
                    if remaining == 0 {
                        break;
                    }
                    let add = chunk.min(remaining).min(capacity.saturating_sub(*count));
                    if add > 0 {
                        *count += add;
                        remaining -= add;
                        progress = true;
                    }
                }
                if !progress {
                    break;
                }
            }
        }
    }

    if remaining > 0 {
        if !overcommit {
            return Err(StepError::NodesBusy);
        }
        let mut node = 0;
        while remaining > 0 {
            counts[node] += 1;
            remaining -= 1;
            node = (node + 1) % n;
        }
    }

    let tasks = counts
        .iter()
        .map(|c| u16::try_from(*c).map_err(|_| StepError::BadTaskCount))
        .collect::<Result<Vec<u16>, StepError>>()?;
    let tids = assign_task_ids(&counts, distribution);
    Ok(TaskPlacement { tasks, tids })
}

/// Assigns global task ranks to nodes that hold `counts` tasks.
fn assign_task_ids(counts: &[u32], distribution: TaskDistribution) -> Vec<Vec<u32>> {
    let mut tids: Vec<Vec<u32>> = counts
        .iter()
        .map(|c| Vec::with_capacity(*c as usize))
        .collect();
    let total: u32 = counts.iter().sum();
    let chunk = match distribution {
        TaskDistribution::Block | TaskDistribution::Arbitrary => {
            let mut rank = 0;
            for (node, count) in counts.iter().enumerate() {
                tids[node].extend(rank..rank + count);
                rank += count;
            }
            return tids;
        }
        TaskDistribution::Cyclic => 1,
        TaskDistribution::Plane(size) => size.max(1) as u32,
    };
    let mut rank = 0;
    while rank < total {
        for (node, count) in counts.iter().enumerate() {
            let free = count - tids[node].len() as u32;
            let take = free.min(chunk).min(total - rank);
            tids[node].extend(rank..rank + take);
            rank += take;
        }
    }
    tids
}

/// Placement given by an explicit node per task; `task_nodes` holds step node positions.
pub(crate) fn arbitrary_placement(task_nodes: &[usize], node_count: usize) -> TaskPlacement {
    let mut tids = vec![Vec::new(); node_count];
    for (rank, node) in task_nodes.iter().enumerate() {
        tids[*node].push(rank as u32);
    }
    let tasks = tids.iter().map(|t| t.len() as u16).collect();
    TaskPlacement { tasks, tids }
}
