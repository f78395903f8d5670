use crate::internal::common::bitmap::Bitmap;
use crate::internal::plugins::gres::GresCoreAffinity;
use crate::internal::resources::jobres::JobResources;
use crate::internal::resources::offset::SocketCores;
use crate::internal::step::error::StepError;
use crate::internal::step::request::TaskDistribution;
use smallvec::SmallVec;

pub(crate) struct CorePick<'a> {
    pub job_node: usize,
    pub cores_needed: usize,
    pub distribution: TaskDistribution,
    pub affinity: Option<&'a GresCoreAffinity>,
    /// Only cores bound to the requested GRES may be used
    pub strict_binding: bool,
    /// Cores used by other steps may be taken once idle ones run out
    pub oversubscribe: bool,
    /// Treat every allocated core as idle
    pub ignore_used: bool,
}

/// Node-local core indices in the order in which the distribution visits them.
fn core_order(shape: SocketCores, distribution: TaskDistribution) -> Vec<usize> {
    let sockets = shape.sockets as usize;
    let cores = shape.cores as usize;
    match distribution {
        TaskDistribution::Block | TaskDistribution::Arbitrary => (0..sockets * cores).collect(),
        TaskDistribution::Cyclic => (0..cores)
            .flat_map(|core| (0..sockets).map(move |socket| socket * cores + core))
            .collect(),
        TaskDistribution::Plane(size) => {
            let size = (size as usize).max(1);
            let mut order = Vec::with_capacity(sockets * cores);
            for start in (0..cores).step_by(size) {
                for socket in 0..sockets {
                    for core in start..(start + size).min(cores) {
                        order.push(socket * cores + core);
                    }
                }
            }
            order
        }
    }
}

/// Picks cores of one node for a step and sets them in `picked` (job core bit space).
///
/// Idle cores are taken in passes: bound to all requested GRES, bound to any of them, then
/// (without strict binding) the rest. Used cores follow in the same order when
/// oversubscription is allowed.
pub(crate) fn pick_node_cores(
    resources: &JobResources,
    pick: &CorePick,
    picked: &mut Bitmap,
) -> Result<(), StepError> {
    let (Some(range), Some(shape)) = (
        resources.node_core_range(pick.job_node),
        resources.node_shape(pick.job_node),
    ) else {
        return Err(StepError::NodeConfigUnavailable);
    };
    let allocated: SmallVec<[usize; 64]> = core_order(shape, pick.distribution)
        .into_iter()
        .filter(|local| resources.core_bitmap.test(range.start + local))
        .collect();
    if allocated.len() < pick.cores_needed {
        return Err(StepError::TooManyCpus);
    }

    let is_used =
        |local: usize| !pick.ignore_used && resources.core_bitmap_used.test(range.start + local);
    let tiers: SmallVec<[Option<&Bitmap>; 3]> = match pick.affinity {
        Some(affinity) if pick.strict_binding => [Some(&affinity.all), Some(&affinity.any)]
            .into_iter()
            .collect(),
        Some(affinity) => [Some(&affinity.all), Some(&affinity.any), None]
            .into_iter()
            .collect(),
        None => [None].into_iter().collect(),
    };
    let mut passes: SmallVec<[(bool, Option<&Bitmap>); 6]> =
        tiers.iter().map(|tier| (false, *tier)).collect();
    if pick.oversubscribe {
        passes.extend(tiers.iter().map(|tier| (true, *tier)));
    }

    let mut count = 0;
    for (used, tier) in passes {
        for local in &allocated {
            if count == pick.cores_needed {
                return Ok(());
            }
            let bit = range.start + local;
            if picked.test(bit) || is_used(*local) != used {
                continue;
            }
            if tier.is_some_and(|bound| !bound.test(*local)) {
                continue;
            }
            picked.set(bit);
            count += 1;
        }
    }
    if count < pick.cores_needed {
        log::debug!(
            "Job node {} has {count} usable cores, {} needed",
            pick.job_node,
            pick.cores_needed
        );
        return Err(if pick.affinity.is_some() && pick.strict_binding {
            StepError::GresBusy
        } else {
            StepError::NodesBusy
        });
    }
    Ok(())
}
