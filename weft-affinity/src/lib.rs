//! Affinity plan resolution: turn a worker count plus a handful of
//! knobs into one [`PuMask`] per worker.

use weft_error::{weft_error, ErrorKind, WeftError};
use weft_mask::PuMask;
use weft_topology::Topology;

/// The domain a round-robin-derived mask is centered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Pu,
    Core,
    Socket,
    Machine,
}

impl Domain {
    /// Domain names are matched by prefix (`"co"` matches `Core`, `"soc"`
    /// matches `Socket`).
    pub fn parse(name: &str) -> Option<Domain> {
        let name = name.to_ascii_lowercase();
        for (prefix, domain) in [
            ("pu", Domain::Pu),
            ("core", Domain::Core),
            ("socket", Domain::Socket),
            ("machine", Domain::Machine),
        ] {
            if prefix.starts_with(name.as_str()) || name.starts_with(prefix) {
                return Some(domain);
            }
        }
        None
    }
}

/// `pu_offset` is either an explicit value or "derive it from `used_cores`".
#[derive(Debug, Clone, Copy)]
pub enum PuOffset {
    Unspecified,
    Explicit(usize),
}

#[derive(Debug, Clone)]
pub struct AffinityRequest {
    pub worker_count: usize,
    pub max_cores: Option<usize>,
    pub pu_offset: PuOffset,
    pub pu_step: usize,
    pub used_cores: usize,
    pub domain: Domain,
    /// A `;`-separated list of explicit PU masks (one per worker), or
    /// `"none"` to disable affinity entirely, or empty to fall through to
    /// the offset/step derivation.
    pub textual_plan: String,
    pub use_process_mask: bool,
}

impl Default for AffinityRequest {
    fn default() -> Self {
        AffinityRequest {
            worker_count: 1,
            max_cores: None,
            pu_offset: PuOffset::Unspecified,
            pu_step: 1,
            used_cores: 1,
            domain: Domain::Core,
            textual_plan: String::new(),
            use_process_mask: false,
        }
    }
}

/// The resolved, per-worker PU mask sequence.
#[derive(Debug, Clone)]
pub struct AffinityPlan {
    masks: Vec<PuMask>,
    /// Cached lowest PU offset across all non-empty worker masks; updated by
    /// [`AffinityPlan::add_punit`].
    offset: Option<usize>,
}

impl AffinityPlan {
    pub fn masks(&self) -> &[PuMask] {
        &self.masks
    }

    pub fn get_pu_mask(&self, worker: usize) -> &PuMask {
        &self.masks[worker]
    }

    /// Set bit `thread_num` in worker `virt_core`'s mask, then refresh the
    /// cached offset to the minimum set bit across all workers.
    pub fn add_punit(&mut self, virt_core: usize, thread_num: usize) {
        self.masks[virt_core].set(thread_num);
        self.offset = self
            .masks
            .iter()
            .filter_map(|m| m.find_first())
            .min();
    }

    pub fn cached_offset(&self) -> Option<usize> {
        self.offset
    }
}

/// Resolve an [`AffinityRequest`] against a discovered [`Topology`].
pub fn resolve(topo: &Topology, req: &AffinityRequest) -> Result<AffinityPlan, WeftError> {
    let width = topo.width().max(1);

    // 1. "none" disables affinity entirely.
    if req.textual_plan.trim().eq_ignore_ascii_case("none") {
        let masks = (0..req.worker_count).map(|_| PuMask::new(width)).collect();
        return Ok(AffinityPlan { masks, offset: None });
    }

    // 2. An explicit textual plan must yield exactly `worker_count` non-empty
    // masks.
    if !req.textual_plan.trim().is_empty() {
        let parts: Vec<&str> = req
            .textual_plan
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() != req.worker_count {
            return Err(weft_error!(
                ErrorKind::BadParameter,
                "affinity plan names {} mask(s) but {} workers were requested",
                parts.len(),
                req.worker_count
            ));
        }
        let mut masks = Vec::with_capacity(parts.len());
        for p in parts {
            let mask = PuMask::parse(p)
                .map_err(|e| weft_error!(ErrorKind::BadParameter, "invalid mask {p:?}: {e}"))?;
            if !mask.any() {
                return Err(weft_error!(
                    ErrorKind::BadParameter,
                    "affinity plan entry {p:?} resolves to an empty mask"
                ));
            }
            masks.push(mask);
        }
        return Ok(AffinityPlan { masks, offset: None });
    }

    // 3/4. Derive an offset, then round-robin with rollover.
    let base_offset = match req.pu_offset {
        PuOffset::Explicit(v) => v,
        PuOffset::Unspecified => topo.first_n_cores_pu_count(req.used_cores),
    };

    let mut masks = Vec::with_capacity(req.worker_count);
    for i in 0..req.worker_count {
        let raw = base_offset + req.pu_step * i;
        let rollover = if req.pu_step == 0 {
            0
        } else {
            (raw / width) % req.pu_step
        };
        let pu_i = (raw + rollover) % width;
        masks.push(domain_mask(topo, req.domain, pu_i));
    }

    if req.use_process_mask {
        let process_mask = topo.current_affinity()?;
        for m in masks.iter_mut() {
            *m = m.and(&process_mask).unwrap_or_else(|_| m.clone());
        }
    }

    Ok(AffinityPlan { masks, offset: Some(base_offset) })
}

fn domain_mask(topo: &Topology, domain: Domain, pu: usize) -> PuMask {
    match domain {
        Domain::Pu => topo.thread_mask(pu).clone(),
        Domain::Core => topo.core_mask(pu).clone(),
        Domain::Socket => topo.socket_mask(pu).clone(),
        Domain::Machine => topo.machine_mask().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_plan_yields_empty_masks() {
        let topo = Topology::discover();
        let req = AffinityRequest {
            worker_count: 4,
            textual_plan: "none".to_string(),
            ..Default::default()
        };
        let plan = resolve(&topo, &req).unwrap();
        assert_eq!(plan.masks().len(), 4);
        assert!(plan.masks().iter().all(|m| !m.any()));
    }

    #[test]
    fn explicit_plan_mismatched_count_rejected() {
        let topo = Topology::discover();
        let req = AffinityRequest {
            worker_count: 2,
            textual_plan: "0x1".to_string(),
            ..Default::default()
        };
        assert!(resolve(&topo, &req).is_err());
    }

    #[test]
    fn round_robin_assigns_distinct_machine_masks_for_single_pu_domain() {
        let topo = Topology::discover();
        if topo.num_pus() < 2 {
            return;
        }
        let req = AffinityRequest {
            worker_count: topo.num_pus(),
            domain: Domain::Pu,
            pu_step: 1,
            ..Default::default()
        };
        let plan = resolve(&topo, &req).unwrap();
        for m in plan.masks() {
            assert_eq!(m.count(), 1);
        }
    }

    #[test]
    fn add_punit_updates_cached_offset() {
        let topo = Topology::discover();
        let req = AffinityRequest {
            worker_count: 2,
            textual_plan: "none".to_string(),
            ..Default::default()
        };
        let mut plan = resolve(&topo, &req).unwrap();
        plan.add_punit(0, 3);
        plan.add_punit(1, 1);
        assert_eq!(plan.cached_offset(), Some(1));
    }

    #[test]
    fn domain_prefix_matching() {
        assert_eq!(Domain::parse("co"), Some(Domain::Core));
        assert_eq!(Domain::parse("socket"), Some(Domain::Socket));
        assert_eq!(Domain::parse("mach"), Some(Domain::Machine));
    }
}
