// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Discrete-event critical-path simulator.
//!
//! Walks the mapped work items honoring dependencies and produces the step
//! timeline. Each device owns two resource lanes — a compute engine and a
//! communication engine — with mutual exclusion enforced per lane, never per
//! device, so compute overlaps communication.
//!
//! The event loop processes completion events in time order, ties broken by
//! item creation order. Collectives drain as fluid flows over the physical
//! links they occupy: whenever the set of in-flight transfers on any link
//! changes, every flow's bandwidth share is recomputed by progressive-fill
//! max-min fairness and its completion event is re-derived. Superseded
//! events stay in the heap and are skipped by a version check, so simulated
//! time only ever advances.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use shunt_topology::{LinkId, Topology};
use shunt_track::{LaneKind, Span, Tracker};
use shunt_workload::{CollectiveKind, MappedWorkload, WorkId, WorkItem, WorkKind};

use crate::collective::CollectiveModel;
use crate::memory::{MemoryReport, MemoryTracker};
use crate::report::CommTotals;
use crate::types::{Condition, SimResult};

/// Bound on progressive-fill passes before contention resolution gives up
/// and reports [`Condition::ContentionUnresolved`].
const MAX_FILL_PASSES: usize = 32;

/// Floor on a flow's granted rate fraction, so completion times stay finite.
const MIN_RATE: f64 = 1e-9;

/// The raw result of simulating one step.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    /// Maximum end time over all work items, in seconds.
    pub step_time_s: f64,
    /// Compute-lane busy time per device, in seconds.
    pub compute_busy_s: Vec<f64>,
    /// Busy time per physical link, in seconds.
    pub link_busy_s: Vec<f64>,
    /// Aggregate wall time of FLOP-bearing compute items.
    pub gemm_time_s: f64,
    /// Aggregate wall time of bandwidth-bound (zero-FLOP) compute items.
    pub lookup_time_s: f64,
    /// Aggregate wall time per collective kind.
    pub comm_time: CommTotals,
    /// Memory accounting for the step.
    pub memory: MemoryReport,
    /// Non-fatal conditions observed during the step.
    pub conditions: Vec<Condition>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Event {
    time_s: f64,
    item: WorkId,
    version: u64,
}

impl Eq for Event {}

// BinaryHeap is a max-heap; reverse the comparison so the earliest event
// (lowest item id on ties) pops first.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time_s
            .total_cmp(&self.time_s)
            .then_with(|| other.item.cmp(&self.item))
            .then_with(|| other.version.cmp(&self.version))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Flow {
    links: Vec<LinkId>,
    /// Bandwidth the flow uses when alone on its links, in bytes/s.
    demand: f64,
    /// Seconds left at the unshared rate.
    remaining_s: f64,
    /// Fraction of the unshared rate currently granted.
    rate: f64,
    last_update_s: f64,
}

/// The per-run simulator. Construct, call [`Scheduler::run`], discard.
pub struct Scheduler<'a> {
    topo: &'a Topology,
    model: &'a CollectiveModel,
    tracker: &'a Tracker,
}

struct RunState<'a> {
    items: &'a [WorkItem],
    /// Deduplicated dependency lists (the mapper may hand the same
    /// availability item to several lanes of one collective).
    deps: Vec<Vec<WorkId>>,
    notify: Vec<Vec<WorkId>>,
    deps_remaining: Vec<usize>,
    /// Dependents still to complete before item's output tensor is freed.
    consumers_remaining: Vec<usize>,

    compute_queue: Vec<BTreeSet<WorkId>>,
    compute_running: Vec<Option<WorkId>>,
    comm_busy: Vec<bool>,
    ready_collectives: BTreeSet<WorkId>,

    events: BinaryHeap<Event>,
    expected_version: Vec<u64>,
    flows: BTreeMap<WorkId, Flow>,
    link_users: Vec<usize>,
    link_capacity: Vec<f64>,

    start_s: Vec<f64>,
    now_s: f64,
    last_link_account_s: f64,
    max_end_s: f64,
    completed: usize,

    compute_busy_s: Vec<f64>,
    link_busy_s: Vec<f64>,
    gemm_time_s: f64,
    lookup_time_s: f64,
    comm_time: CommTotals,
    memory: MemoryTracker,
    contention_unresolved: bool,
}

impl<'a> Scheduler<'a> {
    /// Create a scheduler over read-only run inputs.
    #[must_use]
    pub fn new(topo: &'a Topology, model: &'a CollectiveModel, tracker: &'a Tracker) -> Self {
        Self {
            topo,
            model,
            tracker,
        }
    }

    /// Simulate one step of the mapped workload.
    pub fn run(&self, mapped: &MappedWorkload) -> SimResult<StepOutcome> {
        let n = mapped.items.len();
        let device_count = self.topo.device_count();

        let mut deps: Vec<Vec<WorkId>> = Vec::with_capacity(n);
        for item in &mapped.items {
            let mut wait = item.wait_for.clone();
            wait.sort_unstable();
            wait.dedup();
            deps.push(wait);
        }
        let mut notify = vec![Vec::new(); n];
        for (id, wait) in deps.iter().enumerate() {
            for &dep in wait {
                notify[dep].push(id);
            }
        }
        let deps_remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
        let consumers_remaining: Vec<usize> = notify.iter().map(Vec::len).collect();

        let mut capacity = Vec::with_capacity(device_count);
        for device in 0..device_count {
            capacity.push(self.topo.mem_capacity(device)?);
        }

        let mut state = RunState {
            items: &mapped.items,
            deps,
            notify,
            deps_remaining,
            consumers_remaining,
            compute_queue: vec![BTreeSet::new(); device_count],
            compute_running: vec![None; device_count],
            comm_busy: vec![false; device_count],
            ready_collectives: BTreeSet::new(),
            events: BinaryHeap::new(),
            expected_version: vec![0; n],
            flows: BTreeMap::new(),
            link_users: vec![0; self.topo.link_count()],
            link_capacity: (0..self.topo.link_count())
                .map(|index| self.topo.bandwidth(LinkId(index)))
                .collect(),
            start_s: vec![0.0; n],
            now_s: 0.0,
            last_link_account_s: 0.0,
            max_end_s: 0.0,
            completed: 0,
            compute_busy_s: vec![0.0; device_count],
            link_busy_s: vec![0.0; self.topo.link_count()],
            gemm_time_s: 0.0,
            lookup_time_s: 0.0,
            comm_time: CommTotals::default(),
            memory: MemoryTracker::new(&mapped.param_bytes_per_device, capacity),
            contention_unresolved: false,
        };

        for id in 0..n {
            if state.deps_remaining[id] == 0 {
                state.enqueue(id);
            }
        }
        self.dispatch(&mut state)?;

        while let Some(event) = state.events.pop() {
            if event.version != state.expected_version[event.item] {
                continue;
            }
            state.advance_time(event.time_s);
            self.complete(&mut state, event.item);
            self.dispatch(&mut state)?;
        }

        debug_assert_eq!(
            state.completed, n,
            "scheduler stalled with incomplete work items"
        );

        let mut conditions = Vec::new();
        if state.contention_unresolved {
            conditions.push(Condition::ContentionUnresolved);
        }
        let memory = state.memory.finish();
        for &device in &memory.overflowed {
            conditions.push(Condition::MemoryOverflow { device });
        }

        Ok(StepOutcome {
            step_time_s: state.max_end_s,
            compute_busy_s: state.compute_busy_s,
            link_busy_s: state.link_busy_s,
            gemm_time_s: state.gemm_time_s,
            lookup_time_s: state.lookup_time_s,
            comm_time: state.comm_time,
            memory,
            conditions,
        })
    }

    /// Start every item whose dependencies are met and whose lanes are
    /// free. Starting an item only ever occupies lanes, so one pass
    /// suffices per event.
    fn dispatch(&self, state: &mut RunState) -> SimResult {
        for device in 0..state.compute_queue.len() {
            if state.compute_running[device].is_none() {
                if let Some(&id) = state.compute_queue[device].first() {
                    state.compute_queue[device].remove(&id);
                    self.start_compute(state, id, device)?;
                }
            }
        }

        let candidates: Vec<WorkId> = state.ready_collectives.iter().copied().collect();
        for id in candidates {
            let WorkKind::Collective {
                ref participants, ..
            } = state.items[id].kind
            else {
                unreachable!("ready_collectives only holds collectives");
            };
            if participants.iter().all(|&d| !state.comm_busy[d]) {
                state.ready_collectives.remove(&id);
                self.start_collective(state, id)?;
            }
        }
        Ok(())
    }

    fn start_compute(&self, state: &mut RunState, id: WorkId, device: usize) -> SimResult {
        let WorkKind::Compute {
            flops,
            moved_bytes,
            precision,
            ..
        } = state.items[id].kind
        else {
            unreachable!("compute queues only hold compute items");
        };

        // Roofline: the slower of the FLOP-bound and bandwidth-bound times.
        let compute_s = flops / self.topo.eff_compute(device, precision)?;
        let memory_s = moved_bytes as f64 / self.topo.eff_mem_bw(device)?;
        let duration_s = compute_s.max(memory_s);

        state.start_s[id] = state.now_s;
        state.compute_running[device] = Some(id);
        state.events.push(Event {
            time_s: state.now_s + duration_s,
            item: id,
            version: 0,
        });
        Ok(())
    }

    fn start_collective(&self, state: &mut RunState, id: WorkId) -> SimResult {
        let WorkKind::Collective {
            collective,
            ref participants,
            payload_bytes,
            ..
        } = state.items[id].kind
        else {
            unreachable!();
        };

        let cost = self
            .model
            .cost(collective, payload_bytes, participants, self.topo)?;
        state.start_s[id] = state.now_s;
        for &device in participants {
            state.comm_busy[device] = true;
        }

        if cost.links.is_empty() {
            // Degenerate group: nothing on the wire.
            state.events.push(Event {
                time_s: state.now_s + cost.duration_s,
                item: id,
                version: 0,
            });
            return Ok(());
        }

        for &link in &cost.links {
            state.link_users[link.0] += 1;
        }
        state.flows.insert(
            id,
            Flow {
                links: cost.links,
                demand: cost.bandwidth,
                remaining_s: cost.duration_s,
                rate: 1.0,
                last_update_s: state.now_s,
            },
        );
        state.reshare_flows();
        Ok(())
    }

    fn complete(&self, state: &mut RunState, id: WorkId) {
        let now = state.now_s;
        state.max_end_s = state.max_end_s.max(now);
        state.completed += 1;
        let duration = now - state.start_s[id];

        match state.items[id].kind {
            WorkKind::Compute {
                device,
                flops,
                moved_bytes,
                output_bytes,
                ..
            } => {
                state.compute_running[device] = None;
                state.compute_busy_s[device] += duration;
                if flops > 0.0 {
                    state.gemm_time_s += duration;
                } else {
                    state.lookup_time_s += duration;
                }
                state.memory.alloc(device, output_bytes);
                self.tracker.span(&Span {
                    name: state.items[id].name.clone(),
                    device,
                    lane: LaneKind::Compute,
                    start_s: state.start_s[id],
                    end_s: now,
                    bytes: moved_bytes,
                });
            }
            WorkKind::Collective {
                collective,
                ref participants,
                payload_bytes,
                output_bytes,
            } => {
                for &device in participants {
                    state.comm_busy[device] = false;
                }
                if let Some(flow) = state.flows.remove(&id) {
                    for link in flow.links {
                        state.link_users[link.0] -= 1;
                    }
                    state.reshare_flows();
                }
                state.comm_time.add(collective, duration);
                match collective {
                    CollectiveKind::SendRecv => {
                        let dst = *participants.last().expect("sendrecv has two participants");
                        state.memory.alloc(dst, output_bytes);
                    }
                    _ => {
                        for &device in participants {
                            state.memory.alloc(device, output_bytes);
                        }
                    }
                }
                for &device in participants {
                    self.tracker.span(&Span {
                        name: state.items[id].name.clone(),
                        device,
                        lane: LaneKind::Comm,
                        start_s: state.start_s[id],
                        end_s: now,
                        bytes: payload_bytes,
                    });
                }
            }
        }

        // Release input tensors whose last consumer just completed.
        for dep_index in 0..state.deps[id].len() {
            let dep = state.deps[id][dep_index];
            state.consumers_remaining[dep] -= 1;
            if state.consumers_remaining[dep] == 0 {
                state.release_tensor(dep);
            }
        }

        for notify_index in 0..state.notify[id].len() {
            let dependent = state.notify[id][notify_index];
            state.deps_remaining[dependent] -= 1;
            if state.deps_remaining[dependent] == 0 {
                state.enqueue(dependent);
            }
        }
    }
}

impl RunState<'_> {
    fn enqueue(&mut self, id: WorkId) {
        match self.items[id].kind {
            WorkKind::Compute { device, .. } => {
                self.compute_queue[device].insert(id);
            }
            WorkKind::Collective { .. } => {
                self.ready_collectives.insert(id);
            }
        }
    }

    /// Accumulate link busy time up to `time_s` and advance the clock.
    fn advance_time(&mut self, time_s: f64) {
        let delta = time_s - self.last_link_account_s;
        if delta > 0.0 {
            for (index, &users) in self.link_users.iter().enumerate() {
                if users > 0 {
                    self.link_busy_s[index] += delta;
                }
            }
            self.last_link_account_s = time_s;
        }
        self.now_s = time_s;
    }

    /// Drop the memory charged for item `id`'s output tensor.
    fn release_tensor(&mut self, id: WorkId) {
        match self.items[id].kind {
            WorkKind::Compute {
                device,
                output_bytes,
                ..
            } => self.memory.free(device, output_bytes),
            WorkKind::Collective {
                collective,
                ref participants,
                output_bytes,
                ..
            } => match collective {
                CollectiveKind::SendRecv => {
                    let dst = *participants.last().expect("sendrecv has two participants");
                    self.memory.free(dst, output_bytes);
                }
                _ => {
                    for &device in participants {
                        self.memory.free(device, output_bytes);
                    }
                }
            },
        }
    }

    /// Re-derive every in-flight flow's bandwidth share and completion
    /// event after the active-transfer set changed.
    fn reshare_flows(&mut self) {
        let now = self.now_s;
        for flow in self.flows.values_mut() {
            flow.remaining_s = (flow.remaining_s - flow.rate * (now - flow.last_update_s)).max(0.0);
            flow.last_update_s = now;
        }
        if self.flows.is_empty() {
            return;
        }

        let shares = self.max_min_shares();
        for (&id, flow) in &mut self.flows {
            flow.rate = (shares[&id] / flow.demand).min(1.0).max(MIN_RATE);
            self.expected_version[id] += 1;
            self.events.push(Event {
                time_s: now + flow.remaining_s / flow.rate,
                item: id,
                version: self.expected_version[id],
            });
        }
    }

    /// Progressive-fill max-min fair bandwidth allocation in bytes/s.
    ///
    /// Each pass freezes either every demand-satisfied flow or the flows of
    /// the current bottleneck link, so the loop terminates in at most one
    /// pass per flow; the explicit bound guards pathological fill counts
    /// and downgrades them to a reported condition.
    fn max_min_shares(&mut self) -> BTreeMap<WorkId, f64> {
        let mut remaining_cap = self.link_capacity.clone();
        let mut unfrozen_count: Vec<usize> = vec![0; self.link_users.len()];
        for flow in self.flows.values() {
            for link in &flow.links {
                unfrozen_count[link.0] += 1;
            }
        }

        let mut unfrozen: BTreeSet<WorkId> = self.flows.keys().copied().collect();
        let mut shares: BTreeMap<WorkId, f64> = BTreeMap::new();
        let mut passes = 0;

        while !unfrozen.is_empty() {
            passes += 1;
            if passes > MAX_FILL_PASSES {
                self.contention_unresolved = true;
                for &id in &unfrozen {
                    shares.insert(id, self.candidate_share(id, &remaining_cap, &unfrozen_count));
                }
                break;
            }

            let bottleneck = unfrozen
                .iter()
                .map(|&id| self.candidate_share(id, &remaining_cap, &unfrozen_count))
                .fold(f64::INFINITY, f64::min);

            // Demand-limited flows freeze first; they leave bandwidth on
            // the table for everyone else.
            let satisfied: Vec<WorkId> = unfrozen
                .iter()
                .copied()
                .filter(|&id| self.flows[&id].demand <= bottleneck)
                .collect();

            let to_freeze: Vec<(WorkId, f64)> = if satisfied.is_empty() {
                unfrozen
                    .iter()
                    .copied()
                    .filter(|&id| {
                        self.candidate_share(id, &remaining_cap, &unfrozen_count) <= bottleneck
                    })
                    .map(|id| (id, bottleneck))
                    .collect()
            } else {
                satisfied
                    .into_iter()
                    .map(|id| (id, self.flows[&id].demand))
                    .collect()
            };

            for (id, share) in to_freeze {
                unfrozen.remove(&id);
                shares.insert(id, share);
                for link in &self.flows[&id].links {
                    remaining_cap[link.0] = (remaining_cap[link.0] - share).max(0.0);
                    unfrozen_count[link.0] -= 1;
                }
            }
        }
        shares
    }

    fn candidate_share(
        &self,
        id: WorkId,
        remaining_cap: &[f64],
        unfrozen_count: &[usize],
    ) -> f64 {
        self.flows[&id]
            .links
            .iter()
            .map(|link| remaining_cap[link.0] / unfrozen_count[link.0].max(1) as f64)
            .fold(f64::INFINITY, f64::min)
    }
}
