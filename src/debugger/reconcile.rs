//! Converge installed patches to the desired breakpoint set.

use crate::config::RetryConfig;
use crate::debugger::breakpoint::{Breakpoint, BreakpointId, Location, ProbeKind};
use crate::debugger::error::ErrorKind;
use crate::debugger::patch::{PatchEngine, PatchableUnit, ProbeSet};
use crate::debugger::registry::{BreakpointRegistry, FunctionRecord};
use crate::debugger::resolver::{FunctionHandle, SourceResolver};
use crate::debugger::{BreakpointSource, Error};
use crate::runtime::{Code, Function, FunctionId};
use crate::{lb_debug, lb_error, lb_warn, weak_error};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type Breakpoints = BTreeMap<BreakpointId, Option<String>>;

/// Breakpoint location that failed to install on a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub location: Location,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of a reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    /// Newly patched locations.
    pub added: Vec<Location>,
    /// Locations whose patches were removed.
    pub removed: Vec<Location>,
    /// Already patched locations with a changed breakpoint set.
    pub updated: Vec<Location>,
    /// Locations skipped due to backoff after previous failures.
    pub deferred: Vec<Location>,
    pub failures: Vec<Failure>,
}

impl TickReport {
    /// Return true if the tick changed no code.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl Display for TickReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tick {}: {} added, {} removed, {} updated, {} deferred, {} failed",
            self.tick,
            self.added.len(),
            self.removed.len(),
            self.updated.len(),
            self.deferred.len(),
            self.failures.len()
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    attempts: u32,
    retry_at: u64,
}

#[derive(Default)]
struct TickState {
    tick: u64,
    backoff: HashMap<Location, Backoff>,
}

/// Per function work of a single tick.
struct Plan {
    unit: Arc<Function>,
    snapshot: Arc<Code>,
    /// Record to register if the function is patched for the first time.
    record: Option<FunctionRecord>,
    probes: ProbeSet,
    add: Vec<(Location, Breakpoints)>,
    remove: Vec<Location>,
}

enum Outcome {
    Install(Arc<Code>),
    Restore,
}

pub struct Reconciler {
    resolver: Arc<dyn SourceResolver>,
    engine: PatchEngine,
    registry: Arc<RwLock<BreakpointRegistry>>,
    retry: RetryConfig,
    /// Serializes ticks.
    state: Mutex<TickState>,
}

impl Reconciler {
    pub fn new(
        resolver: Arc<dyn SourceResolver>,
        engine: PatchEngine,
        registry: Arc<RwLock<BreakpointRegistry>>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            resolver,
            engine,
            registry,
            retry,
            state: Mutex::default(),
        }
    }

    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    /// Fetch the desired set and reconcile against it.
    /// A failed fetch leaves installed patches untouched.
    pub fn tick(&self, source: &dyn BreakpointSource) -> Result<TickReport, Error> {
        let desired = source.fetch().map_err(Error::Fetch)?;
        Ok(self.apply(&desired))
    }

    /// Reconcile installed patches against the desired breakpoint set.
    pub fn apply(&self, desired: &[Breakpoint]) -> TickReport {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tick += 1;
        let tick = state.tick;
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        let wanted = self.desired_locations(desired, &mut report);
        let (current, stale) = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let current: BTreeMap<Location, (FunctionId, Breakpoints)> = registry
                .locations()
                .map(|(loc, entry)| (loc.clone(), (entry.function, entry.breakpoints.clone())))
                .collect();
            // functions replaced by a module reload
            let stale: BTreeSet<FunctionId> = registry
                .functions()
                .filter(|record| !self.resolver.is_live(record.module(), record.unit()))
                .map(FunctionRecord::id)
                .collect();
            (current, stale)
        };

        state
            .backoff
            .retain(|loc, _| wanted.contains_key(loc) && !current.contains_key(loc));

        let mut plans: BTreeMap<FunctionId, Plan> = BTreeMap::new();
        let mut updates = vec![];

        for (location, (function, _)) in &current {
            if wanted.contains_key(location) && !stale.contains(function) {
                continue;
            }
            match self.plan_for_record(&mut plans, *function) {
                Some(plan) => plan.remove.push(location.clone()),
                None => lb_error!("location {location} patched in unknown function {function}"),
            }
        }

        for (location, breakpoints) in wanted {
            if let Some((_, installed)) = current
                .get(&location)
                .filter(|(function, _)| !stale.contains(function))
            {
                if installed != &breakpoints {
                    updates.push((location, breakpoints));
                }
                continue;
            }

            if let Some(backoff) = state.backoff.get(&location) {
                if tick < backoff.retry_at {
                    report.deferred.push(location);
                    continue;
                }
            }

            match self.plan_for_location(&mut plans, &location) {
                Ok(plan) => plan.add.push((location, breakpoints)),
                Err(err) => self.fail(&mut state, &mut report, location, &err),
            }
        }

        let built: Vec<(Plan, Outcome)> = plans
            .into_values()
            .map(|plan| {
                let outcome = self.build(&mut state, &mut report, &plan);
                (plan, outcome)
            })
            .collect();

        if !built.is_empty() || !updates.is_empty() {
            let mut registry = self
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for (plan, outcome) in built {
                self.commit(&mut registry, plan, outcome, &mut state, &mut report);
            }
            for (location, breakpoints) in updates {
                if registry.set_breakpoints(&location, breakpoints) {
                    report.updated.push(location);
                }
            }
        }

        lb_debug!("{report}");
        report
    }

    /// Restore original code of every patched function and forget all breakpoints.
    /// Return number of restored functions.
    pub fn restore_all(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.backoff.clear();

        let records = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        for record in &records {
            record.unit().restore(record.snapshot());
        }
        records.len()
    }

    /// Group desired breakpoints by canonical location.
    fn desired_locations(
        &self,
        desired: &[Breakpoint],
        report: &mut TickReport,
    ) -> BTreeMap<Location, Breakpoints> {
        let mut wanted: BTreeMap<Location, Breakpoints> = BTreeMap::new();
        for bp in desired {
            match self.resolver.canonicalize(bp.file()) {
                Ok(file) => {
                    wanted
                        .entry(Location::with_kind(file, bp.lineno, bp.probe))
                        .or_default()
                        .insert(bp.uuid.clone(), bp.conditional_expr.clone());
                }
                Err(err) => {
                    let location = bp.requested_location();
                    if report.failures.iter().all(|f| f.location != location) {
                        lb_debug!("breakpoint {} unresolved: {err}", bp.uuid);
                        report.failures.push(Failure {
                            location,
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
        wanted
    }

    fn plan_for_record<'a>(
        &self,
        plans: &'a mut BTreeMap<FunctionId, Plan>,
        function: FunctionId,
    ) -> Option<&'a mut Plan> {
        if !plans.contains_key(&function) {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let record = registry.function(function)?;
            plans.insert(
                function,
                Plan {
                    unit: record.unit().clone(),
                    snapshot: record.snapshot().clone(),
                    record: None,
                    probes: record.probes(),
                    add: vec![],
                    remove: vec![],
                },
            );
        }
        plans.get_mut(&function)
    }

    /// Resolve location and return plan of the function containing it.
    fn plan_for_location<'a>(
        &self,
        plans: &'a mut BTreeMap<FunctionId, Plan>,
        location: &Location,
    ) -> Result<&'a mut Plan, Error> {
        let handle = self.resolver.resolve(&location.file, location.line)?;
        let id = handle.id();

        if self.plan_for_record(plans, id).is_none() {
            let snapshot = handle.unit.snapshot();
            if self.engine.is_instrumented(&snapshot) {
                return Err(Error::UnsafeRewrite(
                    handle.qualname.clone(),
                    "function instrumented outside of the registry",
                ));
            }
            plans.insert(
                id,
                Plan {
                    unit: handle.unit.clone(),
                    snapshot: snapshot.clone(),
                    record: Some(self.new_record(&handle, snapshot)),
                    probes: ProbeSet::default(),
                    add: vec![],
                    remove: vec![],
                },
            );
        }

        let plan = plans
            .get_mut(&id)
            .ok_or_else(|| Error::FunctionNotLoaded(handle.module.clone(), handle.qualname))?;
        if location.kind == ProbeKind::Line {
            PatchEngine::insertion_point(&plan.snapshot, location.line)?;
        }
        Ok(plan)
    }

    fn new_record(&self, handle: &FunctionHandle, snapshot: Arc<Code>) -> FunctionRecord {
        let nested = weak_error!(
            self.resolver.enumerate_nested(handle),
            "enumerate nested functions:"
        )
        .unwrap_or_default()
        .iter()
        .map(FunctionHandle::id)
        .collect();
        FunctionRecord::new(handle, snapshot, nested)
    }

    /// Build new function code off-registry. Additions that cannot be applied are
    /// dropped from the plan and reported.
    fn build(&self, state: &mut TickState, report: &mut TickReport, plan: &Plan) -> Outcome {
        let mut kept = plan.probes.clone();
        plan.remove.iter().for_each(|loc| kept.remove(loc));
        let mut probes = kept.clone();
        plan.add.iter().for_each(|(loc, _)| probes.insert(loc));

        if probes.is_empty() {
            return Outcome::Restore;
        }
        match self.engine.build(&plan.snapshot, &probes) {
            Ok(code) => return Outcome::Install(Arc::new(code)),
            Err(err) => {
                for (location, _) in &plan.add {
                    self.fail(state, report, location.clone(), &err);
                }
            }
        }

        if kept.is_empty() {
            return Outcome::Restore;
        }
        match self.engine.build(&plan.snapshot, &kept) {
            Ok(code) => Outcome::Install(Arc::new(code)),
            Err(err) => {
                lb_error!("rewrite of `{}` failed: {err}", plan.snapshot.qualname);
                Outcome::Restore
            }
        }
    }

    /// Install built code and record the result.
    fn commit(
        &self,
        registry: &mut BreakpointRegistry,
        plan: Plan,
        outcome: Outcome,
        state: &mut TickState,
        report: &mut TickReport,
    ) {
        let id = plan.unit.id();
        match outcome {
            Outcome::Install(code) => {
                let installed = self.engine.probes(&code);
                plan.unit.install(code);
                if let Some(record) = plan.record {
                    registry.ensure_function(record);
                }
                for (location, breakpoints) in plan.add {
                    if installed.contains(&location) {
                        state.backoff.remove(&location);
                        registry.add_location(location.clone(), id, breakpoints);
                        report.added.push(location);
                    }
                }
                for location in plan.remove {
                    registry.remove_location(&location, id);
                    report.removed.push(location);
                }
            }
            Outcome::Restore => {
                let nested = registry.patched_nested(id);
                if !nested.is_empty() {
                    lb_debug!(
                        "`{}` restored, {} nested functions stay patched",
                        plan.snapshot.qualname,
                        nested.len()
                    );
                }
                plan.unit.restore(&plan.snapshot);
                for location in plan.remove {
                    registry.remove_location(&location, id);
                    report.removed.push(location);
                }
                // locations patched before but not touched by this tick
                let leftover: Vec<Location> = registry
                    .function(id)
                    .map(|record| record.locations().iter().cloned().collect())
                    .unwrap_or_default();
                for location in leftover {
                    registry.remove_location(&location, id);
                    report.removed.push(location);
                }
            }
        }
    }

    fn fail(&self, state: &mut TickState, report: &mut TickReport, location: Location, err: &Error) {
        let kind = err.kind();
        let backoff = state.backoff.entry(location.clone()).or_insert(Backoff {
            attempts: 0,
            retry_at: 0,
        });
        backoff.attempts += 1;
        let delay = match kind {
            ErrorKind::LocationNotFound => 1,
            ErrorKind::AmbiguousLocation => self.retry.max_ticks.max(1),
            _ => {
                let factor = 1u32
                    .checked_shl(backoff.attempts - 1)
                    .unwrap_or(u32::MAX);
                self.retry
                    .base_ticks
                    .max(1)
                    .saturating_mul(factor)
                    .min(self.retry.max_ticks.max(1))
            }
        };
        backoff.retry_at = state.tick + delay as u64;

        match kind {
            ErrorKind::AmbiguousLocation => lb_error!("breakpoint at {location} rejected: {err}"),
            ErrorKind::LocationNotFound => lb_debug!("breakpoint at {location} unresolved: {err}"),
            _ => lb_warn!(
                "breakpoint at {location} not installed, retry in {delay} ticks: {err}"
            ),
        }
        report.failures.push(Failure {
            location,
            kind,
            message: err.to_string(),
        });
    }
}
