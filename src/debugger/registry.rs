use crate::debugger::breakpoint::{BreakpointId, Location};
use crate::debugger::patch::ProbeSet;
use crate::debugger::resolver::FunctionHandle;
use crate::runtime::{Code, Function, FunctionId};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum_macros::Display;

/// Breakpoints (with their conditions) that fire at a location.
pub type HitTargets = SmallVec<[(BreakpointId, Option<String>); 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PatchState {
    Unpatched,
    Patched,
}

/// Breakpoints installed at a single location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationEntry {
    /// Function containing the patched location.
    pub function: FunctionId,
    /// Breakpoint ids and their condition expressions.
    pub breakpoints: BTreeMap<BreakpointId, Option<String>>,
}

/// Instrumentation state of a single function.
pub struct FunctionRecord {
    unit: Arc<Function>,
    qualname: String,
    module: PathBuf,
    snapshot: Arc<Code>,
    state: PatchState,
    locations: BTreeSet<Location>,
    nested: BTreeSet<FunctionId>,
}

impl FunctionRecord {
    /// Create record for a function that is not patched yet.
    ///
    /// # Arguments
    ///
    /// * `handle`: resolved function
    /// * `snapshot`: original function code
    /// * `nested`: functions defined directly inside this one
    pub fn new(handle: &FunctionHandle, snapshot: Arc<Code>, nested: BTreeSet<FunctionId>) -> Self {
        Self {
            unit: handle.unit.clone(),
            qualname: handle.qualname.clone(),
            module: handle.module.clone(),
            snapshot,
            state: PatchState::Unpatched,
            locations: BTreeSet::new(),
            nested,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.unit.id()
    }

    pub fn unit(&self) -> &Arc<Function> {
        &self.unit
    }

    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    pub fn module(&self) -> &Path {
        &self.module
    }

    /// Original function code, captured before the first patch.
    pub fn snapshot(&self) -> &Arc<Code> {
        &self.snapshot
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn locations(&self) -> &BTreeSet<Location> {
        &self.locations
    }

    /// Patched lines and exit probes.
    pub fn probes(&self) -> ProbeSet {
        self.locations.iter().collect()
    }

    pub fn nested(&self) -> &BTreeSet<FunctionId> {
        &self.nested
    }
}

/// Installed breakpoints: location to breakpoint ids, function identity to its record.
#[derive(Default)]
pub struct BreakpointRegistry {
    locations: HashMap<Location, LocationEntry>,
    functions: BTreeMap<FunctionId, FunctionRecord>,
}

impl BreakpointRegistry {
    /// Return breakpoints that fire at a location.
    pub fn hit_targets(&self, location: &Location) -> HitTargets {
        self.locations
            .get(location)
            .map(|entry| {
                entry
                    .breakpoints
                    .iter()
                    .map(|(id, cond)| (id.clone(), cond.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn location(&self, location: &Location) -> Option<&LocationEntry> {
        self.locations.get(location)
    }

    pub fn locations(&self) -> impl Iterator<Item = (&Location, &LocationEntry)> {
        self.locations.iter()
    }

    pub fn function(&self, id: FunctionId) -> Option<&FunctionRecord> {
        self.functions.get(&id)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.functions.values()
    }

    /// Return functions defined directly inside a function that are patched themselves.
    pub fn patched_nested(&self, function: FunctionId) -> Vec<FunctionId> {
        self.functions
            .get(&function)
            .map(|record| {
                record
                    .nested
                    .iter()
                    .filter(|id| self.functions.contains_key(id))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty() && self.functions.is_empty()
    }

    /// Insert function record if function is not known yet.
    pub(crate) fn ensure_function(&mut self, record: FunctionRecord) {
        self.functions.entry(record.id()).or_insert(record);
    }

    /// Record a patched location. Function record must exist.
    pub(crate) fn add_location(
        &mut self,
        location: Location,
        function: FunctionId,
        breakpoints: BTreeMap<BreakpointId, Option<String>>,
    ) {
        let Some(record) = self.functions.get_mut(&function) else {
            return;
        };
        record.locations.insert(location.clone());
        record.state = PatchState::Patched;
        self.locations.insert(
            location,
            LocationEntry {
                function,
                breakpoints,
            },
        );
    }

    /// Replace breakpoint set of an already patched location.
    /// Return true if the set changed.
    pub(crate) fn set_breakpoints(
        &mut self,
        location: &Location,
        breakpoints: BTreeMap<BreakpointId, Option<String>>,
    ) -> bool {
        match self.locations.get_mut(location) {
            Some(entry) if entry.breakpoints != breakpoints => {
                entry.breakpoints = breakpoints;
                true
            }
            _ => false,
        }
    }

    /// Remove a location patched in a function. The location entry is kept if it was already
    /// taken over by another function. A function record left without locations is forgotten.
    pub(crate) fn remove_location(
        &mut self,
        location: &Location,
        function: FunctionId,
    ) -> Option<LocationEntry> {
        let entry = match self.locations.get(location) {
            Some(entry) if entry.function == function => self.locations.remove(location),
            _ => None,
        };
        if let Some(record) = self.functions.get_mut(&function) {
            record.locations.remove(location);
            if record.locations.is_empty() {
                record.state = PatchState::Unpatched;
                self.functions.remove(&function);
            }
        }
        entry
    }

    /// Forget everything, return all function records.
    pub(crate) fn drain(&mut self) -> Vec<FunctionRecord> {
        self.locations.clear();
        std::mem::take(&mut self.functions).into_values().collect()
    }
}
