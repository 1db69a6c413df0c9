//! Function code rewriting.
//!
//! A patched code is built from the original code of a function (snapshot): before the first
//! instruction of every patched line a handler call sequence is inserted:
//!
//! ```text
//! LoadConst(handler)
//! LoadConst(file)
//! LoadConst(line)
//! Call(2)
//! PopTop
//! ```
//!
//! Exit probes insert a longer sequence before every `Return`, passing a copy of the
//! returned value and a `raised` flag:
//!
//! ```text
//! LoadConst(handler)
//! LoadConst(file)
//! LoadConst(line)
//! Copy(3)
//! LoadConst(false)
//! Call(4)
//! PopTop
//! ```
//!
//! An exception leaving the function is routed by an exception table entry covering the whole
//! original code to an epilogue: the same sequence with `raised = true` for every exit probe,
//! followed by `Reraise`, which propagates the original exception untouched.
//!
//! Every sequence has zero net stack effect. Every jump target and exception table boundary
//! `t` of the original code is moved by the total length of sequences inserted at points
//! strictly lower than `t`. So a jump to the first instruction of a patched line (or to
//! a `Return`) lands on the inserted sequence.
//!
//! Original code is never modified. Patched code is always built from the snapshot with
//! the whole set of probes, removing a breakpoint means building a new code
//! (or reinstalling the snapshot when no probes left).

use crate::debugger::breakpoint::{Location, ProbeKind};
use crate::debugger::Error;
use crate::runtime::{Code, ExceptionEntry, Function, FunctionId, Instruction, NativeFunction, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Number of instructions in the line handler call sequence.
pub const PATCH_LEN: usize = 5;
/// Stack slots used by the line handler call sequence.
pub const PATCH_STACK_DEPTH: u32 = 3;
/// Number of instructions in the exit handler call sequence.
pub const EXIT_PATCH_LEN: usize = 7;
/// Stack slots used by the exit handler call sequence.
pub const EXIT_PATCH_STACK_DEPTH: u32 = 5;

/// Unit of code that can be instrumented. Code switching is atomic:
/// a new invocation observes either the previous or the new code.
pub trait PatchableUnit: Send + Sync {
    fn unit_id(&self) -> FunctionId;

    /// Return currently installed code.
    fn snapshot(&self) -> Arc<Code>;

    /// Install new code for subsequent invocations.
    fn install(&self, code: Arc<Code>);

    /// Reinstall a previously taken snapshot.
    fn restore(&self, snapshot: &Arc<Code>) {
        self.install(snapshot.clone())
    }

    /// Return true if the snapshot is the currently installed code.
    fn is_installed(&self, snapshot: &Arc<Code>) -> bool {
        Arc::ptr_eq(&self.snapshot(), snapshot)
    }
}

impl PatchableUnit for Function {
    fn unit_id(&self) -> FunctionId {
        self.id()
    }

    fn snapshot(&self) -> Arc<Code> {
        self.code()
    }

    fn install(&self, code: Arc<Code>) {
        self.replace_code(code);
    }
}

/// Probes of a single function: patched lines and exit probe lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSet {
    pub lines: BTreeSet<u32>,
    pub exits: BTreeSet<u32>,
}

impl ProbeSet {
    pub fn lines(lines: impl IntoIterator<Item = u32>) -> Self {
        Self {
            lines: lines.into_iter().collect(),
            exits: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.exits.is_empty()
    }

    fn of_kind(&mut self, kind: ProbeKind) -> &mut BTreeSet<u32> {
        match kind {
            ProbeKind::Line => &mut self.lines,
            ProbeKind::Exit => &mut self.exits,
        }
    }

    pub fn insert(&mut self, location: &Location) {
        self.of_kind(location.kind).insert(location.line);
    }

    pub fn remove(&mut self, location: &Location) {
        self.of_kind(location.kind).remove(&location.line);
    }

    pub fn contains(&self, location: &Location) -> bool {
        match location.kind {
            ProbeKind::Line => self.lines.contains(&location.line),
            ProbeKind::Exit => self.exits.contains(&location.line),
        }
    }
}

impl<'a> FromIterator<&'a Location> for ProbeSet {
    fn from_iter<T: IntoIterator<Item = &'a Location>>(iter: T) -> Self {
        let mut set = ProbeSet::default();
        iter.into_iter().for_each(|location| set.insert(location));
        set
    }
}

/// Handler call inserted before an instruction of the original code.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Insertion {
    point: usize,
    kind: ProbeKind,
    line: u32,
}

impl Insertion {
    fn len(&self) -> usize {
        match self.kind {
            ProbeKind::Line => PATCH_LEN,
            ProbeKind::Exit => EXIT_PATCH_LEN,
        }
    }
}

/// Builds instrumented code.
pub struct PatchEngine {
    handler: Value,
}

impl PatchEngine {
    pub fn new(handler: Arc<dyn NativeFunction>) -> Self {
        Self {
            handler: Value::Native(handler),
        }
    }

    /// Handler value that instrumented code calls.
    pub fn handler(&self) -> &Value {
        &self.handler
    }

    /// Return index of the instruction before which the handler call for a line
    /// will be inserted.
    ///
    /// # Errors
    ///
    /// [`Error::NoInstructionAtLine`] if no instruction mapped to the line
    /// (blank line, comment, `else:`).
    pub fn insertion_point(code: &Code, line: u32) -> Result<usize, Error> {
        code.first_instruction_at(line)
            .ok_or_else(|| Error::NoInstructionAtLine(code.qualname.to_string(), line))
    }

    /// Return true if code calls the handler of this engine.
    pub fn is_instrumented(&self, code: &Code) -> bool {
        code.consts.iter().any(|c| c == &self.handler)
    }

    /// Return lines instrumented in code, in ascending order.
    pub fn insertions(&self, code: &Code) -> Vec<u32> {
        self.probes(code).lines.into_iter().collect()
    }

    /// Return exit probe lines of instrumented code, in ascending order.
    pub fn exits(&self, code: &Code) -> Vec<u32> {
        self.probes(code).exits.into_iter().collect()
    }

    /// Return probes found in code by scanning for handler call sequences.
    pub fn probes(&self, code: &Code) -> ProbeSet {
        let instructions = &code.instructions;
        let const_at = |idx: u32| code.consts.get(idx as usize);
        let probe_line = |h: u32, l: u32| -> Option<u32> {
            if const_at(h) != Some(&self.handler) {
                return None;
            }
            const_at(l).and_then(Value::as_int).map(|line| line as u32)
        };

        let mut probes = ProbeSet::default();
        let mut i = 0;
        while i < instructions.len() {
            let rest = &instructions[i..];
            if let [Instruction::LoadConst(h), Instruction::LoadConst(_), Instruction::LoadConst(l), Instruction::Call(2), Instruction::PopTop, ..] = rest {
                if let Some(line) = probe_line(*h, *l) {
                    probes.lines.insert(line);
                    i += PATCH_LEN;
                    continue;
                }
            }
            if let [Instruction::LoadConst(h), Instruction::LoadConst(_), Instruction::LoadConst(l), Instruction::Copy(3), Instruction::LoadConst(_), Instruction::Call(4), Instruction::PopTop, ..] = rest {
                if let Some(line) = probe_line(*h, *l) {
                    probes.exits.insert(line);
                    i += EXIT_PATCH_LEN;
                    continue;
                }
            }
            i += 1;
        }
        probes
    }

    /// Build instrumented code calling the handler before the first instruction of each line
    /// and on each exit of the function.
    ///
    /// # Arguments
    ///
    /// * `snapshot`: original, not instrumented, function code
    /// * `probes`: lines and exit probes to instrument
    ///
    /// # Errors
    ///
    /// [`Error::NoInstructionAtLine`] if some line has no instructions,
    /// [`Error::UnsafeRewrite`] if code is already instrumented or malformed.
    pub fn build(&self, snapshot: &Code, probes: &ProbeSet) -> Result<Code, Error> {
        self.validate(snapshot)?;
        let extra_depth = if probes.exits.is_empty() {
            PATCH_STACK_DEPTH
        } else {
            EXIT_PATCH_STACK_DEPTH
        };
        let mut stack_size = snapshot
            .stack_size
            .checked_add(extra_depth)
            .ok_or_else(|| unsafe_rewrite(snapshot, "stack bound overflow"))?;

        let mut insertions = probes
            .lines
            .iter()
            .map(|line| {
                Ok(Insertion {
                    point: Self::insertion_point(snapshot, *line)?,
                    kind: ProbeKind::Line,
                    line: *line,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let returns = snapshot
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, instr)| **instr == Instruction::Return)
            .map(|(idx, _)| idx);
        for point in returns {
            insertions.extend(probes.exits.iter().map(|line| Insertion {
                point,
                kind: ProbeKind::Exit,
                line: *line,
            }));
        }
        insertions.sort_unstable();

        // inserted length before each insertion, in insertion order
        let mut offsets = Vec::with_capacity(insertions.len() + 1);
        offsets.push(0);
        for insertion in &insertions {
            offsets.push(offsets[offsets.len() - 1] + insertion.len());
        }
        let shift = |target: u32| -> u32 {
            let before = insertions.partition_point(|ins| (ins.point as u32) < target);
            target + offsets[before] as u32
        };

        let mut consts = snapshot.consts.clone();
        let mut add_const = |value: Value| {
            consts.push(value);
            consts.len() as u32 - 1
        };
        let handler_idx = add_const(self.handler.clone());
        let file_idx = add_const(Value::Str(snapshot.filename.clone()));
        let returned_idx = add_const(Value::Bool(false));
        let raised_idx = add_const(Value::Bool(true));
        let mut line_consts = std::collections::BTreeMap::new();
        let mut line_idx = |line: u32| {
            *line_consts
                .entry(line)
                .or_insert_with(|| add_const(Value::Int(line as i64)))
        };

        let epilogue_len = if probes.exits.is_empty() {
            0
        } else {
            EXIT_PATCH_LEN * probes.exits.len() + 1
        };
        let total = snapshot.instructions.len() + offsets[insertions.len()] + epilogue_len;
        let mut instructions = Vec::with_capacity(total);
        let mut line_table = Vec::with_capacity(total);
        let mut next = insertions.iter().peekable();

        let exit_call = |line_const: u32, flag_const: u32| {
            [
                Instruction::LoadConst(handler_idx),
                Instruction::LoadConst(file_idx),
                Instruction::LoadConst(line_const),
                Instruction::Copy(3),
                Instruction::LoadConst(flag_const),
                Instruction::Call(4),
                Instruction::PopTop,
            ]
        };

        for (idx, (instr, line)) in snapshot
            .instructions
            .iter()
            .zip(&snapshot.lines)
            .enumerate()
        {
            while let Some(insertion) = next.next_if(|ins| ins.point == idx) {
                let probe_line = line_idx(insertion.line);
                match insertion.kind {
                    ProbeKind::Line => instructions.extend([
                        Instruction::LoadConst(handler_idx),
                        Instruction::LoadConst(file_idx),
                        Instruction::LoadConst(probe_line),
                        Instruction::Call(2),
                        Instruction::PopTop,
                    ]),
                    ProbeKind::Exit => instructions.extend(exit_call(probe_line, returned_idx)),
                }
                line_table.extend(std::iter::repeat(*line).take(insertion.len()));
            }

            let instr = match instr.jump_target() {
                Some(target) => instr.with_jump_target(shift(target)),
                None => *instr,
            };
            instructions.push(instr);
            line_table.push(*line);
        }

        let mut exception_table: Vec<ExceptionEntry> = snapshot
            .exception_table
            .iter()
            .map(|entry| {
                let mut entry = *entry;
                entry.start = shift(entry.start);
                entry.end = shift(entry.end);
                entry.target = shift(entry.target);
                entry
            })
            .collect();

        if !probes.exits.is_empty() {
            let body_end = instructions.len() as u32;
            let last_line = snapshot.lines.last().copied().unwrap_or(snapshot.first_line);
            for line in &probes.exits {
                let probe_line = line_idx(*line);
                instructions.extend(exit_call(probe_line, raised_idx));
                line_table.extend([last_line; EXIT_PATCH_LEN]);
            }
            instructions.push(Instruction::Reraise);
            line_table.push(last_line);

            // exception value plus the handler call sequence
            stack_size = stack_size.max(1 + EXIT_PATCH_STACK_DEPTH);
            exception_table.push(ExceptionEntry {
                start: 0,
                end: body_end,
                target: body_end,
                depth: 0,
            });
        }

        Ok(Code {
            instructions,
            lines: line_table,
            consts,
            exception_table,
            stack_size,
            ..snapshot.clone()
        })
    }

    fn validate(&self, code: &Code) -> Result<(), Error> {
        if self.is_instrumented(code) {
            return Err(unsafe_rewrite(code, "code already instrumented"));
        }
        if code.lines.len() != code.instructions.len() {
            return Err(unsafe_rewrite(code, "malformed line table"));
        }

        let len = code.instructions.len() as u32;
        let jumps_valid = code
            .instructions
            .iter()
            .filter_map(Instruction::jump_target)
            .all(|target| target < len);
        if !jumps_valid {
            return Err(unsafe_rewrite(code, "jump target out of code"));
        }
        let exceptions_valid = code
            .exception_table
            .iter()
            .all(|e| e.start <= e.end && e.end <= len && e.target < len);
        if !exceptions_valid {
            return Err(unsafe_rewrite(code, "malformed exception table"));
        }
        Ok(())
    }
}

fn unsafe_rewrite(code: &Code, reason: &'static str) -> Error {
    Error::UnsafeRewrite(code.qualname.to_string(), reason)
}
