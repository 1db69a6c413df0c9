use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Breakpoint identity, assigned by the breakpoint source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakpointId(String);

impl BreakpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique (uuid v4) identity.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BreakpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BreakpointId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Where a breakpoint captures.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Before the first instruction of a line.
    #[default]
    Line,
    /// On every exit of the function containing the line, with the return value
    /// or the raised exception.
    Exit,
}

/// Source location: file, line number and probe kind.
///
/// Locations stored by the debugger always contain a canonical file path,
/// the path of a loaded module.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub file: PathBuf,
    pub line: u32,
    pub kind: ProbeKind,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, line: u32) -> Self {
        Self::with_kind(file, line, ProbeKind::Line)
    }

    /// Exit probe of the function containing the line.
    pub fn exit(file: impl Into<PathBuf>, line: u32) -> Self {
        Self::with_kind(file, line, ProbeKind::Exit)
    }

    pub fn with_kind(file: impl Into<PathBuf>, line: u32, kind: ProbeKind) -> Self {
        Self {
            file: file.into(),
            line,
            kind,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)?;
        if self.kind == ProbeKind::Exit {
            f.write_str(" (exit)")?;
        }
        Ok(())
    }
}

/// Desired breakpoint.
///
/// Deserializable both from `{uuid, filename, lineno, conditional_expr}`
/// and `{id, file, line, condition}` records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(alias = "id")]
    pub uuid: BreakpointId,
    #[serde(alias = "file")]
    pub filename: PathBuf,
    #[serde(alias = "line")]
    pub lineno: u32,
    /// Condition expression. Reserved, conditions are not evaluated by default.
    #[serde(alias = "condition", default)]
    pub conditional_expr: Option<String>,
    #[serde(default)]
    pub probe: ProbeKind,
}

impl Breakpoint {
    /// Create breakpoint with a generated identity.
    pub fn new(filename: impl Into<PathBuf>, lineno: u32) -> Self {
        Self::with_id(BreakpointId::random(), filename, lineno)
    }

    pub fn with_id(id: impl Into<BreakpointId>, filename: impl Into<PathBuf>, lineno: u32) -> Self {
        Self {
            uuid: id.into(),
            filename: filename.into(),
            lineno,
            conditional_expr: None,
            probe: ProbeKind::Line,
        }
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.conditional_expr = Some(expr.into());
        self
    }

    /// Capture on exit of the function containing the line instead of at the line.
    pub fn on_exit(mut self) -> Self {
        self.probe = ProbeKind::Exit;
        self
    }

    pub fn file(&self) -> &Path {
        &self.filename
    }

    /// Location as requested, before file canonicalization.
    pub fn requested_location(&self) -> Location {
        Location::with_kind(self.filename.clone(), self.lineno, self.probe)
    }
}

impl From<String> for BreakpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
