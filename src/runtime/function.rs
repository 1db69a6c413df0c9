use crate::runtime::code::{Capture, Code};
use crate::runtime::module::Globals;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process unique identity of a function definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u64);

impl FunctionId {
    fn next() -> Self {
        FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Function definition.
///
/// Every closure created from a definition shares it, so replacing the definition code
/// affects all closures on their next invocation. Frames that already run keep
/// the representation they were started with.
pub struct Function {
    id: FunctionId,
    name: Arc<str>,
    qualname: Arc<str>,
    filename: Arc<str>,
    def_line: u32,
    end_line: u32,
    captures: Vec<Capture>,
    globals: Weak<Globals>,
    code: RwLock<Arc<Code>>,
}

pub(crate) struct FunctionProto {
    pub name: Arc<str>,
    pub qualname: Arc<str>,
    pub filename: Arc<str>,
    pub def_line: u32,
    pub end_line: u32,
    pub captures: Vec<Capture>,
}

impl Function {
    pub(crate) fn new(proto: FunctionProto, globals: Weak<Globals>, code: Code) -> Arc<Self> {
        Arc::new(Self {
            id: FunctionId::next(),
            name: proto.name,
            qualname: proto.qualname,
            filename: proto.filename,
            def_line: proto.def_line,
            end_line: proto.end_line,
            captures: proto.captures,
            globals,
            code: RwLock::new(Arc::new(code)),
        })
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dot separated path of enclosing function names and the function name.
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Line of the `def` statement.
    pub fn def_line(&self) -> u32 {
        self.def_line
    }

    /// Last line of the function body.
    pub fn end_line(&self) -> u32 {
        self.end_line
    }

    pub(crate) fn captures(&self) -> &[Capture] {
        &self.captures
    }

    pub(crate) fn globals(&self) -> Option<Arc<Globals>> {
        self.globals.upgrade()
    }

    /// Return code that new invocations will execute.
    pub fn code(&self) -> Arc<Code> {
        self.code
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch function to another code, return previous one.
    pub fn replace_code(&self, code: Arc<Code>) -> Arc<Code> {
        let mut current = self.code.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, code)
    }
}

impl Debug for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("id", &self.id)
            .field("qualname", &self.qualname)
            .field("filename", &self.filename)
            .field("def_line", &self.def_line)
            .field("end_line", &self.end_line)
            .finish()
    }
}
