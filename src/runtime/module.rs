use crate::runtime::code::Code;
use crate::runtime::compiler;
use crate::runtime::error::RuntimeError;
use crate::runtime::function::Function;
use crate::runtime::interpreter::{self, run_module};
use crate::runtime::value::{NativeFn, NativeFunction, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Module level variables.
#[derive(Default)]
pub struct Globals {
    vars: RwLock<HashMap<Arc<str>, Value>>,
}

impl Globals {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn set(&self, name: impl Into<Arc<str>>, value: Value) {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }
}

/// Loaded and executed program unit.
pub struct Module {
    path: PathBuf,
    source: Arc<str>,
    globals: Arc<Globals>,
    functions: Vec<Arc<Function>>,
    body: Arc<Code>,
}

impl Module {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Source text the module was compiled from.
    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    pub fn globals(&self) -> &Arc<Globals> {
        &self.globals
    }

    /// All function definitions of the module, nested included.
    pub fn functions(&self) -> &[Arc<Function>] {
        &self.functions
    }

    pub fn body(&self) -> &Arc<Code> {
        &self.body
    }

    /// Find function definition by qualified name (`outer.inner`).
    pub fn function(&self, qualname: &str) -> Option<&Arc<Function>> {
        self.functions.iter().find(|f| f.qualname() == qualname)
    }

    /// Find function definition by qualified name and `def` line.
    pub fn function_at(&self, qualname: &str, def_line: u32) -> Option<&Arc<Function>> {
        self.functions
            .iter()
            .find(|f| f.qualname() == qualname && f.def_line() == def_line)
    }

    /// Call a module level function by its name.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let callee = self
            .globals
            .get(name)
            .ok_or_else(|| RuntimeError::Name(format!("name `{name}` is not defined")))?;
        interpreter::call(&callee, args)
    }
}

/// Registry of live modules.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<PathBuf, Arc<Module>>>,
    builtins: RwLock<HashMap<Arc<str>, Value>>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        let registry = Self {
            modules: RwLock::default(),
            builtins: RwLock::default(),
        };
        registry.register_native(NativeFn::new("len", |_, args| match args {
            [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
            [Value::List(items)] => Ok(Value::Int(items.len() as i64)),
            [other] => Err(RuntimeError::Type(format!(
                "object of type `{}` has no len()",
                other.type_name()
            ))),
            _ => Err(RuntimeError::Type("len() takes exactly one argument".to_string())),
        }));
        registry.register_native(NativeFn::new("str", |_, args| match args {
            [value] => Ok(Value::from(value.to_string().as_str())),
            _ => Err(RuntimeError::Type("str() takes exactly one argument".to_string())),
        }));
        registry
    }
}

impl ModuleRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a native function visible to modules loaded afterwards.
    pub fn register_native(&self, native: Arc<dyn NativeFunction>) {
        let name: Arc<str> = Arc::from(native.name());
        self.builtins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Value::Native(native));
    }

    /// Compile module source, execute module body and register the module.
    /// Loading the same path again replaces a previous module.
    pub fn load(
        &self,
        path: impl Into<PathBuf>,
        source: &str,
    ) -> Result<Arc<Module>, RuntimeError> {
        let path = path.into();
        let globals = Arc::new(Globals::default());
        for (name, value) in self
            .builtins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            globals.set(name.clone(), value.clone());
        }

        let compiled = compiler::compile(&path.to_string_lossy(), source, &globals)?;
        let body = Arc::new(compiled.body);
        run_module(body.clone(), globals.clone())?;

        let module = Arc::new(Module {
            path: path.clone(),
            source: Arc::from(source),
            globals,
            functions: compiled.functions,
            body,
        });
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, module.clone());
        Ok(module)
    }

    /// Read module source from file system and load it.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Arc<Module>, RuntimeError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        self.load(path, &source)
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Module>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn unload(&self, path: &Path) -> Option<Arc<Module>> {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
    }
}
