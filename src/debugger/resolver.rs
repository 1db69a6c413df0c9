use crate::debugger::source::{FunctionOutline, SourceOutline};
use crate::debugger::Error;
use crate::lb_warn;
use crate::runtime::{Function, FunctionId, Module, ModuleRegistry};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Resolved function: the patchable unit and its position in the source.
#[derive(Debug, Clone)]
pub struct FunctionHandle {
    pub unit: Arc<Function>,
    pub qualname: String,
    /// Canonical path of the owning module.
    pub module: PathBuf,
    pub def_line: u32,
    pub end_line: u32,
    /// Enclosing function, if the function is nested.
    pub parent: Option<FunctionId>,
}

impl FunctionHandle {
    pub fn id(&self) -> FunctionId {
        self.unit.id()
    }
}

/// Maps source locations to compiled functions.
pub trait SourceResolver: Send + Sync {
    /// Return the canonical identity of a file: the path of a loaded module
    /// matching the file exactly or by path suffix.
    fn canonicalize(&self, file: &Path) -> Result<PathBuf, Error>;

    /// Return the innermost function whose definition contains the line.
    fn resolve(&self, file: &Path, line: u32) -> Result<FunctionHandle, Error>;

    /// Return functions defined directly inside the function.
    fn enumerate_nested(&self, handle: &FunctionHandle) -> Result<Vec<FunctionHandle>, Error>;

    /// Return false if the function no longer belongs to a loaded module
    /// (the module was reloaded or unloaded).
    fn is_live(&self, module: &Path, function: &Function) -> bool {
        _ = (module, function);
        true
    }
}

struct CachedOutline {
    source: Arc<str>,
    outline: Arc<SourceOutline>,
}

/// [`SourceResolver`] over modules of a [`ModuleRegistry`].
/// Only loaded modules are resolved, a module is never loaded on demand.
pub struct ModuleResolver {
    modules: Arc<ModuleRegistry>,
    outlines: Mutex<LruCache<PathBuf, CachedOutline>>,
}

impl ModuleResolver {
    pub fn new(modules: Arc<ModuleRegistry>, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            modules,
            outlines: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Return module outline, parse module source if the cached one is missing or stale.
    fn outline(&self, module: &Module) -> Result<Arc<SourceOutline>, Error> {
        let mut cache = self.outlines.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(module.path()) {
            if Arc::ptr_eq(&cached.source, module.source()) {
                return Ok(cached.outline.clone());
            }
        }

        let outline = Arc::new(SourceOutline::parse(module.source())?);
        cache.put(
            module.path().to_path_buf(),
            CachedOutline {
                source: module.source().clone(),
                outline: outline.clone(),
            },
        );
        Ok(outline)
    }

    fn module(&self, path: &Path) -> Result<Arc<Module>, Error> {
        self.modules
            .get(path)
            .ok_or_else(|| Error::ModuleNotLoaded(path.to_path_buf()))
    }

    fn handle(
        module: &Module,
        outline: &FunctionOutline,
        parent: Option<FunctionId>,
    ) -> Result<FunctionHandle, Error> {
        let unit = module
            .function_at(&outline.qualname, outline.def_line)
            .ok_or_else(|| {
                Error::FunctionNotLoaded(module.path().to_path_buf(), outline.qualname.clone())
            })?;
        Ok(FunctionHandle {
            unit: unit.clone(),
            qualname: outline.qualname.clone(),
            module: module.path().to_path_buf(),
            def_line: outline.def_line,
            end_line: outline.end_line,
            parent,
        })
    }
}

impl SourceResolver for ModuleResolver {
    fn is_live(&self, module: &Path, function: &Function) -> bool {
        self.modules.get(module).is_some_and(|m| {
            m.functions()
                .iter()
                .any(|f| std::ptr::eq(Arc::as_ptr(f), function))
        })
    }

    fn canonicalize(&self, file: &Path) -> Result<PathBuf, Error> {
        if self.modules.get(file).is_some() {
            return Ok(file.to_path_buf());
        }

        let mut candidates: Vec<PathBuf> = self
            .modules
            .modules()
            .iter()
            .map(|m| m.path().to_path_buf())
            .filter(|path| path.ends_with(file))
            .collect();
        candidates.sort_by(|a, b| {
            a.components()
                .count()
                .cmp(&b.components().count())
                .then_with(|| a.cmp(b))
        });

        let path = candidates
            .first()
            .cloned()
            .ok_or_else(|| Error::ModuleNotLoaded(file.to_path_buf()))?;
        if candidates.len() > 1 {
            lb_warn!(
                "file `{}` matches several loaded modules, use `{}`",
                file.display(),
                path.display()
            );
        }
        Ok(path)
    }

    fn resolve(&self, file: &Path, line: u32) -> Result<FunctionHandle, Error> {
        let path = self.canonicalize(file)?;
        let module = self.module(&path)?;
        let outline = self.outline(&module)?;
        let chain = outline.locate(&path, line)?;

        let innermost = chain[chain.len() - 1];
        let parent = match chain.len() {
            1 => None,
            n => Some(Self::handle(&module, chain[n - 2], None)?.id()),
        };
        Self::handle(&module, innermost, parent)
    }

    fn enumerate_nested(&self, handle: &FunctionHandle) -> Result<Vec<FunctionHandle>, Error> {
        let module = self.module(&handle.module)?;
        let outline = self.outline(&module)?;
        let Some(function) = outline.find(&handle.qualname, handle.def_line) else {
            return Err(Error::FunctionNotLoaded(
                handle.module.clone(),
                handle.qualname.clone(),
            ));
        };
        function
            .nested
            .iter()
            .map(|nested| Self::handle(&module, nested, Some(handle.id())))
            .collect()
    }
}
