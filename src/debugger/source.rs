//! Static structure of module source: function definitions and their line ranges.

use crate::debugger::Error;
use crate::runtime::compiler::lexer::tokenize;
use crate::runtime::compiler::parser::{Parser, Stmt, StmtKind};
use crate::runtime::RuntimeError;
use std::path::Path;

/// Function definition found in source text.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOutline {
    pub qualname: String,
    /// Line of the `def` statement.
    pub def_line: u32,
    /// Last non-blank line of the function body.
    pub end_line: u32,
    pub nested: Vec<FunctionOutline>,
}

impl FunctionOutline {
    pub fn contains(&self, line: u32) -> bool {
        self.def_line <= line && line <= self.end_line
    }
}

/// Tree of function definitions of a module.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceOutline {
    functions: Vec<FunctionOutline>,
}

impl SourceOutline {
    pub fn new(functions: Vec<FunctionOutline>) -> Self {
        Self { functions }
    }

    pub fn parse(source: &str) -> Result<Self, RuntimeError> {
        let body = Parser::new(tokenize(source)?).parse_module()?;
        let mut functions = vec![];
        collect(&body, None, &mut functions);
        Ok(Self { functions })
    }

    /// Top level function definitions.
    pub fn functions(&self) -> &[FunctionOutline] {
        &self.functions
    }

    /// Return chain of definitions containing the line, from outermost to innermost.
    ///
    /// # Errors
    ///
    /// [`Error::NoFunctionAtLine`] if no definition contains the line,
    /// [`Error::AmbiguousLocation`] if sibling definitions claim the same line.
    pub fn locate(&self, file: &Path, line: u32) -> Result<Vec<&FunctionOutline>, Error> {
        let mut chain = vec![];
        let mut level = &self.functions;
        loop {
            let mut candidates = level.iter().filter(|f| f.contains(line));
            let Some(found) = candidates.next() else {
                break;
            };
            if let Some(other) = candidates.next() {
                return Err(Error::AmbiguousLocation(
                    file.to_path_buf(),
                    line,
                    found.qualname.clone(),
                    other.qualname.clone(),
                ));
            }
            chain.push(found);
            level = &found.nested;
        }

        if chain.is_empty() {
            return Err(Error::NoFunctionAtLine(file.to_path_buf(), line));
        }
        Ok(chain)
    }

    /// Find definition by qualified name and `def` line at any depth.
    pub fn find(&self, qualname: &str, def_line: u32) -> Option<&FunctionOutline> {
        fn find_in<'a>(
            level: &'a [FunctionOutline],
            qualname: &str,
            def_line: u32,
        ) -> Option<&'a FunctionOutline> {
            level.iter().find_map(|f| {
                if f.qualname == qualname && f.def_line == def_line {
                    return Some(f);
                }
                find_in(&f.nested, qualname, def_line)
            })
        }
        find_in(&self.functions, qualname, def_line)
    }
}

fn collect(body: &[Stmt], parent: Option<&str>, out: &mut Vec<FunctionOutline>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Def(def) => {
                let qualname = match parent {
                    None => def.name.clone(),
                    Some(parent) => format!("{parent}.{}", def.name),
                };
                let mut nested = vec![];
                collect(&def.body, Some(&qualname), &mut nested);
                out.push(FunctionOutline {
                    qualname,
                    def_line: def.line,
                    end_line: def.end_line,
                    nested,
                });
            }
            StmtKind::If { branches, orelse } => {
                for branch in branches {
                    collect(&branch.body, parent, out);
                }
                collect(orelse, parent, out);
            }
            StmtKind::While { body, .. } => collect(body, parent, out),
            StmtKind::Try { body, handler } => {
                collect(body, parent, out);
                collect(&handler.body, parent, out);
            }
            _ => {}
        }
    }
}
