//! Compiler-wide state: options, the diagnostic buffer, the set of loaded
//! modules, and the stack of modules currently being compiled. Module
//! loading follows the Tarjan lowlink discipline: each module gets a load
//! number on entry, tracks the lowest load number it transitively depends
//! on, and a module whose two numbers agree on exit roots a completed
//! strongly connected component.

use std::collections::BTreeMap;
use std::path::PathBuf;

use colored::Colorize;
use log::debug;

use crate::{
    error::{CompileError, Diagnostic, Result, Severity},
    frontend::ast::ModSpec,
    index::Index,
};

pub mod artifact;
pub mod driver;
pub mod modules;
pub mod normalise;

use modules::{LoadNum, Module};

/// Pipeline components whose stderr tracing can be toggled individually.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    clap::ValueEnum,
)]
#[strum(serialize_all = "snake_case")]
pub enum LogCategory {
    Flatten,
    Unbranch,
    #[value(name = "body_builder")]
    BodyBuilder,
    Analysis,
    Blocks,
    Driver,
}

impl LogCategory {
    /// The `log` target the component traces under.
    pub fn target(self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// 0 = errors only, up to 3 = full tracing.
    pub verbosity: u8,
    pub log_categories: Vec<LogCategory>,
    /// Write a `.wybo` interface artifact next to each compiled module.
    pub write_artifacts: bool,
}

#[derive(Debug)]
pub struct CompilerState {
    pub options: Options,
    diagnostics: Vec<Diagnostic>,
    error_seen: bool,
    /// Fully loaded modules, by their specs.
    pub modules: BTreeMap<ModSpec, Module>,
    load_count: LoadNum,
    /// Modules currently being compiled, innermost last.
    under_compilation: Vec<Module>,
    /// Modules finished compiling whose SCC has not closed yet.
    deferred: Vec<Module>,
}

impl CompilerState {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            diagnostics: Vec::new(),
            error_seen: false,
            modules: BTreeMap::new(),
            load_count: LoadNum::new(0),
            under_compilation: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /* Diagnostics */

    pub fn message(&mut self, diagnostic: Diagnostic) {
        if diagnostic.severity == Severity::Error {
            self.error_seen = true;
        }
        self.diagnostics.push(diagnostic);
    }

    pub fn messages(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            self.message(diagnostic);
        }
    }

    pub fn errors_seen(&self) -> bool {
        self.error_seen
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Prints all buffered diagnostics to stderr in source order (unplaced
    /// messages come last, in emission order).
    pub fn flush_diagnostics(&mut self) {
        let mut diagnostics = std::mem::take(&mut self.diagnostics);
        diagnostics.sort_by(|a, b| match (&a.pos, &b.pos) {
            (Some(pa), Some(pb)) => (&pa.file, pa.line, pa.column).cmp(&(&pb.file, pb.line, pb.column)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        for diagnostic in &diagnostics {
            let severity = match diagnostic.severity {
                Severity::Error => "error".red().bold(),
                Severity::Warning => "warning".yellow().bold(),
                Severity::Informational => "info".cyan(),
            };
            match &diagnostic.pos {
                Some(pos) => eprintln!("{severity}: {} ({pos})", diagnostic.message),
                None => eprintln!("{severity}: {}", diagnostic.message),
            }
        }
    }

    /* The module stack */

    /// Claims the next load number, for modules that enter fully formed
    /// (loaded from an artifact rather than compiled).
    pub fn next_load_num(&mut self) -> LoadNum {
        self.load_count.increment_by(1);
        self.load_count
    }

    /// Starts compiling a module: assigns its load number and pushes it
    /// onto the under-compilation stack.
    pub fn enter_module(&mut self, directory: PathBuf, spec: ModSpec) {
        let load_num = self.next_load_num();
        debug!(target: "driver", "entering module {spec} (load {})", load_num.index());
        self.under_compilation
            .push(Module::new(directory, spec, load_num));
    }

    /// Finishes the current module. If it still depends on a module deeper
    /// in the stack its SCC is not complete and it is parked on the
    /// deferred list (returning an empty set); otherwise it roots its SCC,
    /// and the whole component is moved into the loaded-module map and
    /// returned for downstream processing.
    pub fn exit_module(&mut self) -> Result<Vec<ModSpec>> {
        let module = self
            .under_compilation
            .pop()
            .ok_or_else(|| CompileError::internal("exit_module with no module under compilation"))?;

        debug!(
            target: "driver",
            "exiting module {} (load {}, min dependency {})",
            module.spec,
            module.this_load_num.index(),
            module.min_dependency_num.index()
        );

        if module.min_dependency_num < module.this_load_num {
            // Part of a cycle rooted deeper in the stack. Propagate the
            // lowlink to the enclosing module and wait for the root.
            let min = module.min_dependency_num;
            if let Some(parent) = self.under_compilation.last_mut() {
                parent.min_dependency_num = parent.min_dependency_num.min(min);
            }
            self.deferred.push(module);
            return Ok(Vec::new());
        }

        // SCC root: every deferred module whose lowlink reached this root
        // belongs to the component.
        let root_num = module.this_load_num;
        let mut component = vec![module];
        while let Some(last) = self.deferred.last() {
            if last.min_dependency_num == root_num {
                component.push(self.deferred.pop().unwrap());
            } else {
                break;
            }
        }

        let mut specs = Vec::new();
        for module in component {
            specs.push(module.spec.clone());
            self.modules.insert(module.spec.clone(), module);
        }
        specs.reverse();
        Ok(specs)
    }

    pub fn current_module(&self) -> Result<&Module> {
        self.under_compilation
            .last()
            .ok_or_else(|| CompileError::internal("no module under compilation"))
    }

    pub fn current_module_mut(&mut self) -> Result<&mut Module> {
        self.under_compilation
            .last_mut()
            .ok_or_else(|| CompileError::internal("no module under compilation"))
    }

    /// The module for a spec wherever it currently lives: loaded, deferred,
    /// or somewhere on the stack.
    pub fn find_module(&self, spec: &ModSpec) -> Option<&Module> {
        self.modules
            .get(spec)
            .or_else(|| self.deferred.iter().find(|m| &m.spec == spec))
            .or_else(|| self.under_compilation.iter().find(|m| &m.spec == spec))
    }

    /// Whether the spec is on the under-compilation stack (an import of it
    /// from above is a cycle).
    pub fn is_under_compilation(&self, spec: &ModSpec) -> Option<LoadNum> {
        self.under_compilation
            .iter()
            .find(|m| &m.spec == spec)
            .map(|m| m.this_load_num)
    }

    /// Whether the spec finished compiling but sits in an unfinished SCC.
    pub fn deferred_min_dependency(&self, spec: &ModSpec) -> Option<LoadNum> {
        self.deferred
            .iter()
            .find(|m| &m.spec == spec)
            .map(|m| m.min_dependency_num)
    }

    /// Records that the current module depends on something with the given
    /// load number, lowering its lowlink if needed.
    pub fn note_dependency_num(&mut self, load_num: LoadNum) -> Result<()> {
        let current = self.current_module_mut()?;
        current.min_dependency_num = current.min_dependency_num.min(load_num);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ModSpec {
        ModSpec::from_segments(&[name])
    }

    fn state() -> CompilerState {
        CompilerState::new(Options::default())
    }

    #[test]
    fn acyclic_modules_complete_alone() {
        let mut state = state();

        state.enter_module(PathBuf::from("."), spec("a"));
        state.enter_module(PathBuf::from("."), spec("b"));

        // b finishes first and forms its own component.
        let scc = state.exit_module().unwrap();
        assert_eq!(scc, vec![spec("b")]);

        let scc = state.exit_module().unwrap();
        assert_eq!(scc, vec![spec("a")]);
        assert!(state.modules.contains_key(&spec("a")));
    }

    #[test]
    fn cyclic_modules_complete_together_at_the_root() {
        let mut state = state();

        // a imports b; b imports a (a cycle).
        state.enter_module(PathBuf::from("."), spec("a"));
        state.enter_module(PathBuf::from("."), spec("b"));

        // While compiling b, the import of a is found on the stack.
        let a_num = state.is_under_compilation(&spec("a")).unwrap();
        state.note_dependency_num(a_num).unwrap();

        // b defers (its SCC is rooted at a).
        let scc = state.exit_module().unwrap();
        assert!(scc.is_empty());
        assert!(state.deferred_min_dependency(&spec("b")).is_some());

        // a closes the component, releasing both.
        let scc = state.exit_module().unwrap();
        assert_eq!(scc.len(), 2);
        assert!(scc.contains(&spec("a")));
        assert!(scc.contains(&spec("b")));

        // Counter invariants: min <= this, equality exactly at the root.
        let a = &state.modules[&spec("a")];
        let b = &state.modules[&spec("b")];
        assert_eq!(a.min_dependency_num, a.this_load_num);
        assert!(b.min_dependency_num < b.this_load_num);
        assert_eq!(b.min_dependency_num, a.this_load_num);
    }

    #[test]
    fn error_diagnostics_set_the_flag() {
        let mut state = state();
        assert!(!state.errors_seen());

        state.message(Diagnostic::warning("just a warning", None));
        assert!(!state.errors_seen());

        state.message(Diagnostic::error("a real problem", None));
        assert!(state.errors_seen());
    }

    #[test]
    fn three_module_chain_with_inner_cycle() {
        let mut state = state();

        // a -> b -> c with c importing b: the b/c pair cycles, a does not.
        state.enter_module(PathBuf::from("."), spec("a"));
        state.enter_module(PathBuf::from("."), spec("b"));
        state.enter_module(PathBuf::from("."), spec("c"));

        let b_num = state.is_under_compilation(&spec("b")).unwrap();
        state.note_dependency_num(b_num).unwrap();

        assert!(state.exit_module().unwrap().is_empty()); // c defers

        let scc = state.exit_module().unwrap(); // b roots {b, c}
        assert_eq!(scc.len(), 2);

        let scc = state.exit_module().unwrap(); // a alone
        assert_eq!(scc, vec![spec("a")]);
    }
}
