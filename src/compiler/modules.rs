//! The module tree: every module has a public interface consulted by its
//! importers and a private implementation holding everything defined in it.
//! Adding a public item updates both sides; adding a private one only the
//! implementation.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CompileError, Result},
    frontend::{
        ast::{CtorDecl, Ident, ModSpec, Param, Stmt, TypeSpec, Visibility},
        OptPos, Placed,
    },
    index::simple_index,
    middle::{
        analysis::ProcAnalysis,
        prim::{PrimProto, ProcBody, ProcSpec},
    },
};

simple_index! {
    /// Order in which a module started loading. The SCC discipline compares
    /// these: a module whose lowest transitive dependency is itself roots
    /// its component.
    pub struct LoadNum;
}

/// A public type as importers see it: just its arity and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub arity: usize,
    pub pos: OptPos,
}

/// The source-level prototype of a proc, as used for call resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcProto {
    pub name: Ident,
    pub params: Vec<Param>,
}

/// A public proc entry in a module interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcCallInfo {
    pub id: usize,
    pub proto: ProcProto,
    pub pos: OptPos,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleInterface {
    pub public_types: BTreeMap<Ident, TypeInfo>,
    pub public_resources: BTreeMap<Ident, OptPos>,
    pub public_procs: BTreeMap<Ident, Vec<ProcCallInfo>>,
    /// Dependencies re-exported to importers of this module.
    pub public_dependencies: BTreeSet<ModSpec>,
    /// Every module this one transitively depends on, for linking.
    pub dependencies: BTreeSet<ModSpec>,
}

/// What an import makes visible, and at which visibility it is re-exported.
/// Combining two import specs for the same module takes the elementwise
/// maximum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportSpec {
    pub items: BTreeMap<Ident, Visibility>,
    /// Present when the whole module is imported (`use m`).
    pub whole: Option<Visibility>,
}

impl ImportSpec {
    pub fn whole_module(visibility: Visibility) -> Self {
        Self {
            items: BTreeMap::new(),
            whole: Some(visibility),
        }
    }

    pub fn combine(&mut self, other: &ImportSpec) {
        for (item, visibility) in &other.items {
            let entry = self.items.entry(*item).or_insert(*visibility);
            *entry = (*entry).max(*visibility);
        }
        self.whole = match (self.whole, other.whole) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub params: Vec<Ident>,
    pub ctors: Vec<Placed<CtorDecl>>,
    pub visibility: Visibility,
    pub pos: OptPos,
}

#[derive(Debug, Clone)]
pub struct ResourceDef {
    pub ty: TypeSpec,
    pub visibility: Visibility,
    pub pos: OptPos,
}

/// Stages a proc's implementation moves through. Transitions are one-way:
/// source to primitive to emitted blocks. The blocks form keeps the
/// analysed primitive parts alongside the emitted code, since artifacts and
/// module assembly still need them.
#[derive(Debug, Clone)]
pub enum ProcImpl {
    Source {
        body: Vec<Placed<Stmt>>,
    },
    Prim {
        proto: PrimProto,
        body: ProcBody,
        analysis: ProcAnalysis,
    },
    Blocks {
        proto: PrimProto,
        body: ProcBody,
        analysis: ProcAnalysis,
        code: crate::backend::llvm::EmittedProc,
    },
}

impl ProcImpl {
    fn stage(&self) -> u8 {
        match self {
            ProcImpl::Source { .. } => 0,
            ProcImpl::Prim { .. } => 1,
            ProcImpl::Blocks { .. } => 2,
        }
    }

    pub fn stage_name(&self) -> &'static str {
        match self {
            ProcImpl::Source { .. } => "source",
            ProcImpl::Prim { .. } => "primitive",
            ProcImpl::Blocks { .. } => "blocks",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcDef {
    pub name: Ident,
    /// Index among same-named procs in this module.
    pub id: usize,
    pub proto: ProcProto,
    pub impln: ProcImpl,
    pub visibility: Visibility,
    pub is_test: bool,
    pub pos: OptPos,
    /// Continues the `$tmpN` counter across flattening passes.
    pub temp_count: usize,
}

impl ProcDef {
    /// Replaces the implementation, enforcing the forward-only stage order.
    pub fn advance_impl(&mut self, new_impl: ProcImpl) -> Result<()> {
        if new_impl.stage() < self.impln.stage() {
            return Err(CompileError::internal(format!(
                "proc {} moving backwards from {} to {}",
                self.name,
                self.impln.stage_name(),
                new_impl.stage_name()
            )));
        }
        self.impln = new_impl;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleImplementation {
    pub imports: BTreeMap<ModSpec, ImportSpec>,
    pub submodules: BTreeMap<Ident, ModSpec>,
    pub types: BTreeMap<Ident, TypeDef>,
    pub resources: BTreeMap<Ident, ResourceDef>,
    pub procs: BTreeMap<Ident, Vec<ProcDef>>,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub directory: PathBuf,
    pub spec: ModSpec,
    pub type_params: Option<Vec<Ident>>,
    pub interface: ModuleInterface,
    pub implementation: Option<ModuleImplementation>,
    /// Order this module started loading; drives SCC discovery.
    pub this_load_num: LoadNum,
    /// Lowest load number this module transitively depends on. Equal to
    /// `this_load_num` exactly when this module roots its SCC.
    pub min_dependency_num: LoadNum,
}

impl Module {
    pub fn new(directory: PathBuf, spec: ModSpec, load_num: LoadNum) -> Self {
        Self {
            directory,
            spec,
            type_params: None,
            interface: ModuleInterface::default(),
            implementation: Some(ModuleImplementation::default()),
            this_load_num: load_num,
            min_dependency_num: load_num,
        }
    }

    pub fn implementation(&self) -> &ModuleImplementation {
        self.implementation
            .as_ref()
            .expect("module under compilation has an implementation")
    }

    pub fn implementation_mut(&mut self) -> &mut ModuleImplementation {
        self.implementation
            .as_mut()
            .expect("module under compilation has an implementation")
    }

    pub fn add_import(&mut self, from: ModSpec, import: ImportSpec) {
        if import.whole == Some(Visibility::Public) {
            self.interface.public_dependencies.insert(from.clone());
        }
        self.interface.dependencies.insert(from.clone());
        self.implementation_mut()
            .imports
            .entry(from)
            .or_default()
            .combine(&import);
    }

    pub fn add_type(&mut self, name: Ident, def: TypeDef) {
        if def.visibility == Visibility::Public {
            self.interface.public_types.insert(
                name,
                TypeInfo {
                    arity: def.params.len(),
                    pos: def.pos.clone(),
                },
            );
        }
        self.implementation_mut().types.insert(name, def);
    }

    pub fn add_resource(&mut self, name: Ident, def: ResourceDef) {
        if def.visibility == Visibility::Public {
            self.interface
                .public_resources
                .insert(name, def.pos.clone());
        }
        self.implementation_mut().resources.insert(name, def);
    }

    /// Appends a proc definition, assigning its overload id, and mirrors it
    /// into the interface when public.
    pub fn add_proc(&mut self, mut def: ProcDef) -> ProcSpec {
        def.id = self
            .implementation()
            .procs
            .get(&def.name)
            .map(|entries| entries.len())
            .unwrap_or(0);
        let proc_spec = ProcSpec::new(self.spec.clone(), def.name, def.id);

        if def.visibility == Visibility::Public {
            self.interface.public_procs.entry(def.name).or_default().push(
                ProcCallInfo {
                    id: def.id,
                    proto: def.proto.clone(),
                    pos: def.pos.clone(),
                },
            );
        }

        self.implementation_mut()
            .procs
            .entry(def.name)
            .or_default()
            .push(def);
        proc_spec
    }

    pub fn lookup_procs(&self, name: Ident) -> &[ProcDef] {
        self.implementation
            .as_ref()
            .and_then(|imp| imp.procs.get(&name))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The type a name denotes inside this module, if declared here.
    pub fn local_type(&self, name: Ident) -> Option<TypeSpec> {
        self.implementation
            .as_ref()
            .and_then(|imp| imp.types.get(&name))
            .map(|_| TypeSpec::Type {
                mod_spec: self.spec.clone(),
                name,
                params: Vec::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::intern::InternedSymbol;
    use crate::index::Index;

    fn module() -> Module {
        Module::new(
            PathBuf::from("."),
            ModSpec::from_segments(&["m"]),
            LoadNum::new(1),
        )
    }

    fn proc_def(name: &str, visibility: Visibility) -> ProcDef {
        ProcDef {
            name: InternedSymbol::new(name),
            id: 0,
            proto: ProcProto {
                name: InternedSymbol::new(name),
                params: Vec::new(),
            },
            impln: ProcImpl::Source { body: Vec::new() },
            visibility,
            is_test: false,
            pos: None,
            temp_count: 0,
        }
    }

    #[test]
    fn public_proc_appears_in_both_tables() {
        let mut module = module();
        let name = InternedSymbol::new("p");

        module.add_proc(proc_def("p", Visibility::Public));

        assert_eq!(module.lookup_procs(name).len(), 1);
        assert_eq!(module.interface.public_procs[&name].len(), 1);
    }

    #[test]
    fn private_proc_stays_out_of_the_interface() {
        let mut module = module();
        let name = InternedSymbol::new("q");

        module.add_proc(proc_def("q", Visibility::Private));

        assert_eq!(module.lookup_procs(name).len(), 1);
        assert!(!module.interface.public_procs.contains_key(&name));
    }

    #[test]
    fn overloads_get_sequential_ids() {
        let mut module = module();

        let first = module.add_proc(proc_def("p", Visibility::Private));
        let second = module.add_proc(proc_def("p", Visibility::Private));

        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
    }

    #[test]
    fn import_specs_combine_by_max_visibility() {
        let mut spec = ImportSpec {
            items: BTreeMap::from([(InternedSymbol::new("a"), Visibility::Private)]),
            whole: Some(Visibility::Private),
        };
        let other = ImportSpec {
            items: BTreeMap::from([
                (InternedSymbol::new("a"), Visibility::Public),
                (InternedSymbol::new("b"), Visibility::Private),
            ]),
            whole: None,
        };

        spec.combine(&other);

        assert_eq!(spec.items[&InternedSymbol::new("a")], Visibility::Public);
        assert_eq!(spec.items[&InternedSymbol::new("b")], Visibility::Private);
        assert_eq!(spec.whole, Some(Visibility::Private));
    }

    #[test]
    fn impl_stage_never_moves_backwards() {
        let mut def = proc_def("p", Visibility::Private);

        def.advance_impl(ProcImpl::Prim {
            proto: PrimProto {
                name: InternedSymbol::new("p"),
                params: Vec::new(),
            },
            body: ProcBody::empty(),
            analysis: ProcAnalysis::default(),
        })
        .unwrap();

        let back = def.advance_impl(ProcImpl::Source { body: Vec::new() });
        assert!(back.is_err());
    }
}
