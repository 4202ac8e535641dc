//! The per-module artifact for separate compilation: a stable serialisation
//! of the module's interface and its primitive-form implementations. An
//! importer can load the artifact instead of recompiling the source; a
//! loaded module compares structurally equal to the one written (positions
//! excepted).

use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::{CompileError, Result},
    frontend::ast::{Ident, ModSpec, Visibility},
    middle::{analysis::ProcAnalysis, prim::PrimProto, prim::ProcBody},
};

use super::modules::{
    LoadNum, Module, ModuleImplementation, ModuleInterface, ProcDef, ProcImpl, ProcProto,
};

pub const ARTIFACT_EXTENSION: &str = "wybo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleArtifact {
    pub spec: ModSpec,
    pub type_params: Option<Vec<Ident>>,
    pub interface: ModuleInterface,
    pub procs: Vec<ArtifactProc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactProc {
    pub name: Ident,
    pub id: usize,
    pub proto: ProcProto,
    pub prim_proto: PrimProto,
    pub body: ProcBody,
    pub analysis: ProcAnalysis,
    pub visibility: Visibility,
}

/// Captures a module's persistent parts. Procs still in source form are
/// skipped; the artifact only carries what separate compilation can use.
pub fn encode_module(module: &Module) -> ModuleArtifact {
    let mut procs = Vec::new();

    if let Some(implementation) = &module.implementation {
        for defs in implementation.procs.values() {
            for def in defs {
                let (prim_proto, body, analysis) = match &def.impln {
                    ProcImpl::Prim {
                        proto,
                        body,
                        analysis,
                    }
                    | ProcImpl::Blocks {
                        proto,
                        body,
                        analysis,
                        ..
                    } => (proto.clone(), body.clone(), analysis.clone()),
                    ProcImpl::Source { .. } => continue,
                };
                procs.push(ArtifactProc {
                    name: def.name,
                    id: def.id,
                    proto: def.proto.clone(),
                    prim_proto,
                    body,
                    analysis,
                    visibility: def.visibility,
                });
            }
        }
    }

    ModuleArtifact {
        spec: module.spec.clone(),
        type_params: module.type_params.clone(),
        interface: module.interface.clone(),
        procs,
    }
}

/// Reconstitutes a module from its artifact. Source-only details (local
/// types, resources, imports) are gone; everything call resolution and
/// analysis need is back.
pub fn decode_module(artifact: ModuleArtifact, directory: PathBuf, load_num: LoadNum) -> Module {
    let mut implementation = ModuleImplementation::default();

    for proc in artifact.procs {
        implementation.procs.entry(proc.name).or_default().push(ProcDef {
            name: proc.name,
            id: proc.id,
            proto: proc.proto,
            impln: ProcImpl::Prim {
                proto: proc.prim_proto,
                body: proc.body,
                analysis: proc.analysis,
            },
            visibility: proc.visibility,
            is_test: false,
            pos: None,
            temp_count: 0,
        });
    }

    Module {
        directory,
        spec: artifact.spec,
        type_params: artifact.type_params,
        interface: artifact.interface,
        implementation: Some(implementation),
        this_load_num: load_num,
        min_dependency_num: load_num,
    }
}

pub fn artifact_path(directory: &Path, spec: &ModSpec) -> PathBuf {
    let name = spec
        .last()
        .map(|n| n.value().to_owned())
        .unwrap_or_else(|| "module".to_owned());
    directory.join(name).with_extension(ARTIFACT_EXTENSION)
}

pub fn write_module(module: &Module, path: &Path) -> Result<()> {
    let artifact = encode_module(module);
    let contents = serde_json::to_string_pretty(&artifact)?;
    std::fs::write(path, contents)?;
    debug!(target: "driver", "wrote artifact {}", path.display());
    Ok(())
}

pub fn read_module(path: &Path, load_num: LoadNum) -> Result<Module> {
    let contents = std::fs::read_to_string(path)?;
    let artifact: ModuleArtifact = serde_json::from_str(&contents)?;
    let directory = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| CompileError::internal("artifact path has no parent directory"))?;
    debug!(target: "driver", "loaded artifact {}", path.display());
    Ok(decode_module(artifact, directory, load_num))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{Param, ParamFlow, TypeSpec};
    use crate::frontend::intern::InternedSymbol;
    use crate::frontend::Placed;
    use crate::index::Index;
    use crate::middle::prim::{Prim, PrimArg, PrimFlow, PrimParam, PrimVarName, ProcSpec};

    fn sample_module() -> Module {
        let mut module = Module::new(
            PathBuf::from("."),
            ModSpec::from_segments(&["sample"]),
            LoadNum::new(3),
        );

        let name = InternedSymbol::new("bump");
        let x = InternedSymbol::new("x");
        let y = InternedSymbol::new("y");

        let body = ProcBody::new(
            vec![Placed::unplaced(Prim::Foreign {
                lang: "llvm".into(),
                name: "add".into(),
                flags: Vec::new(),
                args: vec![
                    PrimArg::input_var(PrimVarName::first(x), TypeSpec::int()),
                    PrimArg::int(1),
                    PrimArg::output_var(PrimVarName::output(y), TypeSpec::int()),
                ],
            })],
            Default::default(),
        );

        module.add_proc(ProcDef {
            name,
            id: 0,
            proto: ProcProto {
                name,
                params: vec![
                    Param {
                        name: x,
                        ty: TypeSpec::int(),
                        flow: ParamFlow::In,
                        pos: None,
                    },
                    Param {
                        name: y,
                        ty: TypeSpec::int(),
                        flow: ParamFlow::Out,
                        pos: None,
                    },
                ],
            },
            impln: ProcImpl::Prim {
                proto: PrimProto {
                    name,
                    params: vec![
                        PrimParam {
                            name: PrimVarName::first(x),
                            ty: TypeSpec::int(),
                            flow: PrimFlow::In,
                            flow_type: Default::default(),
                        },
                        PrimParam {
                            name: PrimVarName::output(y),
                            ty: TypeSpec::int(),
                            flow: PrimFlow::Out,
                            flow_type: Default::default(),
                        },
                    ],
                },
                body,
                analysis: ProcAnalysis::default(),
            },
            visibility: Visibility::Public,
            is_test: false,
            pos: None,
            temp_count: 0,
        });

        module
    }

    #[test]
    fn encode_decode_is_structurally_equal() {
        let module = sample_module();

        let artifact = encode_module(&module);
        let json = serde_json::to_string(&artifact).unwrap();
        let reread: ModuleArtifact = serde_json::from_str(&json).unwrap();

        assert_eq!(artifact, reread);

        let decoded = decode_module(reread, PathBuf::from("."), LoadNum::new(9));
        assert_eq!(decoded.spec, module.spec);
        assert_eq!(decoded.interface, module.interface);

        let original = &module.lookup_procs(InternedSymbol::new("bump"))[0];
        let restored = &decoded.lookup_procs(InternedSymbol::new("bump"))[0];
        assert_eq!(restored.proto, original.proto);

        let (ProcImpl::Prim { body: a, .. }, ProcImpl::Prim { body: b, .. }) =
            (&original.impln, &restored.impln)
        else {
            panic!("expected primitive form on both sides");
        };
        assert_eq!(a, b);
    }

    #[test]
    fn artifact_path_uses_module_name() {
        let path = artifact_path(Path::new("/tmp/build"), &ModSpec::from_segments(&["geom"]));
        assert_eq!(path, PathBuf::from("/tmp/build/geom.wybo"));
    }
}
