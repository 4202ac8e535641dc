//! Deterministic textual LLVM emission from the primitive form. One define
//! per proc; the fork tree maps directly onto labelled blocks (no joins, so
//! no phis), `"llvm"` foreign instructions map onto their namesakes, the
//! `"lpvm"` memory operations expand to `getelementptr`/`load`/`store`
//! around the runtime allocator, and any other foreign language becomes a
//! declared extern.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use itertools::Itertools;
use log::debug;

use crate::{
    error::{CompileError, Result},
    middle::prim::{Prim, PrimArg, PrimFlow, PrimFork, PrimProto, PrimVarName, ProcBody, ProcSpec, LLVM, LPVM},
};

use super::{llvm_type, verify_proc};

#[derive(Debug, Clone)]
pub struct EmittedProc {
    pub define: String,
    /// Extern declarations this proc relies on, deduplicated module-wide.
    pub declares: BTreeSet<String>,
    /// String constants referenced by the define.
    pub globals: Vec<String>,
}

/// The link-level symbol for a proc.
pub fn symbol(spec: &ProcSpec) -> String {
    format!("{}.{}.{}", spec.mod_spec, spec.name, spec.id)
}

pub fn emit_proc(spec: &ProcSpec, proto: &PrimProto, body: &ProcBody) -> Result<EmittedProc> {
    let problems = verify_proc(proto, body);
    if let Some(problem) = problems.first() {
        return Err(CompileError::internal(format!(
            "codegen contract violated: {problem}"
        )));
    }

    let mut emitter = Emitter {
        spec,
        proto,
        blocks: Vec::new(),
        current: 0,
        next_label: 0,
        next_tmp: 0,
        declares: BTreeSet::new(),
        globals: Vec::new(),
        fail_label: None,
        var_types: HashMap::new(),
    };

    for param in &proto.params {
        emitter
            .var_types
            .insert(param.name, llvm_type(&param.ty).to_owned());
    }

    emitter.push_block("entry".to_owned());
    emitter.emit_body(body)?;

    let ins = proto
        .params
        .iter()
        .filter(|p| p.flow == PrimFlow::In && !p.is_phantom())
        .map(|p| format!("{} {}", llvm_type(&p.ty), var_ref(&p.name)))
        .join(", ");

    let mut define = format!(
        "define {} @\"{}\"({}) {{\n",
        emitter.return_type(),
        symbol(spec),
        ins
    );
    for (label, text) in &emitter.blocks {
        define.push_str(&format!("{label}:\n"));
        define.push_str(text);
    }
    define.push_str("}\n");

    debug!(target: "blocks", "emitted {}", symbol(spec));

    Ok(EmittedProc {
        define,
        declares: emitter.declares,
        globals: emitter.globals,
    })
}

/// A register reference for an SSA variable. `$` and `.` are both legal in
/// LLVM identifiers, so the source naming carries straight through.
fn var_ref(name: &PrimVarName) -> String {
    if name.suffix == PrimVarName::OUTPUT_SUFFIX {
        format!("%{}.out", name.name)
    } else {
        format!("%{}.{}", name.name, name.suffix)
    }
}

/// Doubles are printed as their bit pattern; it round-trips exactly and
/// never hits the parser's decimal-format corner cases.
fn float_constant(value: f64) -> String {
    format!("0x{:016X}", value.to_bits())
}

struct Emitter<'a> {
    spec: &'a ProcSpec,
    proto: &'a PrimProto,
    blocks: Vec<(String, String)>,
    current: usize,
    next_label: usize,
    next_tmp: usize,
    declares: BTreeSet<String>,
    globals: Vec<String>,
    fail_label: Option<String>,
    var_types: HashMap<PrimVarName, String>,
}

impl<'a> Emitter<'a> {
    fn push_block(&mut self, label: String) -> usize {
        self.blocks.push((label, String::new()));
        self.current = self.blocks.len() - 1;
        self.current
    }

    fn fresh_label(&mut self, base: &str) -> String {
        self.next_label += 1;
        format!("{base}{}", self.next_label)
    }

    fn fresh_tmp(&mut self) -> String {
        self.next_tmp += 1;
        format!("%tmp.{}", self.next_tmp)
    }

    fn line(&mut self, text: String) {
        let block = &mut self.blocks[self.current].1;
        block.push_str("  ");
        block.push_str(&text);
        block.push('\n');
    }

    fn return_type(&self) -> String {
        let outs: Vec<&str> = self
            .proto
            .params
            .iter()
            .filter(|p| p.flow == PrimFlow::Out && !p.is_phantom())
            .map(|p| llvm_type(&p.ty))
            .collect();
        match outs.as_slice() {
            [] => "void".to_owned(),
            [one] => (*one).to_owned(),
            many => format!("{{{}}}", many.iter().join(", ")),
        }
    }

    /// Renders an input argument as `type value`, registering any string
    /// global it needs.
    fn operand(&mut self, arg: &PrimArg) -> (String, String) {
        match arg {
            PrimArg::Var { name, ty, .. } => {
                let ty = self
                    .var_types
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| llvm_type(ty).to_owned());
                (ty, var_ref(name))
            }
            PrimArg::Int { value, ty } => (llvm_type(ty).to_owned(), value.to_string()),
            PrimArg::Float { value, .. } => ("double".to_owned(), float_constant(*value)),
            PrimArg::Char { value, .. } => ("i8".to_owned(), (*value as u32).to_string()),
            PrimArg::Str { value, .. } => {
                let name = format!("@\"{}.str.{}\"", symbol(self.spec), self.globals.len());
                let bytes = value.as_bytes();
                let escaped: String = bytes
                    .iter()
                    .map(|b| format!("\\{b:02X}"))
                    .collect();
                self.globals.push(format!(
                    "{name} = private unnamed_addr constant [{} x i8] c\"{escaped}\\00\"",
                    bytes.len() + 1
                ));
                ("ptr".to_owned(), name)
            }
        }
    }

    fn define_output(&mut self, arg: &PrimArg) -> (String, String) {
        let PrimArg::Var { name, ty, .. } = arg else {
            unreachable!("outputs are always variables");
        };
        let ty = llvm_type(ty).to_owned();
        self.var_types.insert(*name, ty.clone());
        (ty, var_ref(name))
    }

    fn fail_block(&mut self) -> String {
        if let Some(label) = &self.fail_label {
            return label.clone();
        }
        let label = "unreachable.fail".to_owned();
        let saved = self.current;
        self.push_block(label.clone());
        self.declares
            .insert("declare void @llvm.trap()".to_owned());
        self.line("call void @llvm.trap()".to_owned());
        self.line("unreachable".to_owned());
        self.current = saved;
        self.fail_label = Some(label.clone());
        label
    }

    fn emit_body(&mut self, body: &ProcBody) -> Result<()> {
        for placed in &body.prims {
            self.emit_prim(&placed.value)?;
        }

        match &body.fork {
            PrimFork::NoFork => self.emit_return(),
            PrimFork::Fork { var, branches, .. } => {
                let ty = self
                    .var_types
                    .get(var)
                    .cloned()
                    .unwrap_or_else(|| "i64".to_owned());

                let labels: Vec<String> = branches
                    .iter()
                    .map(|_| self.fresh_label("branch."))
                    .collect();

                if ty == "i1" && branches.len() == 2 {
                    self.line(format!(
                        "br i1 {}, label %{}, label %{}",
                        var_ref(var),
                        labels[1],
                        labels[0]
                    ));
                } else {
                    // Branch index equals the switch value; out-of-range
                    // values cannot happen for well-typed input, so branch 0
                    // doubles as the default.
                    let cases = labels
                        .iter()
                        .enumerate()
                        .skip(1)
                        .map(|(value, label)| format!("{ty} {value}, label %{label}"))
                        .join(" ");
                    self.line(format!(
                        "switch {ty} {}, label %{} [{cases}]",
                        var_ref(var),
                        labels[0]
                    ));
                }

                for (label, branch) in labels.into_iter().zip(branches) {
                    self.push_block(label);
                    self.emit_body(branch)?;
                }
                Ok(())
            }
        }
    }

    fn emit_return(&mut self) -> Result<()> {
        let outs: Vec<(String, String)> = self
            .proto
            .params
            .iter()
            .filter(|p| p.flow == PrimFlow::Out && !p.is_phantom())
            .map(|p| (llvm_type(&p.ty).to_owned(), var_ref(&p.name)))
            .collect();

        match outs.as_slice() {
            [] => self.line("ret void".to_owned()),
            [(ty, value)] => self.line(format!("ret {ty} {value}")),
            many => {
                let struct_ty = format!("{{{}}}", many.iter().map(|(ty, _)| ty).join(", "));
                let mut acc = "undef".to_owned();
                for (index, (ty, value)) in many.iter().enumerate() {
                    let tmp = self.fresh_tmp();
                    self.line(format!(
                        "{tmp} = insertvalue {struct_ty} {acc}, {ty} {value}, {index}"
                    ));
                    acc = tmp;
                }
                self.line(format!("ret {struct_ty} {acc}"));
            }
        }
        Ok(())
    }

    fn emit_prim(&mut self, prim: &Prim) -> Result<()> {
        match prim {
            Prim::Call { callee, args } => self.emit_call(&symbol(callee), args, false),
            Prim::Foreign {
                lang, name, flags, args,
            } => {
                if lang == LLVM {
                    self.emit_llvm_op(name, flags, args)
                } else if lang == LPVM {
                    self.emit_lpvm_op(name, args)
                } else {
                    // Any other language is an external symbol.
                    self.emit_call(name, args, true)
                }
            }
            Prim::Guard { var, value } => {
                let cond = self.fresh_tmp();
                let ty = self
                    .var_types
                    .get(var)
                    .cloned()
                    .unwrap_or_else(|| "i64".to_owned());
                self.line(format!("{cond} = icmp eq {ty} {}, {value}", var_ref(var)));
                let cont = self.fresh_label("guard.");
                let fail = self.fail_block();
                self.line(format!("br i1 {cond}, label %{cont}, label %{fail}"));
                self.push_block(cont);
                Ok(())
            }
            Prim::Fail => {
                let fail = self.fail_block();
                self.line(format!("br label %{fail}"));
                Ok(())
            }
            Prim::Nop => Ok(()),
        }
    }

    fn emit_llvm_op(&mut self, name: &str, flags: &[String], args: &[PrimArg]) -> Result<()> {
        let inputs: Vec<&PrimArg> = args.iter().filter(|a| a.is_input()).collect();
        let outputs: Vec<&PrimArg> = args.iter().filter(|a| a.is_output()).collect();

        match (name, inputs.as_slice(), outputs.as_slice()) {
            ("move", [source], [dest]) => {
                let (src_ty, src) = self.operand(source);
                let (_, dst) = self.define_output(dest);
                let copy = match src_ty.as_str() {
                    "double" => format!("{dst} = fadd double {src}, 0x0000000000000000"),
                    "ptr" => format!("{dst} = getelementptr i8, ptr {src}, i64 0"),
                    ty => format!("{dst} = add {ty} {src}, 0"),
                };
                self.line(copy);
                Ok(())
            }
            ("add" | "sub" | "mul" | "div" | "mod", [lhs, rhs], [dest]) => {
                let instr = match name {
                    "add" => "add",
                    "sub" => "sub",
                    "mul" => "mul",
                    "div" => "sdiv",
                    _ => "srem",
                };
                let (ty, lhs) = self.operand(lhs);
                let (_, rhs) = self.operand(rhs);
                let (_, dst) = self.define_output(dest);
                self.line(format!("{dst} = {instr} {ty} {lhs}, {rhs}"));
                Ok(())
            }
            ("fadd" | "fsub" | "fmul" | "fdiv", [lhs, rhs], [dest]) => {
                let (_, lhs) = self.operand(lhs);
                let (_, rhs) = self.operand(rhs);
                let (_, dst) = self.define_output(dest);
                self.line(format!("{dst} = {name} double {lhs}, {rhs}"));
                Ok(())
            }
            ("icmp", [lhs, rhs], [dest]) => {
                let predicate = flags.first().map(String::as_str).unwrap_or("eq");
                let (ty, lhs) = self.operand(lhs);
                let (_, rhs) = self.operand(rhs);
                let (_, dst) = self.define_output(dest);
                self.line(format!("{dst} = icmp {predicate} {ty} {lhs}, {rhs}"));
                Ok(())
            }
            ("fcmp", [lhs, rhs], [dest]) => {
                let predicate = match flags.first().map(String::as_str).unwrap_or("eq") {
                    "eq" => "oeq",
                    "ne" => "one",
                    "slt" => "olt",
                    "sle" => "ole",
                    "sgt" => "ogt",
                    "sge" => "oge",
                    other => other,
                };
                let (_, lhs) = self.operand(lhs);
                let (_, rhs) = self.operand(rhs);
                let (_, dst) = self.define_output(dest);
                self.line(format!("{dst} = fcmp {predicate} double {lhs}, {rhs}"));
                Ok(())
            }
            _ => Err(CompileError::internal(format!(
                "unknown llvm operation `{name}` with {} input(s)",
                inputs.len()
            ))),
        }
    }

    fn emit_lpvm_op(&mut self, name: &str, args: &[PrimArg]) -> Result<()> {
        match (name, args) {
            // alloc(size, ?ref)
            ("alloc", [size, dest]) => {
                self.declares
                    .insert("declare ptr @wybe_malloc(i64)".to_owned());
                let (_, size) = self.operand(size);
                let (_, dst) = self.define_output(dest);
                self.line(format!("{dst} = call ptr @wybe_malloc(i64 {size})"));
                Ok(())
            }
            // access(ref, offset, size, ?value)
            ("access", [source, offset, _size, dest]) => {
                let (_, source) = self.operand(source);
                let (_, offset) = self.operand(offset);
                let slot = self.fresh_tmp();
                self.line(format!(
                    "{slot} = getelementptr i8, ptr {source}, i64 {offset}"
                ));
                let (ty, dst) = self.define_output(dest);
                self.line(format!("{dst} = load {ty}, ptr {slot}"));
                Ok(())
            }
            // mutate(ref, ?ref', size, offset, destructive, value)
            ("mutate", [source, dest, size, offset, destructive, value]) => {
                let destructive = matches!(destructive, PrimArg::Int { value: 1, .. });
                let (_, source) = self.operand(source);
                let (_, size) = self.operand(size);
                let (_, offset) = self.operand(offset);
                let (value_ty, value) = self.operand(value);
                let (_, dst) = self.define_output(dest);

                let target = if destructive {
                    // Updating in place: the output is the same reference.
                    self.line(format!("{dst} = getelementptr i8, ptr {source}, i64 0"));
                    dst.clone()
                } else {
                    self.declares
                        .insert("declare ptr @wybe_copy(ptr, i64)".to_owned());
                    self.line(format!(
                        "{dst} = call ptr @wybe_copy(ptr {source}, i64 {size})"
                    ));
                    dst.clone()
                };

                let slot = self.fresh_tmp();
                self.line(format!(
                    "{slot} = getelementptr i8, ptr {target}, i64 {offset}"
                ));
                self.line(format!("store {value_ty} {value}, ptr {slot}"));
                Ok(())
            }
            // cast(value, ?value')
            ("cast", [source, dest]) => {
                let (src_ty, src) = self.operand(source);
                let (dst_ty, dst) = {
                    let (ty, name) = self.define_output(dest);
                    (ty, name)
                };
                let instr = match (src_ty.as_str(), dst_ty.as_str()) {
                    ("ptr", "ptr") => format!("{dst} = getelementptr i8, ptr {src}, i64 0"),
                    ("ptr", _) => format!("{dst} = ptrtoint ptr {src} to {dst_ty}"),
                    (_, "ptr") => format!("{dst} = inttoptr {src_ty} {src} to ptr"),
                    _ => format!("{dst} = bitcast {src_ty} {src} to {dst_ty}"),
                };
                self.line(instr);
                Ok(())
            }
            _ => Err(CompileError::internal(format!(
                "unknown lpvm operation `{name}` with {} argument(s)",
                args.len()
            ))),
        }
    }

    /// A call to another proc or an external symbol. Multiple outputs come
    /// back as an anonymous struct and are unpacked with extractvalue.
    fn emit_call(&mut self, target: &str, args: &[PrimArg], is_extern: bool) -> Result<()> {
        let inputs: Vec<(String, String)> = args
            .iter()
            .filter(|a| a.is_input())
            .filter(|a| !a.ty().is_phantom())
            .map(|a| self.operand(a))
            .collect();
        let outputs: Vec<&PrimArg> = args
            .iter()
            .filter(|a| a.is_output())
            .filter(|a| !a.ty().is_phantom())
            .collect();

        let ret = match outputs.as_slice() {
            [] => "void".to_owned(),
            [one] => llvm_type(one.ty()).to_owned(),
            many => format!("{{{}}}", many.iter().map(|o| llvm_type(o.ty())).join(", ")),
        };

        if is_extern {
            self.declares.insert(format!(
                "declare {ret} @{target}({})",
                inputs.iter().map(|(ty, _)| ty.as_str()).join(", ")
            ));
        }

        let rendered_args = inputs
            .iter()
            .map(|(ty, value)| format!("{ty} {value}"))
            .join(", ");
        let callee = if is_extern {
            format!("@{target}")
        } else {
            format!("@\"{target}\"")
        };

        match outputs.as_slice() {
            [] => {
                self.line(format!("call void {callee}({rendered_args})"));
            }
            [one] => {
                let (_, dst) = self.define_output(one);
                self.line(format!("{dst} = call {ret} {callee}({rendered_args})"));
            }
            many => {
                let packed = self.fresh_tmp();
                self.line(format!("{packed} = call {ret} {callee}({rendered_args})"));
                for (index, output) in many.iter().enumerate() {
                    let (_, dst) = self.define_output(output);
                    self.line(format!("{dst} = extractvalue {ret} {packed}, {index}"));
                }
            }
        }
        Ok(())
    }
}

/// Assembles a whole module's worth of emitted procs into one textual LLVM
/// module: globals first, then the deduplicated declares, then the defines.
pub fn assemble_module(procs: &[EmittedProc]) -> String {
    let mut declares: BTreeSet<String> = BTreeSet::new();
    let mut globals = Vec::new();
    for proc in procs {
        declares.extend(proc.declares.iter().cloned());
        globals.extend(proc.globals.iter().cloned());
    }

    let mut text = String::new();
    for global in globals {
        text.push_str(&global);
        text.push('\n');
    }
    if !text.is_empty() {
        text.push('\n');
    }
    for declare in declares {
        text.push_str(&declare);
        text.push('\n');
    }
    text.push('\n');
    for proc in procs {
        text.push_str(&proc.define);
        text.push('\n');
    }
    text
}
