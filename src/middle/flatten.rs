//! Flattens nested expressions out of statements. After this pass every
//! argument of a call or foreign instruction is atomic (a variable or a
//! literal); compound expressions are computed into fresh `$tmpN`
//! temporaries beforehand, and function calls in expression position become
//! procedure calls with an extra out argument.

use log::trace;

use crate::{
    frontend::{
        ast::{BinaryOp, Exp, ParamFlow, Stmt, TypeSpec},
        OptPos, Placed,
    },
    middle::prim::{temp_var, LLVM},
};

#[derive(Debug)]
pub struct Flattener {
    stmts: Vec<Placed<Stmt>>,
    tmp_count: usize,
}

/// Flattens a procedure body. `tmp_start` continues the proc's temporary
/// counter so names stay fresh across repeated flattening.
pub fn flatten_stmts(
    body: Vec<Placed<Stmt>>,
    tmp_start: usize,
) -> (Vec<Placed<Stmt>>, usize) {
    let mut flattener = Flattener {
        stmts: Vec::new(),
        tmp_count: tmp_start,
    };

    for stmt in body {
        flattener.flatten_stmt(stmt);
    }

    (flattener.stmts, flattener.tmp_count)
}

impl Flattener {
    fn next_temp(&mut self) -> Exp {
        let name = temp_var(self.tmp_count);
        self.tmp_count += 1;
        Exp::Var {
            name,
            flow: ParamFlow::In,
        }
    }

    fn flatten_block(&mut self, stmts: Vec<Placed<Stmt>>) -> Vec<Placed<Stmt>> {
        let saved = std::mem::take(&mut self.stmts);
        for stmt in stmts {
            self.flatten_stmt(stmt);
        }
        std::mem::replace(&mut self.stmts, saved)
    }

    fn flatten_stmt(&mut self, stmt: Placed<Stmt>) {
        let pos = stmt.pos.clone();

        match stmt.value {
            Stmt::Call { module, name, args } => {
                let args = args
                    .into_iter()
                    .map(|arg| self.flatten_exp(arg))
                    .collect();
                self.stmts
                    .push(Placed::new(Stmt::Call { module, name, args }, pos));
            }
            Stmt::Foreign {
                lang,
                name,
                flags,
                args,
            } => {
                let args = args
                    .into_iter()
                    .map(|arg| self.flatten_exp(arg))
                    .collect();
                self.stmts.push(Placed::new(
                    Stmt::Foreign {
                        lang,
                        name,
                        flags,
                        args,
                    },
                    pos,
                ));
            }
            Stmt::Assign { lhs, rhs } => self.flatten_assignment(lhs, rhs, pos),
            Stmt::If {
                cond,
                then_stmts,
                else_stmts,
            } => {
                let cond = self.flatten_exp(cond);
                // Unbranching switches on a variable; a literal condition
                // gets bound to one here (and folded at fork time).
                let cond = self.ensure_cond_var(cond);
                let then_stmts = self.flatten_block(then_stmts);
                let else_stmts = self.flatten_block(else_stmts);
                self.stmts.push(Placed::new(
                    Stmt::If {
                        cond,
                        then_stmts,
                        else_stmts,
                    },
                    pos,
                ));
            }
            Stmt::Loop { body } => {
                let body = self.flatten_block(body);
                self.stmts.push(Placed::new(Stmt::Loop { body }, pos));
            }
            // Loop generators become conditional breaks; unbranching then
            // only ever sees plain loops.
            Stmt::While { cond } => {
                let desugared = Stmt::If {
                    cond,
                    then_stmts: Vec::new(),
                    else_stmts: vec![Placed::new(Stmt::Break, pos.clone())],
                };
                self.flatten_stmt(Placed::new(desugared, pos));
            }
            Stmt::Until { cond } => {
                let desugared = Stmt::If {
                    cond,
                    then_stmts: vec![Placed::new(Stmt::Break, pos.clone())],
                    else_stmts: Vec::new(),
                };
                self.flatten_stmt(Placed::new(desugared, pos));
            }
            Stmt::Break => self.stmts.push(Placed::new(Stmt::Break, pos)),
            Stmt::Next => self.stmts.push(Placed::new(Stmt::Next, pos)),
            Stmt::Nop => {}
        }
    }

    /// `?lhs = rhs`: the right side computes directly into the left variable
    /// where it can (operations and calls); otherwise a move is emitted.
    fn flatten_assignment(&mut self, lhs: Placed<Exp>, rhs: Placed<Exp>, pos: OptPos) {
        let target = match assignment_target(&lhs) {
            Some(target) => target,
            None => {
                // Leave the malformed assignment for the unbrancher to
                // report; it knows the enclosing proc.
                self.stmts
                    .push(Placed::new(Stmt::Assign { lhs, rhs }, pos));
                return;
            }
        };

        match rhs.value {
            Exp::Binary { op, lhs: l, rhs: r } => {
                let l = self.flatten_exp(*l);
                let r = self.flatten_exp(*r);
                let (lang, name, flags) = binary_op_instr(op, &l, &r);
                trace!(target: "flatten", "assignment becomes foreign {lang} {name}");
                self.stmts.push(Placed::new(
                    Stmt::Foreign {
                        lang,
                        name,
                        flags,
                        args: vec![l, r, target],
                    },
                    pos,
                ));
            }
            Exp::Call { module, name, args } => {
                let mut args: Vec<Placed<Exp>> = args
                    .into_iter()
                    .map(|arg| self.flatten_exp(arg))
                    .collect();
                args.push(target);
                self.stmts
                    .push(Placed::new(Stmt::Call { module, name, args }, pos));
            }
            _ => {
                let source = self.flatten_exp(rhs);
                self.stmts.push(Placed::new(
                    Stmt::Foreign {
                        lang: LLVM.into(),
                        name: "move".into(),
                        flags: Vec::new(),
                        args: vec![source, target],
                    },
                    pos,
                ));
            }
        }
    }

    /// Binds a literal condition to a fresh variable; variables pass
    /// through untouched.
    fn ensure_cond_var(&mut self, cond: Placed<Exp>) -> Placed<Exp> {
        fn is_var(exp: &Exp) -> bool {
            match exp {
                Exp::Var { .. } => true,
                Exp::Typed { exp, .. } => is_var(&exp.value),
                _ => false,
            }
        }

        if is_var(&cond.value) {
            return cond;
        }

        let pos = cond.pos.clone();
        let result = self.next_temp();
        self.stmts.push(Placed::new(
            Stmt::Foreign {
                lang: LLVM.into(),
                name: "move".into(),
                flags: Vec::new(),
                args: vec![cond, Placed::new(out_flow(result.clone()), pos.clone())],
            },
            pos.clone(),
        ));
        Placed::new(result, pos)
    }

    /// Reduces an expression to an atomic one, emitting whatever statements
    /// are needed to compute it.
    fn flatten_exp(&mut self, exp: Placed<Exp>) -> Placed<Exp> {
        let pos = exp.pos.clone();

        match exp.value {
            value if value.is_atomic() => Placed::new(value, pos),
            Exp::Typed { exp: inner, ty } => {
                let inner = self.flatten_exp(*inner);
                let pos = inner.pos.clone();
                Placed::new(
                    Exp::Typed {
                        exp: Box::new(inner),
                        ty,
                    },
                    pos,
                )
            }
            Exp::Binary { op, lhs, rhs } => {
                let lhs = self.flatten_exp(*lhs);
                let rhs = self.flatten_exp(*rhs);

                let result = self.next_temp();
                let is_comparison = op.is_comparison();
                let (lang, name, flags) = binary_op_instr(op, &lhs, &rhs);

                self.stmts.push(Placed::new(
                    Stmt::Foreign {
                        lang,
                        name,
                        flags,
                        args: vec![lhs, rhs, Placed::new(out_flow(result.clone()), pos.clone())],
                    },
                    pos.clone(),
                ));

                if is_comparison {
                    Placed::new(
                        Exp::Typed {
                            exp: Box::new(Placed::new(result, pos.clone())),
                            ty: TypeSpec::boolean(),
                        },
                        pos,
                    )
                } else {
                    Placed::new(result, pos)
                }
            }
            Exp::Call { module, name, args } => {
                let mut args: Vec<Placed<Exp>> = args
                    .into_iter()
                    .map(|arg| self.flatten_exp(arg))
                    .collect();

                let result = self.next_temp();
                args.push(Placed::new(out_flow(result.clone()), pos.clone()));

                trace!(target: "flatten", "function call {name} gains an out argument");
                self.stmts
                    .push(Placed::new(Stmt::Call { module, name, args }, pos.clone()));

                Placed::new(result, pos)
            }
            atomic => Placed::new(atomic, pos),
        }
    }
}

fn assignment_target(lhs: &Placed<Exp>) -> Option<Placed<Exp>> {
    match &lhs.value {
        Exp::Var { name, .. } => Some(lhs.rewrap(Exp::Var {
            name: *name,
            flow: ParamFlow::Out,
        })),
        _ => None,
    }
}

fn out_flow(exp: Exp) -> Exp {
    match exp {
        Exp::Var { name, .. } => Exp::Var {
            name,
            flow: ParamFlow::Out,
        },
        other => other,
    }
}

/// True when a literal operand forces the floating point instruction set.
fn is_float_operand(exp: &Placed<Exp>) -> bool {
    match &exp.value {
        Exp::FloatLit(_) => true,
        Exp::Typed { exp, ty } => *ty == TypeSpec::float() || is_float_operand(exp),
        _ => false,
    }
}

/// Maps a surface operator to the foreign instruction implementing it.
fn binary_op_instr(
    op: BinaryOp,
    lhs: &Placed<Exp>,
    rhs: &Placed<Exp>,
) -> (String, String, Vec<String>) {
    let float = is_float_operand(lhs) || is_float_operand(rhs);

    let (name, flags) = match op {
        BinaryOp::Add => (if float { "fadd" } else { "add" }, None),
        BinaryOp::Subtract => (if float { "fsub" } else { "sub" }, None),
        BinaryOp::Multiply => (if float { "fmul" } else { "mul" }, None),
        BinaryOp::Divide => (if float { "fdiv" } else { "div" }, None),
        BinaryOp::Modulus => ("mod", None),
        BinaryOp::Equal => (if float { "fcmp" } else { "icmp" }, Some("eq")),
        BinaryOp::NotEqual => (if float { "fcmp" } else { "icmp" }, Some("ne")),
        BinaryOp::Less => (if float { "fcmp" } else { "icmp" }, Some("slt")),
        BinaryOp::LessEq => (if float { "fcmp" } else { "icmp" }, Some("sle")),
        BinaryOp::Greater => (if float { "fcmp" } else { "icmp" }, Some("sgt")),
        BinaryOp::GreaterEq => (if float { "fcmp" } else { "icmp" }, Some("sge")),
    };

    (
        LLVM.into(),
        name.into(),
        flags.into_iter().map(String::from).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::Ident;

    fn var_in(name: &str) -> Placed<Exp> {
        Placed::unplaced(Exp::Var {
            name: Ident::new(name),
            flow: ParamFlow::In,
        })
    }

    fn var_out(name: &str) -> Placed<Exp> {
        Placed::unplaced(Exp::Var {
            name: Ident::new(name),
            flow: ParamFlow::Out,
        })
    }

    #[test]
    fn nested_operand_gets_a_temporary() {
        // p(x + 1)  =>  foreign llvm add(x, 1, ?$tmp0); p($tmp0)
        let call = Placed::unplaced(Stmt::Call {
            module: None,
            name: Ident::new("p"),
            args: vec![Placed::unplaced(Exp::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(var_in("x")),
                rhs: Box::new(Placed::unplaced(Exp::IntLit(1))),
            })],
        });

        let (stmts, tmp_count) = flatten_stmts(vec![call], 0);

        assert_eq!(tmp_count, 1);
        assert_eq!(stmts.len(), 2);
        let Stmt::Foreign { name, args, .. } = &stmts[0].value else {
            panic!("expected foreign add first");
        };
        assert_eq!(name, "add");
        assert_eq!(args.len(), 3);
        let Stmt::Call { args, .. } = &stmts[1].value else {
            panic!("expected the call second");
        };
        assert!(matches!(
            &args[0].value,
            Exp::Var { name, .. } if name.value() == "$tmp0"
        ));
    }

    #[test]
    fn assignment_computes_into_its_target() {
        // ?z = x + 1  =>  foreign llvm add(x, 1, ?z)  (no temporary)
        let assign = Placed::unplaced(Stmt::Assign {
            lhs: var_out("z"),
            rhs: Placed::unplaced(Exp::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(var_in("x")),
                rhs: Box::new(Placed::unplaced(Exp::IntLit(1))),
            }),
        });

        let (stmts, tmp_count) = flatten_stmts(vec![assign], 0);

        assert_eq!(tmp_count, 0);
        assert_eq!(stmts.len(), 1);
        let Stmt::Foreign { name, args, .. } = &stmts[0].value else {
            panic!("expected a foreign add");
        };
        assert_eq!(name, "add");
        assert!(matches!(
            &args[2].value,
            Exp::Var {
                flow: ParamFlow::Out,
                ..
            }
        ));
    }

    #[test]
    fn function_call_rhs_gains_out_argument() {
        // ?y = f(x)  =>  f(x, ?y)
        let assign = Placed::unplaced(Stmt::Assign {
            lhs: var_out("y"),
            rhs: Placed::unplaced(Exp::Call {
                module: None,
                name: Ident::new("f"),
                args: vec![var_in("x")],
            }),
        });

        let (stmts, _) = flatten_stmts(vec![assign], 0);

        assert_eq!(stmts.len(), 1);
        let Stmt::Call { name, args, .. } = &stmts[0].value else {
            panic!("expected a call");
        };
        assert_eq!(name.value(), "f");
        assert_eq!(args.len(), 2);
        assert!(matches!(
            &args[1].value,
            Exp::Var {
                flow: ParamFlow::Out,
                ..
            } if matches!(&args[1].value, Exp::Var { name, .. } if name.value() == "y")
        ));
    }

    #[test]
    fn while_desugars_to_conditional_break() {
        let stmts = vec![Placed::unplaced(Stmt::Loop {
            body: vec![Placed::unplaced(Stmt::While {
                cond: var_in("going"),
            })],
        })];

        let (stmts, _) = flatten_stmts(stmts, 0);

        let Stmt::Loop { body } = &stmts[0].value else {
            panic!("expected the loop");
        };
        let Stmt::If {
            then_stmts,
            else_stmts,
            ..
        } = &body[0].value
        else {
            panic!("expected the conditional break");
        };
        assert!(then_stmts.is_empty());
        assert!(matches!(else_stmts[0].value, Stmt::Break));
    }

    #[test]
    fn comparison_condition_is_typed_boolean() {
        let stmt = Placed::unplaced(Stmt::If {
            cond: Placed::unplaced(Exp::Binary {
                op: BinaryOp::Less,
                lhs: Box::new(var_in("x")),
                rhs: Box::new(Placed::unplaced(Exp::IntLit(10))),
            }),
            then_stmts: Vec::new(),
            else_stmts: Vec::new(),
        });

        let (stmts, _) = flatten_stmts(vec![stmt], 0);

        assert_eq!(stmts.len(), 2);
        let Stmt::Foreign { name, flags, .. } = &stmts[0].value else {
            panic!("expected the comparison first");
        };
        assert_eq!(name, "icmp");
        assert_eq!(flags, &vec!["slt".to_owned()]);
        let Stmt::If { cond, .. } = &stmts[1].value else {
            panic!("expected the if second");
        };
        assert!(matches!(&cond.value, Exp::Typed { ty, .. } if *ty == TypeSpec::boolean()));
    }
}
