use colored::Colorize;
use itertools::Itertools;

use crate::middle::prim::{Prim, PrimArg, PrimFlow, PrimFork, PrimProto, ProcBody};

pub fn pretty_print_proc(proto: &PrimProto, body: &ProcBody) {
    println!(
        "{} {}{}{}{}",
        "proc".magenta(),
        proto.name.value().blue(),
        "(".white(),
        proto
            .params
            .iter()
            .map(|param| {
                let prefix = match param.flow {
                    PrimFlow::In => "",
                    PrimFlow::Out => "?",
                };
                format!("{prefix}{}:{}", param.name, param.ty)
            })
            .join(", ")
            .white(),
        ") {".white()
    );

    print_body(body, 1);

    println!("{}", "}".white());
}

fn print_body(body: &ProcBody, depth: usize) {
    let indent = "    ".repeat(depth);

    for prim in &body.prims {
        println!("{indent}{}", render_prim(&prim.value));
    }

    if let PrimFork::Fork {
        var,
        is_final,
        branches,
    } = &body.fork
    {
        let marker = if *is_final { " final" } else { "" };
        println!(
            "{indent}{} {}{}",
            "case".cyan(),
            var.to_string().yellow(),
            marker.bright_black()
        );
        for (value, branch) in branches.iter().enumerate() {
            println!("{indent}{} {}:", "of".cyan(), value.to_string().purple());
            print_body(branch, depth + 1);
        }
    }
}

fn render_prim(prim: &Prim) -> String {
    match prim {
        Prim::Call { callee, args } => format!(
            "{} {}({})",
            "call".cyan(),
            callee.to_string().blue(),
            args.iter().map(render_arg).join(", ")
        ),
        Prim::Foreign {
            lang,
            name,
            flags,
            args,
        } => {
            let mut rendered = format!("{} {} {}", "foreign".cyan(), lang, name.white());
            for flag in flags {
                rendered.push(' ');
                rendered.push_str(flag);
            }
            format!(
                "{rendered}({})",
                args.iter().map(render_arg).join(", ")
            )
        }
        Prim::Guard { var, value } => format!(
            "{} {} {} {}",
            "guard".cyan(),
            var.to_string().yellow(),
            "=".white(),
            value.to_string().purple()
        ),
        Prim::Fail => "fail".red().to_string(),
        Prim::Nop => "nop".bright_black().to_string(),
    }
}

fn render_arg(arg: &PrimArg) -> String {
    match arg {
        PrimArg::Var {
            flow: PrimFlow::Out,
            ..
        } => arg.to_string().yellow().to_string(),
        PrimArg::Var { .. } => arg.to_string().normal().to_string(),
        _ => arg.to_string().purple().to_string(),
    }
}
