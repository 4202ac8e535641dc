use std::path::PathBuf;
use std::process::ExitCode;

use clap::{error::ErrorKind, CommandFactory, Parser as ClapParser};

use wybe::{
    compiler::{driver, modules::ProcImpl, CompilerState, LogCategory, Options},
    frontend::{ast::Item, parser, SourceFile, SourceFileOrigin},
    middle::{flatten, pretty_print},
};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short = 'e', value_enum)]
    emit: Option<EmitFormat>,

    /// 0 = errors only, 1 adds warnings, 2 debug, 3 full tracing
    #[arg(long, default_value_t = 0)]
    verbosity: u8,

    /// Enable stderr tracing for a pipeline component (repeatable)
    #[arg(long = "log", value_enum)]
    log_categories: Vec<LogCategory>,

    /// Write a .wybo interface artifact next to each compiled module
    #[arg(long)]
    artifacts: bool,

    source_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitFormat {
    #[value(name = "ast")]
    Ast,
    #[value(name = "flat")]
    Flat,
    #[value(name = "body")]
    Body,
    #[value(name = "llvm")]
    Llvm,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.source_files.is_empty() {
        Args::command()
            .error(ErrorKind::MissingRequiredArgument, "Missing source files!")
            .exit();
    }

    for source_file in &args.source_files {
        if !source_file.is_file() {
            Args::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Source file '{}' does not exist!", source_file.display()),
                )
                .exit()
        }
    }

    init_logging(&args);

    let options = Options {
        verbosity: args.verbosity,
        log_categories: args.log_categories.clone(),
        write_artifacts: args.artifacts,
    };
    let mut state = CompilerState::new(options);

    for path in &args.source_files {
        // The early emit formats stop before the module pipeline runs.
        if matches!(args.emit, Some(EmitFormat::Ast | EmitFormat::Flat)) {
            if let Err(error) = emit_frontend_stage(path, args.emit.unwrap()) {
                eprintln!("{error}");
                return ExitCode::FAILURE;
            }
            continue;
        }

        match driver::compile_source_file(&mut state, path) {
            Ok(spec) => match args.emit {
                Some(EmitFormat::Body) => {
                    if let Some(module) = state.modules.get(&spec) {
                        for defs in module.implementation().procs.values() {
                            for def in defs {
                                match &def.impln {
                                    ProcImpl::Prim { proto, body, .. }
                                    | ProcImpl::Blocks { proto, body, .. } => {
                                        pretty_print::pretty_print_proc(proto, body)
                                    }
                                    ProcImpl::Source { .. } => {}
                                }
                            }
                        }
                    }
                }
                Some(EmitFormat::Llvm) => match driver::llvm_module_text(&state, &spec) {
                    Ok(text) => println!("{text}"),
                    Err(error) => eprintln!("{error}"),
                },
                _ => {}
            },
            Err(error) => {
                eprintln!("error: {error}");
                state.flush_diagnostics();
                return ExitCode::FAILURE;
            }
        }
    }

    state.flush_diagnostics();
    if state.errors_seen() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn emit_frontend_stage(path: &PathBuf, emit: EmitFormat) -> std::io::Result<()> {
    let contents = std::fs::read_to_string(path)?;
    let source = SourceFile {
        contents,
        origin: SourceFileOrigin::File(path.clone()),
    };

    let (items, errors) = parser::parse_items(&source);
    for error in &errors {
        eprintln!("syntax error: {} ({:?})", error.message, error.pos);
    }

    if emit == EmitFormat::Ast {
        println!("{items:#?}");
        return Ok(());
    }

    for item in items {
        if let Item::Proc(decl) = item.value {
            let (flat, _) = flatten::flatten_stmts(decl.body, 0);
            println!("proc {}:", decl.name);
            println!("{flat:#?}");
        }
    }
    Ok(())
}

/// Verbosity picks the global level; `--log` raises individual components
/// to full tracing. `RUST_LOG` still overrides everything.
fn init_logging(args: &Args) {
    let level = match args.verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    for category in &args.log_categories {
        builder.filter_module(&category.target(), log::LevelFilter::Trace);
    }
    builder
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .init();
}
