use clap::{Args, Parser, Subcommand};
use quill::backend::vm::{LogLevel, VirtualMachine};
use quill::bytecode::opt::{optimize, OptOptions};
use quill::bytecode::{compile, text, Function};
use quill::frontend::interp::Interpreter;
use quill::frontend::lexer::Lexer;
use quill::frontend::parser::ast::Program;
use std::fs;
use std::io::{Read, Write};

#[derive(Parser)]
#[command(name = "quill")]
#[command(version = "0.1.0")]
#[command(about = "Quill: scripting-language compiler and bytecode VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Diagnostic verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Release, global = true)]
    mode: LogLevel,
}

#[derive(Args)]
struct IoArgs {
    /// Input path, '-' for stdin
    #[arg(default_value = "-")]
    input: String,

    /// Output path, '-' for stdout
    #[arg(short = 'o', long = "output", default_value = "-")]
    output: String,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    io: IoArgs,

    /// Maximum heap size in MiB
    #[arg(short = 'm', long = "mem", default_value_t = 4)]
    mem: usize,

    /// Comma-separated optimizations
    /// (optimize, dce, constprop, inline, licm, all)
    #[arg(short = 'O', long = "opt", value_delimiter = ',')]
    opt: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the token listing of a source file
    Scan(IoArgs),
    /// Check that a source file parses
    Parse(IoArgs),
    /// Compile source text to bytecode text
    Compile(RunArgs),
    /// Evaluate the AST directly
    Interpret(IoArgs),
    /// Parse, optimize and execute bytecode text
    Vm(RunArgs),
    /// Compile source text and execute it immediately
    Derby(RunArgs),
}

fn read_input(path: &str) -> Result<String, String> {
    if path == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .map_err(|e| format!("Error: failed to read stdin: {}", e))?;
        Ok(text)
    } else {
        fs::read_to_string(path)
            .map_err(|e| format!("Error: failed to read '{}': {}", path, e))
    }
}

fn open_output(path: &str) -> Result<Box<dyn Write>, String> {
    if path == "-" {
        Ok(Box::new(std::io::stdout()))
    } else {
        let file = fs::File::create(path)
            .map_err(|e| format!("Error: failed to create '{}': {}", path, e))?;
        Ok(Box::new(file))
    }
}

fn parse_source(source: &str) -> Result<Program, String> {
    let tokens = Lexer::new(source).lex().map_err(|e| e.to_string())?;
    quill::frontend::parser::Parser::new(tokens)
        .parse()
        .map_err(|e| e.to_string())
}

fn opt_options(names: &[String], mode: LogLevel) -> OptOptions {
    let mut opts = OptOptions::from_names(names);
    opts.debug = mode != LogLevel::Release;
    opts
}

fn execute(func: &Function, mem: usize, mode: LogLevel) -> Result<(), String> {
    func.validate().map_err(|e| e.to_string())?;
    let mut vm = VirtualMachine::new(mem);
    vm.log_level = mode;
    vm.run(func).map(|_| ()).map_err(|e| e.to_string())
}

fn main() {
    let cli = Cli::parse();
    let mode = cli.mode;
    let result = match cli.command {
        Command::Scan(io) => {
            let source = read_input(&io.input);
            source.and_then(|source| {
                let tokens = Lexer::new(&source).lex().map_err(|e| e.to_string())?;
                let mut out = open_output(&io.output)?;
                for token in &tokens {
                    let kind = token.kind_name();
                    let line = if kind == "EOF" {
                        format!("{} EOF", token.line)
                    } else if kind.is_empty() {
                        format!("{} {}", token.line, token.text)
                    } else {
                        format!("{} {} {}", token.line, kind, token.text)
                    };
                    writeln!(out, "{}", line).map_err(|e| e.to_string())?;
                }
                Ok(())
            })
        }
        Command::Parse(io) => read_input(&io.input).and_then(|source| {
            parse_source(&source)?;
            let mut out = open_output(&io.output)?;
            writeln!(out, "Parse successful").map_err(|e| e.to_string())
        }),
        Command::Compile(args) => read_input(&args.io.input).and_then(|source| {
            let program = parse_source(&source)?;
            let mut func = compile::compile_program(&program);
            optimize(&mut func, &opt_options(&args.opt, mode)).map_err(|e| e.to_string())?;
            let mut out = open_output(&args.io.output)?;
            write!(out, "{}", text::print(&func)).map_err(|e| e.to_string())
        }),
        Command::Interpret(io) => read_input(&io.input).and_then(|source| {
            let program = parse_source(&source)?;
            let mut interp = Interpreter::new();
            interp.run(&program).map_err(|e| e.to_string())
        }),
        Command::Vm(args) => read_input(&args.io.input).and_then(|source| {
            let mut func = text::parse(&source).map_err(|e| e.to_string())?;
            func.validate().map_err(|e| e.to_string())?;
            optimize(&mut func, &opt_options(&args.opt, mode)).map_err(|e| e.to_string())?;
            execute(&func, args.mem, mode)
        }),
        Command::Derby(args) => read_input(&args.io.input).and_then(|source| {
            let program = parse_source(&source)?;
            let mut func = compile::compile_program(&program);
            let mut opts = OptOptions::all();
            opts.debug = mode != LogLevel::Release;
            optimize(&mut func, &opts).map_err(|e| e.to_string())?;
            execute(&func, args.mem, mode)
        }),
    };

    if let Err(message) = result {
        eprintln!("{}", message);
        std::process::exit(1);
    }
}
