use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tinylisp::{Config, Machine};

/// A small Lisp with a bounded arena and a mark-and-sweep collector.
#[derive(Parser, Debug)]
#[command(name = "tinylisp", version)]
struct Args {
    /// Source files to load, in order, before anything else
    files: Vec<PathBuf>,

    /// Evaluate an expression, print its value and exit (repeatable)
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    eval: Vec<String>,

    /// Arena capacity in records
    #[arg(long, env = "TINYLISP_CAPACITY", value_name = "N")]
    capacity: Option<usize>,

    /// Collect once this percentage of the arena is live
    #[arg(long, value_name = "PERCENT")]
    gc_threshold: Option<usize>,

    /// Maximum evaluation frame depth (at most 2048)
    #[arg(long, env = "TINYLISP_MAX_FRAMES", value_name = "N")]
    max_frames: Option<usize>,

    /// Reject calls with the wrong number of arguments
    #[arg(long, env = "TINYLISP_STRICT_ARITY")]
    strict_arity: bool,

    /// Start from the small-target limits
    #[arg(long)]
    embedded: bool,

    /// Log collections and other internals to stderr
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = if self.embedded {
            Config::embedded()
        } else {
            Config::default()
        };
        if let Some(n) = self.capacity {
            config.arena_capacity = n;
        }
        if let Some(p) = self.gc_threshold {
            config.gc_threshold_percent = p;
        }
        if let Some(n) = self.max_frames {
            config.max_frames = n;
        }
        config.strict_arity |= self.strict_arity;
        config
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    run(args)
}

fn run(args: Args) -> Result<()> {
    let config = args.config();
    debug!(?config, "configuration");
    let mut machine = Machine::new(config).context("cannot start interpreter")?;

    for path in &args.files {
        load_file(&mut machine, path)?;
    }

    if !args.eval.is_empty() {
        for expr in &args.eval {
            evaluate_all(&mut machine, expr, true)?;
        }
        return Ok(());
    }

    if io::stdin().is_terminal() {
        run_interactive(&mut machine)
    } else {
        run_piped(&mut machine)
    }
}

/// Load a source file silently, one expression at a time.
fn load_file(machine: &mut Machine, path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    info!(path = %path.display(), "loading");
    evaluate_all(machine, &text, false)
        .with_context(|| format!("while loading {}", path.display()))
}

/// Evaluate every expression in `text`, printing each value if `echo`.
/// Fatal errors end the session; the rest are reported and skipped.
fn evaluate_all(machine: &mut Machine, text: &str, echo: bool) -> Result<()> {
    let mut pos = 0;
    loop {
        let (expr, next) = machine.read_next(text, pos)?;
        let Some(expr) = expr else {
            break;
        };
        pos = next;
        match machine.eval(expr) {
            Ok(val) => {
                if echo {
                    machine.print(val)?;
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                machine.flush();
                eprintln!("Error: {}", e);
            }
        }
    }
    machine.flush();
    Ok(())
}

/// REPL with line editing. Lines accumulate until parentheses balance.
fn run_interactive(machine: &mut Machine) -> Result<()> {
    println!(
        "tinylisp {} ({} records, {} live)",
        env!("CARGO_PKG_VERSION"),
        machine.heap.capacity(),
        machine.heap.live_count()
    );

    let mut rl = DefaultEditor::new().context("cannot start line editor")?;
    let mut buf = String::new();

    loop {
        let prompt = if buf.is_empty() { "> " } else { "  " };
        match rl.readline(prompt) {
            Ok(line) => {
                buf.push_str(&line);
                buf.push('\n');
                if paren_depth(&buf) > 0 {
                    continue;
                }
                let input = std::mem::take(&mut buf);
                let input = input.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);
                evaluate_all(machine, input, true)?;
            }
            Err(ReadlineError::Interrupted) => buf.clear(),
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("line editor failed"),
        }
    }
    Ok(())
}

/// Piped mode: read all of stdin, then evaluate it one expression at a time.
fn run_piped(machine: &mut Machine) -> Result<()> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("cannot read standard input")?;
    evaluate_all(machine, &input, true)
}

/// Open parentheses minus closed ones, ignoring strings and comments.
fn paren_depth(text: &str) -> i64 {
    let mut depth = 0;
    let mut in_string = false;
    let mut in_comment = false;
    for ch in text.chars() {
        match ch {
            '\n' => in_comment = false,
            _ if in_comment => {}
            '"' => in_string = !in_string,
            _ if in_string => {}
            ';' => in_comment = true,
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    depth
}
