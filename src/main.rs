//! Terrarium - an in-page bundler core
//!
//! The CLI compiles a project directory the way an embedding host
//! would: files are loaded into the virtual FS, the bundler runs one
//! compile request, statuses and console output are printed as they
//! are emitted.

use clap::Parser;
use colored::Colorize;
use miette::{miette, IntoDiagnostic, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use terrarium::{
    Bundler, BundlerConfig, CompileRequest, Emitter, OutboundMessage, Status,
};

#[derive(Parser)]
#[command(name = "terrarium")]
#[command(version, about = "Compile and evaluate a small web project the way the in-page bundler does")]
struct Cli {
    /// Project directory to compile
    dir: PathBuf,

    /// Preset template (vanilla, react)
    #[arg(short, long, default_value = "vanilla")]
    template: String,

    /// Print each transpiled module after compilation
    #[arg(long)]
    print_modules: bool,

    /// Log filter, e.g. "terrarium=debug"
    #[arg(long, default_value = "warn")]
    log: String,
}

/// Emitter that renders protocol messages for a terminal.
struct TerminalEmitter;

impl Emitter for TerminalEmitter {
    fn emit(&self, message: OutboundMessage) {
        match message {
            OutboundMessage::Status { status } => {
                let label = match status {
                    Status::Initializing => "initializing",
                    Status::InstallingDependencies => "installing dependencies",
                    Status::Transpiling => "transpiling",
                    Status::Evaluating => "evaluating",
                    Status::Done => "done",
                    Status::Error => "error",
                };
                eprintln!("{} {}", "status".dimmed(), label.cyan());
            }
            OutboundMessage::Console { log, result } => {
                if let Some(records) = log {
                    for record in records {
                        let line = record.data.join(" ");
                        match record.method.as_str() {
                            "error" => println!("{}", line.red()),
                            "warn" => println!("{}", line.yellow()),
                            _ => println!("{line}"),
                        }
                    }
                }
                if let Some(result) = result {
                    println!("{} {result}", "=".dimmed());
                }
            }
            OutboundMessage::Action {
                title,
                path,
                message,
                ..
            } => {
                eprintln!("{} {} ({})", title.red().bold(), message, path.dimmed());
            }
            OutboundMessage::Refresh => eprintln!("{}", "full reload".yellow()),
            _ => {}
        }
    }
}

/// Collect project files into absolute virtual paths.
fn load_files(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).into_diagnostic()? {
            let entry = entry.into_diagnostic()?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if path.is_dir() {
                if name == "node_modules" || name == ".git" || name == "target" || name == "dist" {
                    continue;
                }
                stack.push(path);
                continue;
            }

            let Ok(content) = std::fs::read_to_string(&path) else {
                continue; // binary asset
            };
            let relative = path
                .strip_prefix(root)
                .into_diagnostic()?
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(format!("/{relative}"), content);
        }
    }

    Ok(files)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if !cli.dir.is_dir() {
        return Err(miette!("{} is not a directory", cli.dir.display()));
    }

    let files = load_files(&cli.dir)?;
    if files.is_empty() {
        eprintln!("{}", "no files found; nothing to compile".yellow());
        return Ok(());
    }

    let mut request = CompileRequest::new(&cli.template);
    request.files = files;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    let bundler = Bundler::new(BundlerConfig::default(), Rc::new(TerminalEmitter))
        .map_err(|e| miette!("{e}"))?;

    let summary = runtime
        .block_on(bundler.compile(request))
        .map_err(|e| miette!("{e}"))?;

    match &summary.entry {
        Some(entry) => eprintln!("{} {}", "entry".dimmed(), entry.green()),
        None => eprintln!("{}", "no JS entry (static page)".dimmed()),
    }

    if cli.print_modules {
        let graph = bundler.graph();
        let mut paths = graph.paths();
        paths.sort();
        for path in paths {
            let Some(module) = graph.get(&path) else { continue };
            let module = module.borrow();
            if let Some(compiled) = &module.compiled {
                println!("{}", format!("=== {path} ===").bold());
                println!("{compiled}");
            }
        }
    }

    Ok(())
}
