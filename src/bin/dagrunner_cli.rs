//! CLI harness for the DAG execution engine.
//!
//! Loads `dagrunner.toml` (or defaults), registers an in-memory keyspace
//! plus the mock backend, then executes `DAGRUN`/`DAGRUN_RO` command text
//! read from a file or stdin — one line, one command. This exists so the
//! engine is exercisable end-to-end without a real host key-value store,
//! the way the original is normally only reachable from inside its host
//! server process.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use dagrunner::backend::mock::MockBackend;
use dagrunner::backend::registry::BackendRegistry;
use dagrunner::config::DagConfig;
use dagrunner::engine::Engine;
use dagrunner::keyspace::InMemoryKeyspace;
use dagrunner::parser::DagMode;
use dagrunner::reply::{WireElement, WireReply};

#[derive(Parser)]
#[command(name = "dagrunner-cli")]
#[command(about = "Run DAGRUN/DAGRUN_RO commands against the in-process DAG engine")]
struct Cli {
    /// Path to a dagrunner.toml config file. Defaults are used if absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// File of newline-separated DAG commands. Reads stdin if omitted.
    #[arg(long)]
    script: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DagConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => DagConfig::find_and_load(&std::env::current_dir()?)?,
    };
    if config.verbose {
        eprintln!("[dagrunner-cli] loaded config: threads_per_queue={}", config.threads_per_queue);
    }

    let keyspace = Arc::new(InMemoryKeyspace::new());
    let backends = Arc::new(BackendRegistry::new());
    backends.register(Arc::new(MockBackend));
    if let Some(dir) = &config.backends_path {
        let loaded = backends.load_from_path(std::path::Path::new(dir))?;
        if config.verbose {
            eprintln!("[dagrunner-cli] loaded {loaded} backend plug-in(s) from {dir}");
        }
    }

    let engine = Engine::new(keyspace, backends, config);

    let lines: Box<dyn Iterator<Item = io::Result<String>>> = match &cli.script {
        Some(path) => {
            let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
            Box::new(io::BufReader::new(file).lines())
        }
        None => Box::new(io::stdin().lock().lines()),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in lines {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut tokens: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
        let mode = match tokens.first().map(|t| t.to_ascii_uppercase()) {
            Some(ref t) if t == "DAGRUN" => DagMode::ReadWrite,
            Some(ref t) if t == "DAGRUN_RO" => DagMode::ReadOnly,
            _ => {
                writeln!(out, "ERR unsupported command, expected DAGRUN or DAGRUN_RO")?;
                continue;
            }
        };
        tokens.remove(0);
        let reply = engine.run_dagrun(&tokens, mode);
        writeln!(out, "{}", render(&reply))?;
    }
    Ok(())
}

fn render(reply: &WireReply) -> String {
    match reply {
        WireReply::TimedOut => "TIMEDOUT".to_string(),
        WireReply::FatalError(e) => e.clone(),
        WireReply::Array(elements) => {
            let rendered: Vec<String> = elements.iter().map(render_element).collect();
            if rendered.len() == 1 {
                rendered.into_iter().next().unwrap()
            } else {
                format!("[{}]", rendered.join(", "))
            }
        }
    }
}

fn render_element(element: &WireElement) -> String {
    match element {
        WireElement::Simple(s) => s.clone(),
        WireElement::Error(e) => e.clone(),
        WireElement::NotApplicable => "NA".to_string(),
        WireElement::Tensor(views) => format!("{views:?}"),
    }
}
