//! `hal-shell` - interactive front end for quantum backends.
//!
//! ## Commands
//!
//! - `shell`: interactive prompt (the default)
//! - `run`: execute one module and print the result
//! - `bench`: run a benchmark spec and print (or save) the report

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, debug, info};

use hal_shell::benchmark::{BenchmarkSpec, Orchestrator};
use hal_shell::config::ShellConfig;
use hal_shell::dispatcher::{Dispatcher, RetryPolicy};
use hal_shell::error::{ShellError, ShellResult};
use hal_shell::local::builtin_backends;
use hal_shell::registry::ModuleRegistry;
use hal_shell::session::Session;
use hal_shell::shell::{self, EXIT_ERROR, EXIT_OK, Shell};
use hal_shell::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "hal-shell")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Configure and run quantum modules against local and remote backends", long_about = None)]
struct Cli {
    /// Configuration file (default: ./hal-shell.toml if present)
    #[arg(short, long, global = true, env = "HAL_SHELL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive prompt
    Shell,

    /// Run a single module
    Run {
        /// Module id
        module: String,

        /// Option assignment, repeatable
        #[arg(short, long = "set", value_name = "NAME=VALUE")]
        options: Vec<String>,

        /// Backend id (default: configured default_backend, else "local")
        #[arg(short, long)]
        backend: Option<String>,

        /// Shot count (default: configured default_shots)
        #[arg(short, long)]
        shots: Option<u32>,
    },

    /// Run a benchmark spec (JSON)
    Bench {
        /// Path to the benchmark spec
        spec: PathBuf,

        /// Write the JSON report here instead of printing a table
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

struct App {
    config: ShellConfig,
    registry: Arc<ModuleRegistry>,
    dispatcher: Dispatcher,
}

impl App {
    fn new(config: ShellConfig) -> Result<Self> {
        let registry = ModuleRegistry::with_builtins().context("module registry is inconsistent")?;
        let backends = builtin_backends().context("failed to set up backends")?;
        let dispatcher =
            Dispatcher::new(Arc::new(backends)).with_retry(RetryPolicy::from(&config.retry));
        info!(
            modules = registry.len(),
            backends = dispatcher.backends().len(),
            "hal-shell ready"
        );
        Ok(Self {
            config,
            registry: Arc::new(registry),
            dispatcher,
        })
    }

    fn session(&self) -> Session {
        let mut config = self.config.clone();
        if config.default_backend.is_none() {
            config.default_backend = Some("local".to_string());
        }
        Session::new(Arc::clone(&self.registry), self.dispatcher.clone(), &config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json_logs, level);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_ERROR as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let config = ShellConfig::discover(cli.config.as_deref(), &cwd)
        .context("failed to load configuration")?;
    let app = App::new(config)?;

    let code = match cli.command.unwrap_or(Commands::Shell) {
        Commands::Shell => repl(&app).await?,
        Commands::Run {
            module,
            options,
            backend,
            shots,
        } => run_once(&app, &module, &options, backend.as_deref(), shots).await?,
        Commands::Bench { spec, out } => bench(&app, &spec, out.as_deref()).await?,
    };
    Ok(u8::try_from(code).unwrap_or(1))
}

async fn repl(app: &App) -> Result<i32> {
    let session = app.session();
    let shell = Shell::new(&session);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();
    let mut last = EXIT_OK;

    loop {
        write!(stdout, "{}", shell.prompt())?;
        stdout.flush()?;
        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            writeln!(stdout)?;
            break;
        };
        let outcome = shell.execute_line(&line, &mut stdout).await?;
        last = outcome.exit_code;
        if outcome.quit {
            break;
        }
    }
    debug!(runs = session.history().len(), "leaving shell");
    Ok(last)
}

async fn run_once(
    app: &App,
    module: &str,
    options: &[String],
    backend: Option<&str>,
    shots: Option<u32>,
) -> Result<i32> {
    let session = app.session();
    let mut stdout = std::io::stdout();

    let setup = (|| -> ShellResult<()> {
        session.select_module(module)?;
        for assignment in options {
            let Some((name, value)) = assignment.split_once('=') else {
                return Err(ShellError::Usage(format!(
                    "expected NAME=VALUE, got '{assignment}'"
                )));
            };
            session.set_option(name.trim(), value.trim())?;
        }
        if let Some(backend) = backend {
            session.set_backend(backend)?;
        }
        if let Some(shots) = shots {
            session.set_shots(shots)?;
        }
        Ok(())
    })();
    if let Err(err) = setup {
        writeln!(stdout, "[-] {err}")?;
        return Ok(shell::exit_code_for(&err));
    }

    match session.run().await {
        Ok(result) => {
            shell::render_result(&result, &mut stdout)?;
            Ok(if result.is_success() { EXIT_OK } else { EXIT_ERROR })
        }
        Err(err) => {
            writeln!(stdout, "[-] {err}")?;
            Ok(shell::exit_code_for(&err))
        }
    }
}

async fn bench(app: &App, spec_path: &Path, out: Option<&Path>) -> Result<i32> {
    let spec = BenchmarkSpec::load(spec_path)
        .with_context(|| format!("failed to load benchmark spec {}", spec_path.display()))?;
    if spec.pairs.is_empty() {
        bail!("benchmark spec has no pairs");
    }

    let orchestrator =
        Orchestrator::from_config(Arc::clone(&app.registry), app.dispatcher.clone(), &app.config);
    let report = orchestrator.run(&spec).await.context("benchmark failed")?;

    match out {
        Some(path) => {
            report
                .save(path)
                .with_context(|| format!("failed to write report {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => print!("{report}"),
    }
    Ok(EXIT_OK)
}
