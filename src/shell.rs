//! Interactive command surface.
//!
//! Each command maps onto one [`Session`] operation:
//!
//! | Command | Session call |
//! |---------|--------------|
//! | `use <module>` | `select_module` |
//! | `set <option> <value>` | `set_option` (`BACKEND`/`SHOTS` go to `set_backend`/`set_shots`) |
//! | `unset <option>` | `unset_option` |
//! | `show options\|modules\|backends\|history` | read-only listings |
//! | `run` | `run` |
//! | `back` | `back` |
//!
//! Exit codes: [`EXIT_OK`] on success, [`EXIT_ERROR`] on validation errors
//! or a run that did not succeed, [`EXIT_BUSY`] when a run is in flight.

use std::io::{self, Write};

use crate::error::{ShellError, ShellResult};
use crate::result::ExecutionResult;
use crate::session::Session;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_BUSY: i32 = 2;

const HELP: &str = "\
commands:
  use <module>            select a module
  set <option> <value>    set an option (BACKEND and SHOTS are session-wide)
  unset <option>          clear an option back to its default
  show options            options of the current module
  show modules            registered modules
  show backends           configured backends
  show history            past runs
  run                     validate and execute the current module
  back                    deselect the current module
  exit                    leave the shell";

/// What to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    Options,
    Modules,
    Backends,
    History,
}

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Use(String),
    Set { name: String, value: String },
    Unset(String),
    Show(Listing),
    Run,
    Back,
    Help,
    Exit,
    /// Blank line or comment.
    Nothing,
}

impl Command {
    /// Parse one input line. `#` starts a comment.
    pub fn parse(line: &str) -> ShellResult<Self> {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(Command::Nothing);
        }
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(w, r)| (w, r.trim()));

        let usage = |msg: &str| Err(ShellError::Usage(msg.to_string()));
        match word.to_ascii_lowercase().as_str() {
            "use" if !rest.is_empty() && !rest.contains(char::is_whitespace) => {
                Ok(Command::Use(rest.to_string()))
            }
            "use" => usage("use <module>"),
            "set" => match rest.split_once(char::is_whitespace) {
                Some((name, value)) if !value.trim().is_empty() => Ok(Command::Set {
                    name: name.to_string(),
                    value: unquote(value.trim()).to_string(),
                }),
                _ => usage("set <option> <value>"),
            },
            "unset" if !rest.is_empty() => Ok(Command::Unset(rest.to_string())),
            "unset" => usage("unset <option>"),
            "show" => match rest.to_ascii_lowercase().as_str() {
                "options" | "" => Ok(Command::Show(Listing::Options)),
                "modules" => Ok(Command::Show(Listing::Modules)),
                "backends" => Ok(Command::Show(Listing::Backends)),
                "history" => Ok(Command::Show(Listing::History)),
                _ => usage("show options|modules|backends|history"),
            },
            "run" if rest.is_empty() => Ok(Command::Run),
            "back" if rest.is_empty() => Ok(Command::Back),
            "help" | "?" => Ok(Command::Help),
            "exit" | "quit" => Ok(Command::Exit),
            _ => Err(ShellError::Usage(format!(
                "unknown command '{line}', try 'help'"
            ))),
        }
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Result of executing one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub exit_code: i32,
    /// The user asked to leave.
    pub quit: bool,
}

impl Outcome {
    fn ok() -> Self {
        Self {
            exit_code: EXIT_OK,
            quit: false,
        }
    }

    fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            quit: false,
        }
    }
}

/// Exit code for a local error.
pub fn exit_code_for(err: &ShellError) -> i32 {
    match err {
        ShellError::Busy => EXIT_BUSY,
        _ => EXIT_ERROR,
    }
}

/// Executes parsed commands against a session and renders output.
pub struct Shell<'a> {
    session: &'a Session,
}

impl<'a> Shell<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Prompt reflecting the selected module.
    pub fn prompt(&self) -> String {
        match self.session.current_module() {
            Some(module) => format!("hal-shell({module})> "),
            None => "hal-shell> ".to_string(),
        }
    }

    /// Parse and execute one line, writing output to `out`.
    pub async fn execute_line(&self, line: &str, out: &mut dyn Write) -> io::Result<Outcome> {
        match Command::parse(line) {
            Ok(cmd) => self.execute(cmd, out).await,
            Err(err) => {
                report_error(&err, out)?;
                Ok(Outcome::code(exit_code_for(&err)))
            }
        }
    }

    pub async fn execute(&self, cmd: Command, out: &mut dyn Write) -> io::Result<Outcome> {
        let result = match cmd {
            Command::Nothing => Ok(()),
            Command::Help => writeln!(out, "{HELP}").map_err(ShellError::from),
            Command::Exit => {
                return Ok(Outcome {
                    exit_code: EXIT_OK,
                    quit: true,
                });
            }
            Command::Use(module) => self
                .session
                .select_module(&module)
                .and_then(|()| writeln!(out, "[*] using {module}").map_err(ShellError::from)),
            Command::Set { name, value } => self.set(&name, &value, out),
            Command::Unset(name) => self.session.unset_option(&name),
            Command::Back => self.session.back(),
            Command::Show(listing) => self.show(listing, out),
            Command::Run => return self.run(out).await,
        };

        match result {
            Ok(()) => Ok(Outcome::ok()),
            Err(ShellError::Io(err)) => Err(err),
            Err(err) => {
                report_error(&err, out)?;
                Ok(Outcome::code(exit_code_for(&err)))
            }
        }
    }

    fn set(&self, name: &str, value: &str, out: &mut dyn Write) -> ShellResult<()> {
        if name.eq_ignore_ascii_case("BACKEND") {
            self.session.set_backend(value)?;
        } else if name.eq_ignore_ascii_case("SHOTS") {
            let shots: u32 = value
                .parse()
                .map_err(|_| ShellError::Usage(format!("SHOTS expects a positive integer, got '{value}'")))?;
            self.session.set_shots(shots)?;
        } else {
            self.session.set_option(name, value)?;
        }
        writeln!(out, "{name} => {value}")?;
        Ok(())
    }

    fn show(&self, listing: Listing, out: &mut dyn Write) -> ShellResult<()> {
        match listing {
            Listing::Options => {
                let rows = self.session.show_options()?;
                writeln!(out, "  {:<12} {:<20} {:<8} {:<16} description", "name", "type", "required", "current")?;
                for row in rows {
                    writeln!(
                        out,
                        "  {:<12} {:<20} {:<8} {:<16} {}",
                        row.name,
                        row.kind,
                        if row.required { "yes" } else { "no" },
                        row.current.as_deref().unwrap_or("-"),
                        row.description
                    )?;
                }
                writeln!(
                    out,
                    "  BACKEND = {}, SHOTS = {}",
                    self.session.backend().as_deref().unwrap_or("-"),
                    self.session.shots()
                )?;
            }
            Listing::Modules => {
                for summary in self.session.registry().list() {
                    writeln!(out, "  {:<16} {}", summary.id, summary.description)?;
                }
            }
            Listing::Backends => {
                for desc in self.session.dispatcher().backends().descriptors() {
                    writeln!(
                        out,
                        "  {:<16} {:<18} qubits={:<4} shots={:<7} parallel={}",
                        desc.id,
                        desc.kind.to_string(),
                        desc.limits.max_qubits,
                        desc.limits.max_shots,
                        desc.limits.max_parallel_circuits
                    )?;
                }
            }
            Listing::History => {
                for (i, entry) in self.session.history().iter().enumerate() {
                    writeln!(
                        out,
                        "  #{i:<3} {} {:<10} on {:<12} {:>8.2} ms",
                        entry.finished_at.format("%H:%M:%S"),
                        entry.module_id,
                        entry.backend_id,
                        entry.result.duration().as_secs_f64() * 1e3,
                    )?;
                    writeln!(out, "       {}", entry.result.status())?;
                }
            }
        }
        Ok(())
    }

    async fn run(&self, out: &mut dyn Write) -> io::Result<Outcome> {
        match self.session.run().await {
            Ok(result) => {
                render_result(&result, out)?;
                Ok(Outcome::code(if result.is_success() {
                    EXIT_OK
                } else {
                    EXIT_ERROR
                }))
            }
            Err(err) => {
                report_error(&err, out)?;
                Ok(Outcome::code(exit_code_for(&err)))
            }
        }
    }
}

/// Print a command error, with a pointer to the option at fault if any.
fn report_error(err: &ShellError, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "[-] {err}")?;
    if let ShellError::Validation(invalid) = err {
        if let Some(name) = invalid.option_name() {
            writeln!(out, "    hint: `show options` lists the accepted values for {name}")?;
        }
    }
    Ok(())
}

/// Human-readable summary of a result.
pub fn render_result(result: &ExecutionResult, out: &mut dyn Write) -> io::Result<()> {
    let marker = if result.is_success() { "[+]" } else { "[-]" };
    writeln!(
        out,
        "{marker} {} on {}: {} in {:.2} ms",
        result.module_id(),
        result.backend_id(),
        result.status(),
        result.duration().as_secs_f64() * 1e3
    )?;
    if let Some(job) = result.job_id() {
        writeln!(out, "    job: {job}")?;
    }
    if let Some(err) = result.error() {
        writeln!(out, "    error: {}", err.message)?;
    }
    if let Some(payload) = result.payload() {
        if let Some((bits, _)) = payload.counts.most_frequent() {
            writeln!(out, "    most frequent: {bits}")?;
        }
        let probabilities = payload.probabilities();
        for (bits, count) in payload.counts.sorted().into_iter().take(8) {
            let p = probabilities.get(bits).copied().unwrap_or(0.0);
            writeln!(out, "    {bits}: {count} ({p:.3})")?;
        }
    }
    Ok(())
}
