//! Purpose: `devgate` CLI entry point and command dispatch.
//! Role: Binary crate root; hosts one gate, drives it from worker threads, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: SIGINT/SIGTERM only interrupt blocked opens; held sessions finish their hold.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use devgate::api::{
    Caller, Error, ErrorKind, FsPlatform, GateConfig, Identity, Interrupt, MemoryPlatform,
    Platform, SessionManager, SetupStep, to_errno, to_exit_code,
};
use devgate::record::{SessionRecord, record_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `devgate --help` for usage."));
            }
        },
    };

    init_tracing();

    let config = GateConfig {
        name: cli.name,
        class: cli.class,
        minor_base: cli.minor,
    };
    match cli.dev_dir {
        Some(dir) => dispatch_command(FsPlatform::new(dir), config, cli.command),
        None => dispatch_command(MemoryPlatform::new(), config, cli.command),
    }
}

#[derive(Parser)]
#[command(
    name = "devgate",
    version,
    about = "Exclusive-access device gate",
    long_about = None,
    after_help = r#"EXAMPLES
  $ devgate register
  $ devgate --dev-dir /tmp/devgate run --workers 3 --hold-ms 100
  $ devgate register --fail-at class      # shows rollback of the region

Logging goes to stderr; set RUST_LOG=debug to see each unwound resource."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        help = "Directory for device node files (default: in-memory registry only)",
        value_hint = ValueHint::DirPath
    )]
    dev_dir: Option<PathBuf>,
    #[arg(long, default_value = "customdevice", help = "Device node name")]
    name: String,
    #[arg(long, default_value = "dummy_class", help = "Device class name")]
    class: String,
    #[arg(long, default_value_t = 0, help = "Minor number of the device")]
    minor: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register the device, report its number, then unregister it.
    Register(RegisterArgs),
    /// Open the device from worker threads that each issue a command and hold it.
    Run(RunArgs),
}

#[derive(Args)]
struct RegisterArgs {
    #[arg(long, value_enum, help = "Inject a registration failure at this step")]
    fail_at: Option<StepArg>,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value_t = 2, help = "Number of worker threads")]
    workers: usize,
    #[arg(long, default_value_t = 50, help = "How long each worker holds the device")]
    hold_ms: u64,
    #[arg(long, default_value_t = 0, help = "Command code each worker issues")]
    code: u32,
    #[arg(long, default_value_t = 0, help = "Command argument (ignored by the device)")]
    arg: u64,
    #[arg(long, value_enum, help = "Inject a registration failure at this step")]
    fail_at: Option<StepArg>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StepArg {
    Region,
    Class,
    Binding,
    Node,
}

impl From<StepArg> for SetupStep {
    fn from(step: StepArg) -> Self {
        match step {
            StepArg::Region => SetupStep::Region,
            StepArg::Class => SetupStep::Class,
            StepArg::Binding => SetupStep::Binding,
            StepArg::Node => SetupStep::Node,
        }
    }
}

/// Platforms the CLI can host, all backed by an accounted in-memory registry.
trait Backend: Platform {
    fn memory(&self) -> &MemoryPlatform;
    fn node_path(&self, name: &str) -> Option<PathBuf>;
}

impl Backend for MemoryPlatform {
    fn memory(&self) -> &MemoryPlatform {
        self
    }

    fn node_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

impl Backend for FsPlatform {
    fn memory(&self) -> &MemoryPlatform {
        FsPlatform::memory(self)
    }

    fn node_path(&self, name: &str) -> Option<PathBuf> {
        Some(FsPlatform::node_path(self, name))
    }
}

fn dispatch_command<B: Backend>(
    backend: B,
    config: GateConfig,
    command: Command,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Register(args) => {
            if let Some(step) = args.fail_at {
                backend.memory().fail_at(step.into());
            }
            cmd_register(backend, config)
        }
        Command::Run(args) => {
            if args.workers == 0 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--workers must be at least 1"));
            }
            if let Some(step) = args.fail_at {
                backend.memory().fail_at(step.into());
            }
            cmd_run(backend, config, &args)
        }
    }
}

fn cmd_register<B: Backend>(backend: B, config: GateConfig) -> Result<RunOutcome, Error> {
    let device = config.name.clone();
    let manager = SessionManager::register(backend, config)?;
    let status = manager.status();
    let node = manager.gate().platform().node_path(&device);

    manager.unregister();

    let output = json!({
        "device": device,
        "identity": status.identity,
        "node": node.map(|path| path.display().to_string()),
        "registered": status,
        "unregistered": manager.status(),
        "stats": manager.gate().platform().memory().stats(),
    });
    emit_json(&output)?;
    Ok(RunOutcome::ok())
}

fn cmd_run<B: Backend>(
    backend: B,
    config: GateConfig,
    args: &RunArgs,
) -> Result<RunOutcome, Error> {
    let interrupt = Interrupt::new();
    register_interrupt_signals(&interrupt)?;

    let device = config.name.clone();
    let manager = SessionManager::register(backend, config)?;
    let identity = match manager.gate().platform().node_path(&device) {
        Some(path) => FsPlatform::read_node(&path)?,
        None => manager.identity().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("registered device has no number")
        })?,
    };

    let plan = WorkerPlan {
        device: &device,
        identity,
        hold: Duration::from_millis(args.hold_ms),
        code: args.code,
        arg: args.arg,
    };
    let log = Mutex::new(Vec::new());
    let panicked = thread::scope(|scope| {
        let workers: Vec<_> = (0..args.workers)
            .map(|index| {
                let (manager, interrupt, plan, log) = (&manager, &interrupt, &plan, &log);
                scope.spawn(move || run_worker(manager, index, plan, interrupt, log))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join())
            .filter(Result::is_err)
            .count()
    });

    manager.unregister();
    if panicked > 0 {
        return Err(Error::new(ErrorKind::Internal)
            .with_message(format!("{panicked} worker thread(s) panicked")));
    }

    let records = log.into_inner().unwrap_or_else(PoisonError::into_inner);
    let count = |kind: &str| records.iter().filter(|record| record.kind == kind).count();
    let output = json!({
        "device": device,
        "identity": identity,
        "workers": args.workers,
        "summary": {
            "opened": count("open"),
            "interrupted": count("interrupted"),
            "failed": count("error"),
        },
        "records": records.iter().map(record_json).collect::<Vec<_>>(),
        "unregistered": manager.status(),
        "stats": manager.gate().platform().memory().stats(),
    });
    emit_json(&output)?;
    Ok(RunOutcome::ok())
}

struct WorkerPlan<'a> {
    device: &'a str,
    identity: Identity,
    hold: Duration,
    code: u32,
    arg: u64,
}

fn run_worker<P: Platform>(
    manager: &SessionManager<P>,
    index: usize,
    plan: &WorkerPlan<'_>,
    interrupt: &Interrupt,
    log: &Mutex<Vec<SessionRecord>>,
) {
    let caller = Caller::new(format!("worker-{index}"), std::process::id());
    let push = |kind: &str, message: &str, details: Map<String, Value>| {
        let record = session_record(kind, plan.device, &caller, message, details);
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    };

    let handle = match manager.on_open(plan.identity, caller.clone(), interrupt) {
        Ok(handle) => {
            push("open", "device opened", Map::new());
            handle
        }
        Err(err) => {
            let kind = if err.kind() == ErrorKind::Interrupted {
                "interrupted"
            } else {
                "error"
            };
            push(kind, &error_message(&err), error_details(&err));
            return;
        }
    };

    match manager.on_command(handle, plan.code, plan.arg) {
        Ok(result) => {
            let mut details = Map::new();
            details.insert("code".to_string(), json!(plan.code));
            details.insert("result".to_string(), json!(result));
            push("command", "command issued", details);
        }
        Err(err) => push("error", &error_message(&err), error_details(&err)),
    }

    thread::sleep(plan.hold);

    match manager.on_close(handle) {
        Ok(()) => push("close", "device released", Map::new()),
        Err(err) => push("error", &error_message(&err), error_details(&err)),
    }
}

fn session_record(
    kind: &str,
    device: &str,
    caller: &Caller,
    message: &str,
    details: Map<String, Value>,
) -> SessionRecord {
    SessionRecord {
        kind: kind.to_string(),
        time: time_now().unwrap_or_default(),
        device: device.to_string(),
        comm: caller.comm.clone(),
        pid: caller.pid,
        message: message.to_string(),
        details,
    }
}

fn register_interrupt_signals(interrupt: &Interrupt) -> Result<(), Error> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, interrupt.flag()).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to install signal handler")
                .with_source(err)
        })?;
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn time_now() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    println!("{text}");
    Ok(())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    err.message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", err.kind()))
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        causes.push(source.to_string());
        current = source.source();
    }
    causes
}

fn error_details(err: &Error) -> Map<String, Value> {
    let mut details = Map::new();
    details.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    details.insert("errno".to_string(), json!(to_errno(err.kind())));
    if let Some(identity) = err.identity() {
        details.insert("identity".to_string(), json!(identity.to_string()));
    }
    details
}

fn error_json(err: &Error) -> Value {
    let mut inner = error_details(err);
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(step) = err.step() {
        inner.insert("step".to_string(), json!(step.as_str()));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(step) = err.step() {
        lines.push(format!("step: {step}"));
    }
    if let Some(identity) = err.identity() {
        lines.push(format!("device: {identity}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error:").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}
