mod config;
mod control;
mod daemon;
mod error;
mod executor;
mod identity;
mod instruction;
mod pipes;
mod runner;
mod transport;

use anyhow::{anyhow, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::control::ControlPlane;
use crate::daemon::{conclude, Daemon};
use crate::identity::IdentityAllocator;
use crate::pipes::PipeResolver;
use crate::runner::RunnerSpec;
use crate::transport::source::spawn_reader;

/// Exit code for fatal setup and security errors.
const FATAL_EXIT_CODE: i32 = 1;

fn print_help() {
    println!(
        "\
sandbox-executor v{}

Runs allowlisted runners under sequentially allocated uid/gid pairs.
Reads one JSON instruction per line and answers each executed
instruction with a single status byte (0 success, 1 failure,
2 anomalous success).

USAGE:
    sandbox-executor [OPTIONS] [CONFIG_PATH] [-- PREFIX...]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: built-in settings]
    PREFIX...      Fixed arguments inserted before every caller command

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and configuration, then exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, written to stderr
                (e.g. debug, sandbox_executor=debug,warn)

EXAMPLES:
    sandbox-executor                                   # stdin/stdout, built-in settings
    sandbox-executor /etc/sandbox-executor.toml        # custom config path
    sandbox-executor executor.toml -- /usr/bin/nice    # prefix every command",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Command line as scanned by hand: flags, an optional config path and
/// everything after `--`.
#[derive(Debug, Default, PartialEq)]
struct Args {
    help: bool,
    version: bool,
    config_path: Option<String>,
    prefix: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => parsed.version = true,
            "--help" | "-h" => parsed.help = true,
            "--" => {
                parsed.prefix = args.by_ref().collect();
                break;
            }
            flag if flag.starts_with('-') => return Err(anyhow!("unknown option {flag}")),
            path => {
                if parsed.config_path.replace(path.to_string()).is_some() {
                    return Err(anyhow!("more than one config path given"));
                }
            }
        }
    }
    Ok(parsed)
}

fn version_banner(config: &Config) -> String {
    let mut banner = format!(
        "sandbox-executor v{}\nCONFIGURED WITH\n\
         min uid: {}\n\
         min gid: {}\n\
         max uid: {}\n\
         runner config flag: {}\n\
         runner config prefix: {}\n\
         runner additional flag: {}\n\
         runner environment flag: {}\n\
         runner memory flag: {}\n\
         source: {}\n\
         Configured Runners:\n",
        env!("CARGO_PKG_VERSION"),
        config.identity.starting_uid,
        config.identity.starting_gid,
        config.identity.max_uid,
        config.runner.config_flag,
        config.runner.config_prefix,
        config.runner.additional_flag,
        config.runner.environment_flag,
        config.runner.memory_flag,
        config.source.description(),
    );
    for path in config.runner_paths() {
        banner.push_str(&path);
        banner.push('\n');
    }
    banner
}

#[tokio::main]
async fn main() {
    // Blocked FIFO opens live on detached threads, so leave through
    // process::exit rather than waiting for the runtime to wind down.
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {e:#}");
            eprintln!("sandbox-executor: {e:#}");
            FATAL_EXIT_CODE
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(0);
    }

    // Initialize logging (RUST_LOG=debug for debug mode). Stdout may be
    // the result channel, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandbox_executor=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config_path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None => Config::default(),
    };

    if args.version {
        print!("{}", version_banner(&config));
        return Ok(0);
    }

    info!(
        "Identities: uid {} gid {} up to uid {}",
        config.identity.starting_uid, config.identity.starting_gid, config.identity.max_uid
    );
    info!("Runners: {}", config.runner_paths().join(", "));
    info!("Instruction source: {}", config.source.description());
    if let Some(mode) = config.pipes.expected_mode {
        info!("Stdio endpoints must have mode {mode:o}");
    }
    if !args.prefix.is_empty() {
        info!("Command prefix: {:?}", args.prefix);
    }

    let transport = transport::open(&config.source)?;
    let control = ControlPlane::start(&config.control, transport.abort_pipe());
    let mailbox = transport.mailbox.clone();
    let records = spawn_reader(transport.source);

    let mut daemon = Daemon::new(
        IdentityAllocator::new(&config.identity),
        RunnerSpec::new(config.runner.clone(), args.prefix),
        PipeResolver::new(config.pipes.expected_mode),
        transport.reporter,
        control,
    );

    let stop = daemon.run(records).await?;
    let last = daemon.identity();
    info!("Last identity: uid {} gid {}", last.uid, last.gid);
    Ok(conclude(stop, mailbox.as_ref(), config.control.abort_exit_code))
}
