use clap::{ArgAction, Parser};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use faultwatch::error::{CanonicalError, FatalPattern};
use faultwatch::logging::{init_logging, LoggingConfig};
use faultwatch::registry::HandlerRegistry;
use faultwatch::runner::{ChildHost, Runner, RunnerConfig};
use faultwatch::scanner::{FlushOutcome, OutputScanner, DEFAULT_GUARD_BYTES};
use faultwatch::settings::{NotifierKind, Settings};

#[derive(Parser, Debug)]
#[command(name = "faultwatch")]
#[command(version)]
#[command(about = "Intercept runtime faults and route them through one handling pipeline")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(long, short, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a program with fault handling around its output
    Run {
        /// Configuration file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Show the debug page instead of the production page
        #[arg(long)]
        debug: bool,

        /// Operator address to notify (repeatable)
        #[arg(long, value_name = "ADDR")]
        notify: Vec<String>,

        /// Notification transport: log or sendmail
        #[arg(long, value_name = "KIND")]
        notifier: Option<NotifierKind>,

        /// Program used by the sendmail transport
        #[arg(long, value_name = "PATH")]
        sendmail_program: Option<String>,

        /// Static page shown to end users in production
        #[arg(long, value_name = "PATH")]
        message_file: Option<PathBuf>,

        /// Program and its arguments
        #[arg(last = true, required = true, value_name = "PROGRAM")]
        command: Vec<String>,
    },
    /// Look for a marker-guarded fatal diagnostic in a file or stdin
    Scan {
        /// Session marker the diagnostic must carry
        #[arg(long)]
        marker: String,

        /// File to scan (defaults to stdin)
        file: Option<PathBuf>,
    },
}

/// Exit codes for the scan command
mod exit_codes {
    use std::process::ExitCode;

    /// A fatal diagnostic was found
    pub fn found() -> ExitCode {
        ExitCode::from(0)
    }

    /// Nothing matched
    pub fn not_found() -> ExitCode {
        ExitCode::from(1)
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(LoggingConfig::from_verbosity(cli.verbose));

    match cli.command {
        Commands::Run {
            config,
            debug,
            notify,
            notifier,
            sendmail_program,
            message_file,
            command,
        } => {
            let mut settings = Settings::load(config.as_deref())?;
            if debug {
                settings.debug = true;
            }
            if !notify.is_empty() {
                settings.notify = notify;
            }
            if notifier.is_some() {
                settings.notifier = notifier;
            }
            if sendmail_program.is_some() {
                settings.sendmail_program = sendmail_program;
            }
            if message_file.is_some() {
                settings.message_file = message_file;
            }

            let Some((program, args)) = command.split_first() else {
                return Err("no program given".into());
            };

            let mut registry = HandlerRegistry::from_settings(ChildHost::new(), &settings)?;
            let runner = Runner::new(RunnerConfig::new(program.as_str()).with_args(args.iter().cloned()));

            let stdout = io::stdout();
            let mut out = stdout.lock();
            let result = runner.run(&mut registry, &mut out)?;

            Ok(ExitCode::from(result.exit_code.clamp(0, 255) as u8))
        }
        Commands::Scan { marker, file } => {
            let bytes = match &file {
                Some(path) => std::fs::read(path)?,
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };

            let pattern = FatalPattern::for_marker(&marker)?;
            let mut scanner = OutputScanner::new(pattern, DEFAULT_GUARD_BYTES);
            let mut found: Option<CanonicalError> = None;
            scanner.scan(&bytes, |error, _| {
                found = Some(error);
                FlushOutcome::Forward
            });

            match found {
                Some(error) => {
                    println!("{}", serde_json::to_string_pretty(&error)?);
                    Ok(exit_codes::found())
                }
                None => {
                    println!("no fatal diagnostic");
                    Ok(exit_codes::not_found())
                }
            }
        }
    }
}
