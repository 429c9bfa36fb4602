use std::{error::Error, process, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use apconnect::{
    config::{Config, DEFAULT_PORT},
    session::Session,
    token::FileTokenProvider,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// TOML file with the bearer `token` used for authenticated requests.
    /// Keep it private: the token grants access to your account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"), env = "APCONNECT_SECRETS_FILE")]
    secrets_file: String,

    /// Access point host name
    #[arg(short, long, value_hint = ValueHint::Hostname, env = "APCONNECT_ACCESS_POINT")]
    access_point: String,

    /// Access point port
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "APCONNECT_PORT")]
    port: u16,

    /// Device name
    ///
    /// Set the device name as it appears to other clients.
    ///
    /// [default: system hostname]
    #[arg(short, long, value_hint = ValueHint::Hostname, env = "APCONNECT_NAME")]
    name: Option<String>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Main application loop.
///
/// Restarts the session whenever it terminates, until interrupted.
///
/// # Errors
///
/// Returns an error when the secrets file cannot be used.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let provider = FileTokenProvider::new(&args.secrets_file);

    let mut config = Config::with_access_point(args.access_point);
    config.port = args.port;
    config.device_name = args
        .name
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| config.app_name.clone());

    let mut session = Session::new(config, provider);

    // Restart after sleeping some duration to not hammer the access point.
    // The initial connection happens immediately.
    let restart_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(restart_timer);

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                session.stop().await;
                break Ok(())
            }

            result = session.start(), if restart_timer.is_elapsed() => {
                if let Err(e) = result {
                    error!("{e}");
                    if e.kind == apconnect::error::ErrorKind::NotFound {
                        info!("put your token in {}", args.secrets_file);
                    }
                }

                // Sleep with jitter to prevent thundering herds.
                let duration = Duration::from_millis(fastrand::u64(5_000..6_000));
                info!("restarting in {:.1}s", duration.as_secs_f32());
                restart_timer.as_mut().reset(tokio::time::Instant::now() + duration);
            }

            () = &mut restart_timer, if !restart_timer.is_elapsed() => {}
        }
    }
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
