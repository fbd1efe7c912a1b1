use clap::Parser;
use job_router::{
    clock::SystemClock,
    config::{ConfigErrors, RouterConfig},
    matching::PredicateMatcher,
    queue::{JobQueue, SpoolQueue},
    transform::GridTransform,
    Collaborators, JobRouter, RouterContext,
};
use nix::sys::signal::{signal, SigHandler, Signal};
use std::{
    env,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

static STOP: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop(_: i32) {
    STOP.store(true, Ordering::SeqCst);
}

extern "C" fn on_reload(_: i32) {
    RELOAD.store(true, Ordering::SeqCst);
}

#[derive(Parser, Debug)]
#[command(name = "job-router")]
#[command(about = "Routes idle jobs of a queue to remote resources", long_about = None)]
#[command(version)]
struct Cli {
    /// Router configuration (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Poll once and exit
    #[arg(long)]
    once: bool,

    /// Directory for the instance lock, overrides lock_dir from the config
    #[arg(long)]
    lock_dir: Option<PathBuf>,
}

fn load_config(path: &PathBuf) -> Result<RouterConfig, ConfigErrors> {
    let mut config = RouterConfig::load(path)?;

    if config.preflight_checks() {
        return Err(ConfigErrors::PreflightFailed);
    }

    Ok(config)
}

fn open_queues(config: &RouterConfig) -> Option<(Arc<dyn JobQueue>, Arc<dyn JobQueue>)> {
    let Some(ref spool) = config.queue else {
        error!("No queue configured, set queue.source in the config");
        return None;
    };

    let source: Arc<dyn JobQueue> = match SpoolQueue::open(&spool.source) {
        Ok(queue) => Arc::new(queue),
        Err(error) => {
            error!(error = ?error, "Failed to open source queue {}: {error}", spool.source.to_string_lossy());
            return None;
        }
    };
    let destination: Arc<dyn JobQueue> = match spool.destination {
        Some(ref path) => match SpoolQueue::open(path) {
            Ok(queue) => Arc::new(queue),
            Err(error) => {
                error!(error = ?error, "Failed to open destination queue {}: {error}", path.to_string_lossy());
                return None;
            }
        },
        None => source.clone(),
    };

    Some((source, destination))
}

fn install_signal_handlers() {
    let handlers = [
        (Signal::SIGTERM, SigHandler::Handler(on_stop)),
        (Signal::SIGINT, SigHandler::Handler(on_stop)),
        (Signal::SIGHUP, SigHandler::Handler(on_reload)),
    ];

    for (sig, handler) in handlers {
        // handlers only store to atomics
        if let Err(error) = unsafe { signal(sig, handler) } {
            warn!(error = ?error, "Failed to install handler for {sig}: {error}");
        }
    }
}

/// `RUST_LOG` if it parses, `info` otherwise
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(
            env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
        ))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config).unwrap_or_log();

    let Some((source, destination)) = open_queues(&config) else {
        process::exit(1);
    };

    let mut router = JobRouter::new(
        RouterContext::from_system(),
        Collaborators {
            source,
            destination,
            matcher: Box::new(PredicateMatcher),
            transform: Box::new(GridTransform),
            clock: Arc::new(SystemClock),
        },
    );
    router.config(&config);

    let lock_dir = cli.lock_dir.unwrap_or_else(|| config.lock_dir.clone());
    if let Err(error) = router.get_instance_lock(&lock_dir) {
        error!(error = ?error, "JobRouter: cannot acquire instance lock: {error}");
        process::exit(1);
    }

    install_signal_handlers();
    info!(name = %router.name(), "JobRouter: started");

    loop {
        router.poll();

        if cli.once {
            break;
        }

        // sleep in small steps so signals are noticed between polls
        for _ in 0..router.polling_period() {
            if STOP.load(Ordering::SeqCst) || RELOAD.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }

        if STOP.load(Ordering::SeqCst) {
            break;
        }
        if RELOAD.swap(false, Ordering::SeqCst) {
            match load_config(&cli.config) {
                Ok(reloaded) => {
                    config = reloaded;
                    if router.config(&config) {
                        info!(
                            "JobRouter: polling period changed to {} seconds",
                            router.polling_period()
                        );
                    }
                }
                Err(error) => {
                    error!(error = ?error, "JobRouter: keeping the previous configuration: {error}")
                }
            }
        } else {
            router.refresh_entries(&config);
        }
    }

    router.shutdown();
    info!("JobRouter: stopped");
}
