use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, sync::Arc};

use clap::Parser;
use dotter::{
    config::{self, Config, Mode, Telemetry},
    control::{self, Control},
    counter::LineCounter,
    emitter::{self, Sink, WriterSink},
    logging::{self, Rotation},
    scheduler::{self, MAX_BURST_SIZE, Scheduler},
};
use jemallocator::Jemalloc;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    task::JoinSet,
    time::{self, Duration},
};
use tracing::{debug, error, info};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Configuration is invalid: {0}")]
    Config(#[from] config::Error),
    #[error("Logging setup failed: {0}")]
    Logging(#[from] logging::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Burst task could not start: {0}")]
    Scheduler(#[from] scheduler::Error),
    #[error("Burst task failed: {0}")]
    Emitter(#[from] emitter::Error),
    #[error("Control interface returned an error: {0}")]
    Control(#[from] control::Error),
    #[error(transparent)]
    Registration(#[from] dotter_signal::RegisterError),
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// serve the HTTP control interface instead of running one burst task
    #[clap(long)]
    http: bool,
    /// minimum log level, refined by `RUST_LOG` directives
    #[clap(long, default_value = "info")]
    level: String,
    /// annotate logs with source locations, colored when writing to stdout
    #[clap(long)]
    development: bool,
    /// path of the log file, logs and records go to stdout when absent
    #[clap(long)]
    file: Option<PathBuf>,
    /// how often the log file is rotated
    #[clap(long, value_enum, default_value_t = Rotation::Daily)]
    log_rotation: Rotation,
    /// rotated log files to keep
    #[clap(long, default_value_t = NonZeroUsize::MIN)]
    log_max_files: NonZeroUsize,
    /// time between bursts, in milliseconds
    #[clap(long, default_value_t = 1_000)]
    interval: u64,
    /// time after which the burst task stops, in minutes
    #[clap(long, default_value_t = 60)]
    timeout: u64,
    /// records written per burst
    #[clap(long, default_value_t = MAX_BURST_SIZE)]
    burst_size: u32,
    /// address to bind the control interface to, only used with --http
    #[clap(long, default_value = "0.0.0.0:9093")]
    control_addr: SocketAddr,
    /// address to bind the prometheus exporter to
    #[clap(long, default_value = "0.0.0.0:9094")]
    prometheus_addr: SocketAddr,
    /// concurrent connections the control interface accepts
    #[clap(long, default_value_t = 100)]
    concurrent_requests_max: usize,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

fn get_config(cli: &Cli) -> Config {
    let mode = if cli.http {
        Mode::Http(control::Config {
            binding_addr: cli.control_addr,
            concurrent_requests_max: cli.concurrent_requests_max,
        })
    } else {
        Mode::Static(
            scheduler::Config::new(cli.interval, cli.timeout).with_burst_size(cli.burst_size),
        )
    };

    let file = cli.file.clone().map(|path| logging::FileConfig {
        path,
        rotation: cli.log_rotation,
        max_files: cli.log_max_files,
    });

    Config {
        telemetry: Telemetry {
            prometheus_addr: cli.prometheus_addr,
        },
        mode,
        log: logging::Config {
            level: cli.level.clone(),
            development: cli.development,
            file,
        },
    }
}

fn install_prometheus(telemetry: &Telemetry) -> Result<(), Error> {
    PrometheusBuilder::new()
        .with_http_listener(telemetry.prometheus_addr)
        .install()?;
    info!(
        "prometheus exporter listening on {}",
        telemetry.prometheus_addr
    );
    Ok(())
}

async fn inner_main(config: Config, sink: Arc<dyn Sink>) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = dotter_signal::signal();

    // The gauge handle is resolved on construction, so after the recorder is
    // installed.
    let counter = Arc::new(LineCounter::new());
    let (scheduler, mut failures) = Scheduler::new(sink, counter, shutdown_watcher.register()?);
    let scheduler = Arc::new(scheduler);
    let mut state = scheduler.subscribe();

    let mut control_joinset = JoinSet::new();
    let static_mode = match config.mode {
        Mode::Static(burst) => {
            let snapshot = scheduler.start(burst).await?;
            info!(deadline = %snapshot.deadline, "running a single burst task");
            true
        }
        Mode::Http(control) => {
            let control = Control::new(
                &control,
                Arc::clone(&scheduler),
                shutdown_watcher.register()?,
            );
            control_joinset.spawn(control.run());
            false
        }
    };

    // Every watcher derived from `shutdown_watcher` must be gone for
    // `signal_and_wait` below to return.
    drop(shutdown_watcher);
    let mut interval = time::interval(Duration::from_millis(400));
    let res = loop {
        tokio::select! {
            biased;

            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            },
            Some(err) = failures.recv() => {
                error!("Burst task failed: {err}");
                break Err(Error::Emitter(err));
            },
            Some(res) = control_joinset.join_next() => {
                match res {
                    Ok(Ok(())) => {
                        debug!("Control interface shut down");
                        break Ok(());
                    }
                    Ok(Err(err)) => {
                        error!("Control interface shut down unexpectedly: {err}");
                        break Err(Error::Control(err));
                    }
                    Err(err) => {
                        error!("Could not join the spawned control task: {err}");
                        break Ok(());
                    }
                }
            },
            res = state.changed(), if static_mode => {
                if res.is_err() || !state.borrow_and_update().is_running() {
                    info!("burst task finished");
                    break Ok(());
                }
            },
            _ = interval.tick() => {
                gauge!("dotter.running").set(1.0);
            },
        }
    };

    drop(state);
    drop(scheduler);
    shutdown_broadcast.signal_and_wait().await;
    res
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = get_config(&cli);
    config.validate()?;
    let output = logging::init(&config.log)?;
    let sink = Arc::new(WriterSink::new(output));

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting dotter {version} run.");

    let max_shutdown_delay = Duration::from_secs(cli.max_shutdown_delay.into());
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(async move {
        install_prometheus(&config.telemetry)?;
        inner_main(config, sink).await
    });
    if let Err(err) = &res {
        error!("dotter exited with an error: {err}");
    }
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
