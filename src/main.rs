use clap::Parser;
use color_eyre::eyre::{self, Result, WrapErr};
use std::{future::Future, path::PathBuf, sync::Mutex};
use tracing::{self as log};

use asi_ms2000::{Connector, MotionOutcome, SerialConnector, Stage};
use stage_core::{AxisId, FloatType, StageConfig, ALL_AXES};

/// Looked up in the home directory when `--config` is not given.
const DEFAULT_CONFIG_NAME: &str = ".asi-stage.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Serial port of the MS2000. All ports are scanned if not given.
    #[arg(long)]
    port: Option<String>,

    /// Filename of stage configuration in YAML format
    #[arg(long)]
    config: Option<PathBuf>,

    /// If set, logs are also saved to this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Show positions and limit states (default command)
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
        /// Keep printing every change until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// List the serial ports of this machine
    Ports,
    /// Find the controller and print its port
    Probe,
    /// Show model and firmware version
    Info,
    /// Move to an absolute position and wait until the stage stops
    Move {
        #[arg(long, allow_hyphen_values = true)]
        x: Option<FloatType>,
        #[arg(long, allow_hyphen_values = true)]
        y: Option<FloatType>,
        #[arg(long, allow_hyphen_values = true)]
        z: Option<FloatType>,
    },
    /// Move one axis by an offset and wait until it stops
    Offset {
        axis: AxisId,
        #[arg(allow_hyphen_values = true)]
        delta: FloatType,
    },
    /// Seek the hardware origin
    Home {
        /// Axis ids (1=X, 2=Y, 3=Z), comma separated. All axes if not given.
        #[arg(long, value_delimiter = ',')]
        axes: Vec<u32>,
    },
    /// Return to zero, or with `--here` make the current position zero
    Zero {
        #[arg(long)]
        here: bool,
        /// Axis ids (1=X, 2=Y, 3=Z), comma separated. All axes if not given.
        #[arg(long, value_delimiter = ',')]
        axes: Vec<u32>,
    },
    /// Halt all axes
    Halt,
    /// Restore controller defaults
    Reset,
    /// Show all speeds, or show or set the speed of one axis
    Speed {
        axis: Option<AxisId>,
        value: Option<FloatType>,
    },
    /// Show the configuration and then quit
    ShowConfig,
}

/// Read the YAML configuration and apply command line overrides.
fn load_config(
    fname: Option<&std::path::Path>,
    default_fname: Option<PathBuf>,
    port: Option<&str>,
) -> Result<StageConfig> {
    let fname = match fname {
        Some(fname) => Some(fname.to_path_buf()),
        None => default_fname.filter(|f| f.exists()),
    };
    let mut cfg: StageConfig = if let Some(fname) = &fname {
        log::debug!("Reading stage config from: {}", fname.display());
        let cfg_buf = std::fs::read_to_string(fname)
            .with_context(|| format!("opening file {}", fname.display()))?;
        serde_yaml::from_str(&cfg_buf)
            .with_context(|| format!("while parsing YAML in file {}", fname.display()))?
    } else {
        StageConfig::default()
    };
    if let Some(port) = port {
        cfg.port = Some(port.to_string());
    }
    Ok(cfg)
}

fn init_logging(log_dir: Option<&std::path::Path>) -> Result<()> {
    use time::{format_description::well_known::Iso8601, UtcOffset};
    use tracing_subscriber::{
        fmt::{self, time::OffsetTime},
        layer::SubscriberExt,
    };

    // Create a fixed offset time formatter based on the timezone at the
    // time this line of code runs.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("While creating directory {}", log_dir.display()))?;
            let log_file_name = chrono::Local::now()
                .format("asi-stage-%Y%m%d_%H%M%S.%f.log")
                .to_string();
            let full_log_file_name = log_dir.join(log_file_name);
            let file = std::fs::File::create(&full_log_file_name).with_context(|| {
                format!("While creating file {}", full_log_file_name.display())
            })?;
            Some(
                fmt::layer()
                    .with_timer(timer.clone())
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };
    let console_layer = fmt::layer()
        .with_timer(timer)
        .with_writer(std::io::stderr);
    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(collector)?;
    std::panic::set_hook(Box::new(tracing_panic::panic_hook));
    Ok(())
}

/// Axes selected by id on the command line, all axes when none are given.
fn select_axes(ids: &[u32]) -> Result<Vec<AxisId>> {
    if ids.is_empty() {
        return Ok(ALL_AXES.to_vec());
    }
    let axes = AxisId::known(ids);
    if axes.is_empty() {
        eyre::bail!("no known axis in {ids:?}, use 1, 2 or 3");
    }
    if axes.len() < ids.len() {
        log::warn!("ignoring unknown axis ids in {ids:?}");
    }
    Ok(axes)
}

/// Wait for a motion, halting the stage on Ctrl-C.
async fn wait_for_motion<F>(stage: &Stage, motion: F) -> Result<()>
where
    F: Future<Output = MotionOutcome>,
{
    tokio::pin!(motion);
    let outcome = tokio::select! {
        outcome = &mut motion => outcome,
        res = tokio::signal::ctrl_c() => {
            res.with_context(|| "waiting for Ctrl-C")?;
            log::warn!("Interrupted, halting stage.");
            // Keep polling the motion so it can release the port.
            let (halted, outcome) = tokio::join!(stage.stop(), &mut motion);
            halted.with_context(|| "halting stage")?;
            outcome
        }
    };
    match outcome {
        MotionOutcome::Done => {
            println!("{}", stage.snapshot());
            Ok(())
        }
        MotionOutcome::Cancelled => eyre::bail!("motion cancelled"),
        MotionOutcome::Failed(e) => Err(e).with_context(|| "motion failed"),
    }
}

async fn print_status(stage: &Stage, json: bool, watch: bool) -> Result<()> {
    let mut rx = stage.subscribe();
    // wait for the first refresh
    tokio::time::timeout(stage.config().command_timeout() * 2, rx.changed())
        .await
        .with_context(|| "no status from controller")??;
    loop {
        let snap = *rx.borrow_and_update();
        if json {
            println!("{}", serde_json::to_string(&snap)?);
        } else {
            println!("{snap}");
        }
        if !watch {
            return Ok(());
        }
        tokio::select! {
            res = rx.changed() => res?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn run(stage: &Stage, command: Commands) -> Result<()> {
    match command {
        Commands::Status { json, watch } => print_status(stage, json, watch).await?,
        Commands::Info => {
            let info = stage.device_info().await;
            println!("model: {}", info.model);
            println!("version: {}", info.version);
            println!("port: {}", stage.port_name());
        }
        Commands::Move { x, y, z } => {
            let targets: Vec<(AxisId, FloatType)> = ALL_AXES
                .into_iter()
                .zip([x, y, z])
                .filter_map(|(axis, v)| v.map(|v| (axis, v)))
                .collect();
            if targets.is_empty() {
                eyre::bail!("no target given, use --x, --y or --z");
            }
            wait_for_motion(stage, stage.move_absolute(&targets)).await?;
        }
        Commands::Offset { axis, delta } => {
            wait_for_motion(stage, stage.move_relative(axis, delta)).await?;
        }
        Commands::Home { axes } => {
            let axes = select_axes(&axes)?;
            wait_for_motion(stage, stage.home_axes(&axes)).await?
        }
        Commands::Zero { here: true, .. } => {
            stage.set_origin().await?;
            log::info!("Current position is now zero.");
        }
        Commands::Zero { here: false, axes } => {
            let axes = select_axes(&axes)?;
            wait_for_motion(stage, stage.return_to_zero(&axes)).await?
        }
        Commands::Halt => stage.stop().await?,
        Commands::Reset => {
            stage.reset_params().await?;
            log::info!("Controller parameters restored.");
        }
        Commands::Speed { axis: None, .. } => {
            for (axis, speed) in stage.speeds(&ALL_AXES).await? {
                println!("{axis}={speed}");
            }
        }
        Commands::Speed {
            axis: Some(axis),
            value: None,
        } => println!("{axis}={}", stage.speed(axis).await?),
        Commands::Speed {
            axis: Some(axis),
            value: Some(value),
        } => stage.set_speed(axis, value).await?,
        Commands::Ports | Commands::Probe | Commands::ShowConfig => {
            eyre::bail!("command does not use a stage connection")
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        let envstr = format!("{}=info,asi_ms2000=info,info", env!("CARGO_PKG_NAME"))
            .replace('-', "_");
        std::env::set_var("RUST_LOG", envstr);
    }

    let cli = Cli::parse();
    init_logging(cli.log_dir.as_deref())?;

    let default_config = home::home_dir().map(|h| h.join(DEFAULT_CONFIG_NAME));
    let cfg = load_config(cli.config.as_deref(), default_config, cli.port.as_deref())?;
    let connector = SerialConnector::new(cfg.baud_rate);

    let command = cli.command.unwrap_or(Commands::Status {
        json: false,
        watch: false,
    });
    match command {
        Commands::ShowConfig => {
            print!("{}", serde_yaml::to_string(&cfg)?);
        }
        Commands::Ports => {
            for port in connector.available_ports()? {
                println!("{port}");
            }
        }
        Commands::Probe => {
            let port = asi_ms2000::find_port(&connector, cfg.port.as_deref(), &cfg).await?;
            println!("{port}");
        }
        command => {
            let stage = Stage::connect(&connector, &cfg)
                .await
                .with_context(|| "connecting to stage controller")?;
            let res = run(&stage, command).await;
            stage.disconnect().await;
            res?;
        }
    }
    Ok(())
}
