use clap::Parser;
use eyre::Result;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of serial device of the MS2000. All ports are scanned if not given.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate of serial device
    #[arg(long, default_value = "9600")]
    baud_rate: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Enable logging to console.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let cfg = stage_core::StageConfig {
        port: cli.port,
        baud_rate: cli.baud_rate,
        ..Default::default()
    };
    let connector = asi_ms2000::SerialConnector::new(cfg.baud_rate);
    let stage = asi_ms2000::Stage::connect(&connector, &cfg).await?;
    println!("Opened stage controller: {}", stage.port_name());

    println!("sleeping...");
    tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
    println!("awake...");
    println!("position {}", stage.snapshot());

    let info = stage.device_info().await;
    println!("Got version {}", info.version);

    let x = stage.position(stage_core::AxisId::X);
    let outcome = stage.move_axis(stage_core::AxisId::X, x + 1.0).await;
    println!("Move finished: {outcome}");
    println!("position {}", stage.snapshot());

    stage.disconnect().await;
    Ok(())
}
