use clap::{Args, Parser, Subcommand};
use pixel_canvas::client::{CanvasClient, CanvasView, ClientConfig, ClientError};
use pixel_canvas::config::{
    CREDENTIALS_ENV, Config, ConfigError, DEFAULT_ENDPOINT, DEFAULT_MODULE, ENDPOINT_ENV,
    MODULE_ENV,
};
use pixel_canvas::input::{InputOutcome, Point};
use pixel_canvas::render::{self, RenderError, SurfaceSize};
use pixel_canvas::session::{ConnectionStatus, CredentialError, FileCredentialStore};
use pixel_canvas::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use pixel_canvas::transport::websocket::WebSocketConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::new(&cli.endpoint, &cli.module)?;
    config.credentials_path = cli.credentials.clone();

    match cli.command {
        Command::Watch(args) => handle_watch(&config, args).await,
        Command::Draw(args) => handle_draw(&config, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "pixel-canvas",
    about = "Watch and paint a shared pixel canvas",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = ENDPOINT_ENV,
        default_value = DEFAULT_ENDPOINT,
        help = "WebSocket endpoint of the canvas store"
    )]
    endpoint: String,

    #[arg(
        long,
        global = true,
        env = MODULE_ENV,
        default_value = DEFAULT_MODULE,
        help = "Database module hosting the pixel table"
    )]
    module: String,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = CREDENTIALS_ENV,
        help = "Credentials file (defaults to ~/.pixel-canvas/credentials)"
    )]
    credentials: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "PIXEL_CANVAS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "PIXEL_CANVAS_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the canvas and keep a PNG of the latest frame up to date
    Watch(WatchArgs),
    /// Drag a straight stroke across the canvas
    Draw(DrawArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long, value_name = "PATH", help = "Rewrite this PNG on every change")]
    png: Option<PathBuf>,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Exit once the initial canvas has been received"
    )]
    once: bool,

    #[arg(long, value_name = "SECS", default_value_t = 30)]
    connect_timeout: u64,
}

#[derive(Args, Debug)]
struct DrawArgs {
    #[arg(long, default_value = "#000000", help = "Stroke color as #RRGGBB")]
    color: String,

    #[arg(long, value_name = "X,Y", value_parser = parse_point)]
    from: Point,

    #[arg(long, value_name = "X,Y", value_parser = parse_point)]
    to: Point,

    #[arg(long, default_value_t = 32, help = "Pointer samples along the stroke")]
    steps: u32,

    #[arg(long, value_name = "SECS", default_value_t = 30)]
    connect_timeout: u64,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Credentials(#[from] CredentialError),
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("{0}")]
    Render(#[from] RenderError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

fn parse_point(raw: &str) -> Result<Point, String> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got '{raw}'"))?;
    let x: f64 = x.trim().parse().map_err(|err| format!("bad x '{x}': {err}"))?;
    let y: f64 = y.trim().parse().map_err(|err| format!("bad y '{y}': {err}"))?;
    Ok(Point::new(x, y))
}

fn connect_client(config: &Config, surface: SurfaceSize) -> Result<CanvasClient, CliError> {
    let credentials = match &config.credentials_path {
        Some(path) => FileCredentialStore::new(path.clone()),
        None => FileCredentialStore::at_default_path()?,
    };
    let mut client_config = ClientConfig::from(config);
    client_config.surface = surface;
    Ok(CanvasClient::spawn(
        client_config,
        Arc::new(WebSocketConnector::default()),
        Arc::new(credentials),
    ))
}

/// Ready, or given up: disconnected with an error and no attempt in flight.
async fn wait_until_ready(client: &CanvasClient, secs: u64) -> Result<CanvasView, CliError> {
    let view = timeout(
        Duration::from_secs(secs),
        client.wait_for(|view| view.ready || gave_up(view)),
    )
    .await
    .map_err(|_| CliError::Timeout("the canvas to load"))??;
    if view.ready {
        return Ok(view);
    }
    Err(CliError::Unreachable(
        view.last_error.unwrap_or_else(|| "disconnected".into()),
    ))
}

fn gave_up(view: &CanvasView) -> bool {
    view.status == ConnectionStatus::Disconnected
        && view
            .last_error
            .as_deref()
            .is_some_and(|err| err.starts_with("gave up"))
}

async fn handle_watch(config: &Config, args: WatchArgs) -> Result<(), CliError> {
    let surface = SurfaceSize::new(args.width, args.height);
    let client = connect_client(config, surface)?;
    client.start().await?;
    let view = wait_until_ready(&client, args.connect_timeout).await?;
    println!(
        "🎨 connected to {} as {} ({} pixels)",
        config.module,
        view.identity.map(|id| id.short()).unwrap_or_default(),
        view.pixels.len()
    );
    write_frame(&args.png, &view)?;
    if args.once {
        return Ok(client.shutdown().await?);
    }

    let mut updates = client.watch();
    let mut version = view.version;
    let mut status = view.status;
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = updates.borrow_and_update().clone();
                if view.status != status {
                    status = view.status;
                    println!("🔌 {}", status.as_str());
                }
                if view.version != version {
                    version = view.version;
                    info!(pixels = view.pixels.len(), version, "canvas changed");
                    write_frame(&args.png, &view)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("👋 stopping");
                break;
            }
        }
    }
    client.shutdown().await?;
    Ok(())
}

fn write_frame(png: &Option<PathBuf>, view: &CanvasView) -> Result<(), CliError> {
    if let Some(path) = png {
        render::write_png(&view.frame, path)?;
        debug!(path = %path.display(), version = view.version, "frame written");
    }
    Ok(())
}

async fn handle_draw(config: &Config, args: DrawArgs) -> Result<(), CliError> {
    let client = connect_client(config, SurfaceSize::default())?;
    client.select_color(&args.color)?;
    client.start().await?;
    wait_until_ready(&client, args.connect_timeout).await?;

    let mut input = client.input();
    let steps = args.steps.max(1);
    let mut sent = 0usize;
    let mut tally = |outcome: InputOutcome| {
        if matches!(outcome, InputOutcome::Sent(_)) {
            sent += 1;
        }
    };
    tally(input.begin(args.from));
    for step in 1..=steps {
        sleep(pixel_canvas::input::DEFAULT_MIN_INTERVAL).await;
        let t = step as f64 / steps as f64;
        let point = Point::new(
            args.from.x + (args.to.x - args.from.x) * t,
            args.from.y + (args.to.y - args.from.y) * t,
        );
        tally(input.extend(point));
    }
    input.end();

    let (x, y) = args.to.cell();
    let color = client.view().selected;
    let echoed = timeout(
        Duration::from_secs(5),
        client.wait_for(|view| view.pixel_at(x, y).is_some_and(|pixel| pixel.color == color)),
    )
    .await;
    match echoed {
        Ok(view) => {
            let view = view?;
            println!("✏️  sent {sent} pixels; canvas now holds {}", view.pixels.len());
        }
        Err(_) => warn!(sent, "stroke end was not echoed back before exit"),
    }
    client.shutdown().await?;
    Ok(())
}
