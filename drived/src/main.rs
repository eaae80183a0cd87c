use drived::daemon::{DaemonConfig, DaemonRuntime, reset_cache};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    ResetCache,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cli {
    mode: CliMode,
    verbosity: u8,
}

fn parse_cli<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = Cli {
        mode: CliMode::Run,
        verbosity: 0,
    };
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--reset-cache" => cli.mode = CliMode::ResetCache,
            "--help" | "-h" => cli.mode = CliMode::Help,
            "-v" => cli.verbosity = cli.verbosity.saturating_add(1),
            "-vv" => cli.verbosity = cli.verbosity.saturating_add(2),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(cli)
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "drived=info,drive_core=info",
        1 => "drived=debug,drive_core=debug",
        _ => "drived=trace,drive_core=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = parse_cli(std::env::args())?;
    init_tracing(cli.verbosity);
    match cli.mode {
        CliMode::Help => {
            println!("Usage: drived [--reset-cache] [-v|-vv]");
            println!("  --reset-cache   Remove cached metadata and sync cursor, then exit");
            println!("  -v, -vv         Raise log verbosity (RUST_LOG overrides)");
            return Ok(());
        }
        CliMode::ResetCache => {
            let config = DaemonConfig::from_env()?;
            return reset_cache(&config).await;
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
