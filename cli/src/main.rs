use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Existing env > .env > XDG config.toml; never overwrites exported keys.
    if let Err(e) = config::load_and_apply("weft", None) {
        eprintln!("environment config: {e}");
    }

    let cli = cli::Cli::parse();

    // Tracing goes to stderr; stdout is reserved for program output.
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = cli::execute(cli).await;
    if let Err(e) = &result {
        eprintln!("{e}");
    }
    std::process::exit(cli::exit_code_for(&result));
}
