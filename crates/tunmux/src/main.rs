mod tunmux;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tunmux",
    version,
    about = "tunmux - multiplexed TCP tunnel"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses TUNMUX_CONFIG; then auto-detects tunmux.toml > tunmux.yaml > tunmux.yml from CWD; then falls back to the OS default path (Linux: /etc/tunmux/tunmux.toml; others: user config dir).
    #[arg(short, long, env = "TUNMUX_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tunmux::run(cli.config).await
}
