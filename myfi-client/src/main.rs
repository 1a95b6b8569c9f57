use anyhow::Result;
use clap::Parser;
use myfi_client_lib::config::ClientConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "MyFi voice calling client")]
#[command(
    long_about = "Places and answers one-to-one MyFi voice calls from the terminal, using the MyFi signaling relay"
)]
pub struct CliArgs {
    /// Directory containing `config.toml`. Defaults to the platform config directory.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Own user ID, overrides `call.user_id`.
    #[arg(long)]
    user_id: Option<String>,

    /// Signaling relay URL, overrides `backend.ws_url`.
    #[arg(long)]
    ws_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    let config_dir = cli.config_dir.or_else(|| {
        directories::ProjectDirs::from("app", "myfi", "myfi-client")
            .map(|dirs| dirs.config_local_dir().to_path_buf())
    });
    let mut config = ClientConfig::parse(config_dir.as_deref())?;
    if let Some(user_id) = cli.user_id {
        config.call.user_id = Some(user_id);
    }
    if let Some(ws_url) = cli.ws_url {
        config.backend.ws_url = ws_url;
    }

    myfi_client_lib::init_tracing(&config.logging);
    tracing::trace!(?config, ?config_dir, "Parsed config");

    myfi_client_lib::run(config).await
}
