use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use gamenet::{setup_tracing, AppResult, NetConfig, PacketEchoHandler, Server, GLOBAL_CONFIG};
use tokio::sync::{broadcast, mpsc};
use tokio::{runtime, signal};
use tracing::{error, info, trace};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective config and exit
    PrintConfig,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> AppResult<()> {
    // load .env
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let net_config = if config_path.exists() {
        NetConfig::set_up_config(&config_path)?
    } else {
        NetConfig::default()
    };

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", net_config);
        return Ok(());
    }

    let _tracing_guard = setup_tracing("logs", log_level(commandline.verbose))?;
    if !config_path.exists() {
        info!(
            "config file {} not found, using defaults",
            config_path.display()
        );
    }
    let listen_address = net_config.network.listen_address();
    if GLOBAL_CONFIG.set(net_config).is_err() {
        error!("global config was already installed");
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run_echo_server(&listen_address))
}

async fn run_echo_server(listen_address: &str) -> AppResult<()> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let handler = Arc::new(PacketEchoHandler::new(
        notify_shutdown.clone(),
        shutdown_complete_tx,
    ));
    let server = Server::bind(listen_address, handler).await?;

    tokio::select! {
      res = server.run() => {
          if let Err(err) = res {
              error!(cause = %err, "failed to accept");
          }
      }
      _ = signal::ctrl_c() => {
          info!("get shutdown signal");
      }
    }

    // stop accepting, then tell every connection to finish
    drop(server);
    let _ = notify_shutdown.send(());
    drop(notify_shutdown);

    trace!("waiting for connections to close...");
    let _ = shutdown_complete_rx.recv().await;
    info!("echo server shutdown complete");
    Ok(())
}
