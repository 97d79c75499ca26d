use clap::Parser;
use log::{error, info};
use server::hub::{Hub, HubHandle};
use server::network::Gateway;
use server::store::RocksSnapshotStore;
use std::path::PathBuf;

/// Parses command-line arguments, recovers the persisted canvas, then runs
/// the hub and the gateway until either fails or Ctrl+C arrives.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
        port: u16,
        /// Directory holding the snapshot log
        #[clap(short, long, default_value = "hexwars_data")]
        data_dir: PathBuf,
    }

    env_logger::init();
    let args = Args::parse();

    let store = RocksSnapshotStore::open(&args.data_dir)?;
    let mut hub = Hub::new(store);
    if hub.recover()? {
        info!("Restored canvas from the latest snapshot");
    } else {
        info!("No snapshot found, starting with a blank canvas");
    }

    let (handle, commands) = HubHandle::channel();
    let hub_task = tokio::spawn(hub.run(commands));

    let address = format!("{}:{}", args.host, args.port);
    let gateway = Gateway::bind(&address, handle).await?;
    let gateway_task = tokio::spawn(gateway.run());

    // Handle shutdown gracefully
    tokio::select! {
        result = hub_task => {
            if let Err(e) = result {
                error!("Hub task panicked: {}", e);
            }
        }
        result = gateway_task => {
            match result {
                Ok(Err(e)) => error!("Gateway failed: {}", e),
                Err(e) => error!("Gateway task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully");
        }
    }

    Ok(())
}
