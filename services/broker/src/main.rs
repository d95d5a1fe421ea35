//! fpgashare broker
//!
//! Node-local process that owns the allocation side of fractional FPGA
//! sharing. It keeps the device inventory fresh from the discovery feed and
//! holds the allocator the device-plugin gRPC endpoint dispatches into.
//!
//! ## Architecture
//!
//! - **Inventory refresh**: reloads the discovery feed, invalidating the
//!   physical device index on change
//! - **Allocator**: matches allocation requests to assumed pods and commits them
//! - **State store**: Kubernetes API client shared by every component

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fpgashare_broker::config::Config;
use fpgashare_broker::discovery::{run_inventory_refresh, InventoryFile};
use fpgashare_broker::kube::KubeClient;
use fpgashare_broker::{Allocator, DeviceInventory, HandleLayout, WorkloadStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fpgashare broker");
    info!(
        node_name = %config.node_name,
        resource_name = %config.resource_name,
        sub_units_per_device = config.sub_units_per_device,
        inventory_path = %config.inventory_path.display(),
        kube_api_url = %config.kube_api_url,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One store client for the whole process
    let store: Arc<dyn WorkloadStore> = Arc::new(KubeClient::new(&config)?);

    // Seed the inventory before serving so the first request sees devices
    let inventory = Arc::new(DeviceInventory::new(HandleLayout::new(
        config.sub_units_per_device,
    )));
    let feed = InventoryFile::new(&config.inventory_path);
    if let Err(e) = feed.sync(&inventory).await {
        warn!(error = %e, "Initial inventory load failed, starting with no devices");
    }

    // The device-plugin gRPC endpoint shares this handle and dispatches
    // every Allocate call into it.
    let allocator = Arc::new(Allocator::new(
        Arc::clone(&store),
        Arc::clone(&inventory),
        config.node_name.clone(),
        config.resource_name.clone(),
    ));
    let fractional_devices = inventory.fractional_count().await;
    let physical_devices = inventory.physical_devices().await.len();
    info!(fractional_devices, physical_devices, "Allocator ready");

    // Start the inventory refresh loop
    let refresh_handle = tokio::spawn(run_inventory_refresh(
        feed,
        Arc::clone(&inventory),
        Duration::from_secs(config.inventory_refresh_secs),
        shutdown_rx.clone(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = refresh_handle => {
            if let Err(e) = result {
                error!(error = %e, "Inventory refresh task panicked");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    // Held for the endpoint until shutdown.
    drop(allocator);

    info!("Broker shutdown complete");
    Ok(())
}
