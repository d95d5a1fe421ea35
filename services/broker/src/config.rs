//! Configuration for the broker.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Default extended resource name advertised for fractional cards.
pub const DEFAULT_RESOURCE_NAME: &str =
    "xilinx.com/fpga-xilinx_u200_xdma_201830_1-1542252769-fraction";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node whose pods are allocation candidates.
    pub node_name: String,

    /// Extended resource name pods declare their fractional demand under.
    pub resource_name: String,

    /// Fractional handles per physical card.
    pub sub_units_per_device: u32,

    /// JSON document listing the node's fractional devices.
    pub inventory_path: PathBuf,

    /// Interval between inventory reloads in seconds.
    pub inventory_refresh_secs: u64,

    /// Kubernetes API server base URL.
    pub kube_api_url: String,

    /// Bearer token file. Missing files are tolerated.
    pub kube_token_path: PathBuf,

    /// CA bundle for the API server. Missing files are tolerated.
    pub kube_ca_path: PathBuf,

    /// Client-side timeout for state store calls in seconds.
    pub store_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_name = var("NODE_NAME")
            .filter(|s| !s.is_empty())
            .context("NODE_NAME must name the node this broker runs on")?;

        let resource_name =
            var("FPGASHARE_RESOURCE_NAME").unwrap_or_else(|| DEFAULT_RESOURCE_NAME.to_string());

        let sub_units_per_device = match var("FPGASHARE_SUB_UNITS_PER_DEVICE") {
            Some(s) => s
                .parse()
                .with_context(|| format!("invalid FPGASHARE_SUB_UNITS_PER_DEVICE '{s}'"))?,
            None => 3,
        };
        if sub_units_per_device == 0 {
            anyhow::bail!("FPGASHARE_SUB_UNITS_PER_DEVICE must be at least 1");
        }

        let inventory_path = var("FPGASHARE_INVENTORY_PATH")
            .unwrap_or_else(|| "/var/lib/fpgashare/inventory.json".to_string())
            .into();

        let inventory_refresh_secs = var("FPGASHARE_INVENTORY_REFRESH_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        if inventory_refresh_secs == 0 {
            anyhow::bail!("FPGASHARE_INVENTORY_REFRESH_SECS must be at least 1");
        }

        let kube_api_url = var("FPGASHARE_KUBE_API_URL")
            .or_else(|| {
                let host = var("KUBERNETES_SERVICE_HOST")?;
                let port = var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|| "443".to_string());
                Some(if host.contains(':') {
                    format!("https://[{host}]:{port}")
                } else {
                    format!("https://{host}:{port}")
                })
            })
            .unwrap_or_else(|| "https://kubernetes.default.svc".to_string());

        let kube_token_path = var("FPGASHARE_KUBE_TOKEN_PATH")
            .unwrap_or_else(|| format!("{SERVICE_ACCOUNT_DIR}/token"))
            .into();

        let kube_ca_path = var("FPGASHARE_KUBE_CA_PATH")
            .unwrap_or_else(|| format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .into();

        let store_timeout_secs = var("FPGASHARE_STORE_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        if store_timeout_secs == 0 {
            anyhow::bail!("FPGASHARE_STORE_TIMEOUT_SECS must be at least 1");
        }

        let log_level = var("FPGASHARE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_name,
            resource_name,
            sub_units_per_device,
            inventory_path,
            inventory_refresh_secs,
            kube_api_url,
            kube_token_path,
            kube_ca_path,
            store_timeout_secs,
            log_level,
        })
    }
}
