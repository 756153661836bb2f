//! Runtime configuration read from the environment.

use std::net::SocketAddr;

use thiserror::Error;

use factorops_core::TenantId;

pub const BIND_ADDR_VAR: &str = "FACTOROPS_BIND_ADDR";
pub const DEMO_SEED_VAR: &str = "FACTOROPS_DEMO_SEED";
pub const DEMO_TENANT_VAR: &str = "FACTOROPS_DEMO_TENANT";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid socket address: {value}")]
    BindAddr { var: &'static str, value: String },
    #[error("{var} must be a boolean (true/false/1/0), got `{value}`")]
    Bool { var: &'static str, value: String },
    #[error("{var} is not a valid tenant id: {value}")]
    Tenant { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Seed demo installments at startup.
    pub demo_seed: bool,
    /// Tenant that receives the demo installments. A fresh one is minted when unset.
    pub demo_tenant: Option<TenantId>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            demo_seed: false,
            demo_tenant: None,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_addr = lookup(BIND_ADDR_VAR).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw_addr.trim().parse().map_err(|_| ConfigError::BindAddr {
            var: BIND_ADDR_VAR,
            value: raw_addr.clone(),
        })?;

        let demo_seed = match lookup(DEMO_SEED_VAR) {
            None => false,
            Some(v) => parse_bool(&v).ok_or(ConfigError::Bool {
                var: DEMO_SEED_VAR,
                value: v.clone(),
            })?,
        };

        let demo_tenant = lookup(DEMO_TENANT_VAR)
            .map(|v| {
                v.parse::<TenantId>().map_err(|_| ConfigError::Tenant {
                    var: DEMO_TENANT_VAR,
                    value: v.clone(),
                })
            })
            .transpose()?;

        Ok(Self {
            bind_addr,
            demo_seed,
            demo_tenant,
        })
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
