use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// VPN gateway that answers NAT-PMP requests.
    pub gateway: IpAddr,
    /// External NAT-PMP client binary performing the UDP exchange.
    pub natpmp_client: PathBuf,
    /// Seconds between renewals while the gateway is reachable.
    pub refresh_seconds: u64,
    /// Seconds before the single short retry after losing the gateway.
    pub retry_delay_seconds: u64,
    /// Seconds between further retries while the gateway stays away.
    pub backoff_seconds: u64,
    /// Upper bound on one NAT-PMP exchange.
    pub acquire_timeout_seconds: u64,
    /// Settling time after asking an application to quit.
    pub stop_grace_seconds: u64,
    /// Identifiers of the applications to manage, resolved against the
    /// adapter registry at startup.
    pub apps: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: "10.2.0.1".parse().expect("valid default gateway"),
            natpmp_client: PathBuf::from("natpmp-client"),
            refresh_seconds: 45,
            retry_delay_seconds: 5,
            backoff_seconds: 30,
            acquire_timeout_seconds: 30,
            stop_grace_seconds: 30,
            apps: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("portglue.toml"))
                .merge(Json::file("portglue.json"))
                .merge(Env::prefixed("PORTGLUE_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        for (name, value) in [
            ("refresh_seconds", config.refresh_seconds),
            ("retry_delay_seconds", config.retry_delay_seconds),
            ("backoff_seconds", config.backoff_seconds),
            ("acquire_timeout_seconds", config.acquire_timeout_seconds),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be at least 1", name);
            }
        }

        Ok(config)
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}
