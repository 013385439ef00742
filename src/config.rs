use crate::types::Address;
use anyhow::{
    Context,
    Result,
    anyhow,
};
use chrono::Utc;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

pub const POOLS_ROOT: &str = ".pools";
const POOL_FILE: &str = "pool.json";

pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_POLLS: u32 = 120;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetworkEnv {
    Local,
    Testnet,
    Mainnet,
}

impl NetworkEnv {
    pub fn dir_name(self) -> &'static str {
        match self {
            NetworkEnv::Local => "local",
            NetworkEnv::Testnet => "testnet",
            NetworkEnv::Mainnet => "mainnet",
        }
    }

    pub fn default_gateway_url(self) -> &'static str {
        match self {
            NetworkEnv::Local => "http://127.0.0.1:8787",
            NetworkEnv::Testnet => "https://testnet.squares-gateway.xyz",
            NetworkEnv::Mainnet => "https://squares-gateway.xyz",
        }
    }
}

impl fmt::Display for NetworkEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkEnv::Local => "Local",
            NetworkEnv::Testnet => "Testnet",
            NetworkEnv::Mainnet => "Mainnet",
        };
        write!(f, "{name}")
    }
}

/// Last pool this client was pointed at on a network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub saved_at: String,
    pub pool: String,
    pub gateway_url: String,
    #[serde(default)]
    pub spender: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,
}

#[derive(Debug)]
pub struct PoolStore {
    path: PathBuf,
}

impl PoolStore {
    pub fn new(root: impl AsRef<Path>, env: NetworkEnv) -> Result<Self> {
        let dir = root.as_ref().join(env.dir_name());
        if !dir.exists() {
            fs::create_dir_all(&dir).with_context(|| {
                format!("Failed to create pool record directory {}", dir.display())
            })?;
        }
        Ok(Self {
            path: dir.join(POOL_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<PoolRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path).context("Failed to read pool record")?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&data)
            .map(Some)
            .context("Failed to parse pool record JSON")
    }

    pub fn save(&self, record: &PoolRecord) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(record).context("Failed to serialize pool record")?;
        fs::write(&self.path, json).context("Failed to write pool record")?;
        Ok(())
    }
}

/// Values given on the command line; each one wins over the stored record.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub gateway_url: Option<String>,
    pub pool: Option<String>,
    pub account: Option<String>,
    pub spender: Option<String>,
    pub ticker: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub network: NetworkEnv,
    pub gateway_url: String,
    pub pool: Address,
    pub account: Address,
    pub spender: Option<Address>,
    pub ticker: Option<String>,
    pub refresh_delay: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl AppConfig {
    pub fn resolve(
        network: NetworkEnv,
        overrides: Overrides,
        record: Option<&PoolRecord>,
    ) -> Result<Self> {
        let gateway_url = overrides
            .gateway_url
            .or_else(|| record.map(|r| r.gateway_url.clone()))
            .unwrap_or_else(|| network.default_gateway_url().to_string());
        let pool = overrides
            .pool
            .or_else(|| record.map(|r| r.pool.clone()))
            .ok_or_else(|| anyhow!("No pool configured for {network}; pass --pool"))?;
        let account = overrides
            .account
            .ok_or_else(|| anyhow!("No account given; pass --account"))?;
        let spender = overrides
            .spender
            .or_else(|| record.and_then(|r| r.spender.clone()));
        let ticker = overrides
            .ticker
            .or_else(|| record.and_then(|r| r.ticker.clone()));

        Ok(Self {
            network,
            gateway_url,
            pool: parse_address("pool", &pool)?,
            account: parse_address("account", &account)?,
            spender: spender
                .map(|raw| parse_address("spender", &raw))
                .transpose()?,
            ticker,
            refresh_delay: DEFAULT_REFRESH_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        })
    }

    pub fn to_record(&self) -> PoolRecord {
        PoolRecord {
            saved_at: Utc::now().to_rfc3339(),
            pool: self.pool.to_string(),
            gateway_url: self.gateway_url.clone(),
            spender: self.spender.map(|s| s.to_string()),
            ticker: self.ticker.clone(),
        }
    }
}

fn parse_address(field: &str, raw: &str) -> Result<Address> {
    raw.parse()
        .map_err(|err| anyhow!("Invalid {field} address '{raw}': {err}"))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use tempdir::TempDir;

    const POOL: &str = "0x5050505050505050505050505050505050505050";
    const ALICE: &str = "0xa1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1";

    fn overrides() -> Overrides {
        Overrides {
            pool: Some(POOL.to_string()),
            account: Some(ALICE.to_string()),
            ..Overrides::default()
        }
    }

    #[test]
    fn store__round_trips_a_record() {
        // given
        let dir = TempDir::new("pools").unwrap();
        let store = PoolStore::new(dir.path(), NetworkEnv::Testnet).unwrap();
        let config = AppConfig::resolve(NetworkEnv::Testnet, overrides(), None).unwrap();

        // when
        store.save(&config.to_record()).unwrap();
        let loaded = store.load().unwrap().unwrap();

        // then
        assert_eq!(loaded.pool, POOL);
        assert_eq!(loaded.gateway_url, NetworkEnv::Testnet.default_gateway_url());
        assert!(store.path().ends_with("testnet/pool.json"));
    }

    #[test]
    fn store__missing_file_loads_nothing() {
        let dir = TempDir::new("pools").unwrap();
        let store = PoolStore::new(dir.path(), NetworkEnv::Local).unwrap();

        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn resolve__flags_override_record() {
        // given
        let record = PoolRecord {
            saved_at: Utc::now().to_rfc3339(),
            pool: "0x0101010101010101010101010101010101010101".to_string(),
            gateway_url: "http://stored".to_string(),
            spender: None,
            ticker: Some("USDC".to_string()),
        };
        let overrides = Overrides {
            gateway_url: Some("http://flag".to_string()),
            ..overrides()
        };

        // when
        let config = AppConfig::resolve(NetworkEnv::Local, overrides, Some(&record)).unwrap();

        // then
        assert_eq!(config.gateway_url, "http://flag");
        assert_eq!(config.pool.to_string(), POOL);
        assert_eq!(config.ticker.as_deref(), Some("USDC"));
    }

    #[test]
    fn resolve__requires_pool_and_account() {
        let no_pool = Overrides {
            account: Some(ALICE.to_string()),
            ..Overrides::default()
        };
        let bad_account = Overrides {
            account: Some("0x12".to_string()),
            ..overrides()
        };

        assert!(AppConfig::resolve(NetworkEnv::Local, no_pool, None).is_err());
        assert!(AppConfig::resolve(NetworkEnv::Local, bad_account, None).is_err());
    }
}
