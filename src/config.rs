use anyhow::Context;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8888";
const DEFAULT_PUBLIC_LAUNCH_URL: &str = "https://imogen.herokuapp.com/launch";
const DEFAULT_SECURITY_GROUP: &str = "CloudMan";
const DEFAULT_KEY_PAIR_NAME: &str = "cloudman_key_pair";

// -----------------------------------------------------------------------------
// Models
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Where the home page sends visitors that did not reach us over loopback.
    pub public_launch_url: String,
    pub security_group: String,
    pub key_pair_name: String,
}

// -----------------------------------------------------------------------------
// Functions
// -----------------------------------------------------------------------------

impl Config {
    /// Reads the configuration from the process environment, honouring `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .context("DATABASE_URL not found in environment variables.")?;

        let or_default = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Config {
            database_url,
            bind_address: or_default("BIND_ADDRESS", DEFAULT_BIND_ADDRESS),
            public_launch_url: or_default("PUBLIC_LAUNCH_URL", DEFAULT_PUBLIC_LAUNCH_URL),
            security_group: or_default("SECURITY_GROUP", DEFAULT_SECURITY_GROUP),
            key_pair_name: or_default("KEY_PAIR_NAME", DEFAULT_KEY_PAIR_NAME),
        })
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
