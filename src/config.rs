//! Persistent application configuration model and defaults.

/// Root configuration persisted to `chordsync.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Hosted database and auth service settings.
    #[serde(default)]
    pub firebase: FirebaseConfig,
}

/// Connection settings for the hosted database and its auth service.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FirebaseConfig {
    /// Database base URL, e.g. `https://your-project.firebaseio.com`.
    #[serde(default)]
    pub database_url: String,
    /// Identity Toolkit web API key used for password sign-in.
    #[serde(default)]
    pub api_key: String,
    /// The single account identifier sign-in requests authenticate against.
    #[serde(default)]
    pub account_email: String,
    /// Collection the song records live under.
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            api_key: String::new(),
            account_email: String::new(),
            collection: default_collection(),
        }
    }
}

fn default_collection() -> String {
    "songs".to_string()
}
