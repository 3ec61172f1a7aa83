// Application configuration.
// Logging can only be switched off in development builds.

use crate::error::CallError;
use crate::peer::types::ServerConfig;
use crate::session::Paths;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // debug builds log

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // release builds stay quiet

#[cfg(debug_assertions)]
pub mod dev {
    // Flip to false to silence logging in a debug build.
    // Only honoured in debug builds.
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Invitations older than this are never reported.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(15);

pub const DEFAULT_CANDIDATE_POOL_SIZE: u8 = 10;

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Runtime settings shared by the scanner, the controller and the peer factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    pub freshness_window_secs: u64,
    pub rescan_interval_secs: u64,
    pub calls_root: String,
    pub users_root: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            ice_candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
            freshness_window_secs: DEFAULT_FRESHNESS_WINDOW.as_secs(),
            rescan_interval_secs: DEFAULT_RESCAN_INTERVAL.as_secs(),
            calls_root: "calls".into(),
            users_root: "users".into(),
        }
    }
}

impl CallConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, CallError> {
        let config: CallConfig =
            serde_json::from_str(raw).map_err(|e| CallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CallError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Checks the ICE server list and the store roots.
    pub fn validate(&self) -> Result<(), CallError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::InvalidIceServer(format!(
                    "server {} has an empty url",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::InvalidIceServer(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }

        if self.calls_root.is_empty() || self.users_root.is_empty() {
            return Err(CallError::Config("store roots must not be empty".into()));
        }
        if self.rescan_interval_secs == 0 {
            return Err(CallError::Config("rescanIntervalSecs must be positive".into()));
        }
        Ok(())
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn paths(&self) -> Paths {
        Paths::new(&self.calls_root, &self.users_root)
    }
}
