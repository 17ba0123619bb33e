//! Relay-Discovery Konfiguration
//!
//! STUN/TURN Server-Liste und Candidate-Pool-Größe, die beim Anlegen
//! einer Peer Session übergeben werden.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Umgebungsvariable für die Server-Liste (kommagetrennt)
pub const ICE_SERVERS_ENV: &str = "ICE_SERVERS";

/// Umgebungsvariable für die Pool-Größe
pub const CANDIDATE_POOL_SIZE_ENV: &str = "ICE_CANDIDATE_POOL_SIZE";

const URL_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid ICE server URL: {0}")]
    InvalidServerUrl(String),

    #[error("No ICE servers configured")]
    NoServers,

    #[error("Invalid candidate pool size: {0}")]
    InvalidPoolSize(String),
}

// ============================================================================
// ICE CONFIG
// ============================================================================

/// Konfiguration für die Candidate-Suche
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<String>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            // Öffentliche Google STUN Server
            ice_servers: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            candidate_pool_size: 10,
        }
    }
}

impl IceConfig {
    /// Erstellt eine validierte Konfiguration
    pub fn new(ice_servers: Vec<String>, candidate_pool_size: u8) -> Result<Self, ConfigError> {
        let config = Self {
            ice_servers,
            candidate_pool_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Lädt die Konfiguration aus der Umgebung, fehlende Werte fallen auf
    /// die Defaults zurück
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ICE_SERVERS_ENV) {
            config.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(raw) = lookup(CANDIDATE_POOL_SIZE_ENV) {
            config.candidate_pool_size = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPoolSize(raw.clone()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Prüft Server-URLs auf ein bekanntes Schema
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ice_servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        for url in &self.ice_servers {
            if !URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(ConfigError::InvalidServerUrl(url.clone()));
            }
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
