use serde::Deserialize;

/// Server configuration, loaded from a JSON file.
///
/// Every section has defaults so a missing file yields a runnable (if
/// push-less) server; a malformed file is a startup error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub push: PushConfig,
    pub apns: ApnsConfig,
    pub gcm: GcmConfig,
    pub rotation: RotationConfig,
    pub cleanup: CleanupConfig,
}

/// Wake-up push scheduling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PushConfig {
    /// Coalescing window between wake attempts per client (ms).
    pub rate_limit_ms: u64,
    /// Bounded worker pool for provider calls, sized independently
    /// from the RPC pool.
    pub thread_pool_size: usize,
    /// Network timeout for provider HTTP calls (ms).
    pub provider_timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            rate_limit_ms: 15_000,
            thread_pool_size: 4,
            provider_timeout_ms: 10_000,
        }
    }
}

/// APNS provider settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApnsConfig {
    pub enabled: bool,
    /// One certificate bundle per (logical client name, variant).
    pub certificates: Vec<ApnsCertificate>,
}

/// A certificate bundle for one client app variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApnsCertificate {
    /// Logical client/app name reported by the client.
    pub client_name: String,
    /// Production vs sandbox gateway.
    pub production: bool,
    pub cert_path: String,
    pub cert_password: String,
}

/// GCM provider settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GcmConfig {
    pub enabled: bool,
    pub api_key: String,
}

/// Group key rotation marker bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RotationConfig {
    /// A rotation marker older than this is considered abandoned and
    /// may be stolen by the next rotation attempt (ms).
    pub stale_after_ms: i64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 30_000,
        }
    }
}

/// Scheduling hints for the external retention sweep. Recognized and
/// passed through; the sweep itself runs outside this daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CleanupConfig {
    pub all_clients_delay_ms: u64,
    pub all_clients_interval_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            all_clients_delay_ms: 60_000,
            all_clients_interval_ms: 3_600_000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file. A missing path yields defaults.
    pub fn load(path: &str) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                serde_json::from_str(&text).map_err(|e| format!("invalid config {path}: {e}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path, "no config file — using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(format!("failed to read config {path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.push.rate_limit_ms, 15_000);
        assert_eq!(cfg.push.thread_pool_size, 4);
        assert!(!cfg.gcm.enabled);
        assert!(!cfg.apns.enabled);
        assert_eq!(cfg.rotation.stale_after_ms, 30_000);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: ServerConfig = serde_json::from_str(
            r#"{"gcm": {"enabled": true, "apiKey": "k"}, "push": {"rateLimitMs": 500}}"#,
        )
        .unwrap();
        assert!(cfg.gcm.enabled);
        assert_eq!(cfg.gcm.api_key, "k");
        assert_eq!(cfg.push.rate_limit_ms, 500);
        assert_eq!(cfg.push.thread_pool_size, 4);
    }
}
