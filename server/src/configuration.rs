//! Runtime configuration, read from the `BATTLESHIP_*` environment.

use std::env;
use std::path::PathBuf;

use tracing::warn;

/// Everything the arena needs to start, with defaults suitable for a local
/// instance.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Listen address shared by the web API and the external SSH transport.
    pub host: String,
    /// Port the external SSH transport listens on. The arena itself never
    /// binds it; it is surfaced to users in upload instructions.
    pub ssh_port: u16,
    /// Port for the web API and event stream.
    pub web_port: u16,
    /// Root of the canonical upload tree (`<dir>/<username>/<filename>`).
    pub upload_dir: PathBuf,
    /// SQLite database path.
    pub results_db: PathBuf,
    /// Root of the game engine checkout (sources staged under `src/`,
    /// binaries under `build/`).
    pub engine_path: PathBuf,
    /// Shared secret enabling the admin upload override.
    pub admin_passcode: String,
    /// Public URL shown to users; cosmetic only.
    pub external_url: String,
    /// Run submissions without the systemd sandbox (development only).
    pub allow_unsandboxed: bool,
}

impl Configuration {
    /// Read the configuration from the environment.
    ///
    /// Recognized variables: `BATTLESHIP_HOST`, `BATTLESHIP_SSH_PORT`,
    /// `BATTLESHIP_WEB_PORT`, `BATTLESHIP_UPLOAD_DIR`,
    /// `BATTLESHIP_RESULTS_DB`, `BATTLESHIP_ENGINE_PATH`,
    /// `BATTLESHIP_ADMIN_PASSCODE`, `BATTLESHIP_EXTERNAL_URL`,
    /// `BATTLESHIP_ALLOW_UNSANDBOXED`. Unset variables fall back to
    /// defaults; unparseable ports fall back with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Configuration {
            host: get_env("BATTLESHIP_HOST", "0.0.0.0"),
            ssh_port: get_port("BATTLESHIP_SSH_PORT", 2222),
            web_port: get_port("BATTLESHIP_WEB_PORT", 8081),
            upload_dir: PathBuf::from(get_env("BATTLESHIP_UPLOAD_DIR", "./submissions")),
            results_db: PathBuf::from(get_env("BATTLESHIP_RESULTS_DB", "./results.db")),
            engine_path: PathBuf::from(get_env("BATTLESHIP_ENGINE_PATH", "./battleship-engine")),
            admin_passcode: get_env("BATTLESHIP_ADMIN_PASSCODE", "battleship-admin-override"),
            external_url: get_env("BATTLESHIP_EXTERNAL_URL", "http://localhost:8081"),
            allow_unsandboxed: get_bool("BATTLESHIP_ALLOW_UNSANDBOXED"),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_port(key: &str, default: u16) -> u16 {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value.parse().unwrap_or_else(|_| {
            warn!("{key}={value} is not a valid port, using {default}");
            default
        }),
        _ => default,
    }
}

fn get_bool(key: &str) -> bool {
    matches!(
        env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test so the BATTLESHIP_* variables are not mutated from
    // parallel tests.
    #[test]
    fn env_overrides_and_defaults() {
        env::remove_var("BATTLESHIP_HOST");
        env::set_var("BATTLESHIP_WEB_PORT", "9090");
        env::set_var("BATTLESHIP_SSH_PORT", "not-a-port");
        env::set_var("BATTLESHIP_UPLOAD_DIR", "/tmp/uploads");
        env::set_var("BATTLESHIP_ALLOW_UNSANDBOXED", "true");

        let config = Configuration::from_env();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.web_port, 9090);
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.upload_dir, PathBuf::from("/tmp/uploads"));
        assert_eq!(config.admin_passcode, "battleship-admin-override");
        assert!(config.allow_unsandboxed);

        env::remove_var("BATTLESHIP_WEB_PORT");
        env::remove_var("BATTLESHIP_SSH_PORT");
        env::remove_var("BATTLESHIP_UPLOAD_DIR");
        env::remove_var("BATTLESHIP_ALLOW_UNSANDBOXED");
    }
}
