//! Runtime configuration: identity, listen ports, TLS material location,
//! slot accounting, and reconnect policy.
//!
//! Deliberately thin — the full settings surface (geo-IP, language files,
//! GUI preferences) is a collaborator's concern, not this crate's (§1).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

/// How this client decides its own reachability for a given IP family.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityMode {
    /// Probe for a public address; fall back to UPnP/NAT-PMP, then passive.
    AutoDetect,
    /// Known-public address and port; always advertise active.
    Active,
    /// Behind a NAT we can't map; always advertise passive.
    Passive,
}

/// Per-family listener configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FamilyConfig {
    /// Reachability detection mode for this family.
    pub mode: ConnectivityMode,
    /// Plain TCP listen port (0 = let the OS choose).
    pub tcp_port: u16,
    /// TLS listen port (0 = let the OS choose).
    pub tls_port: u16,
    /// Externally-visible address, set by auto-detect or the port mapper.
    #[serde(skip)]
    pub external_ip: Option<std::net::IpAddr>,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            mode: ConnectivityMode::AutoDetect,
            tcp_port: 0,
            tls_port: 0,
            external_ip: None,
        }
    }
}

/// Download/upload slot and multi-source-connection settings (§4.G).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SlotConfig {
    /// Global simultaneous download slots.
    pub download_slots: u32,
    /// Global simultaneous upload slots.
    pub upload_slots: u32,
    /// First-attempt CQIs allowed per second, before the `* 2` MCN multiplier.
    pub downconn_per_sec: u32,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            download_slots: 6,
            upload_slots: 6,
            downconn_per_sec: 2,
        }
    }
}

/// Top-level configuration for one running client instance.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Display nick advertised in `INF`/`MyINFO`.
    pub nick: String,
    /// Free-text description advertised in `INF DE`.
    pub description: String,
    /// Email advertised in `INF EM`.
    pub email: String,
    /// Directory holding `identity.pid` (24 raw bytes) and TLS certs.
    pub state_dir: PathBuf,
    /// IPv4 listener configuration.
    pub v4: FamilyConfig,
    /// IPv6 listener configuration.
    pub v6: FamilyConfig,
    /// Slot/MCN accounting.
    pub slots: SlotConfig,
    /// Reconnect delay applied when a hub session drops unexpectedly.
    pub reconnect_delay_secs: u64,
    /// Whether TLS is required for all hub/peer connections.
    pub require_tls: bool,
    /// Accept self-signed peer leafs with only a warning (no keyprint pin).
    pub allow_untrusted_tls: bool,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::data_local_dir()
            .map(|d| d.join("adcore"))
            .unwrap_or_else(|| PathBuf::from("adcore-state"));

        Self {
            nick: "adcore-user".to_string(),
            description: String::new(),
            email: String::new(),
            state_dir,
            v4: FamilyConfig::default(),
            v6: FamilyConfig::default(),
            slots: SlotConfig::default(),
            reconnect_delay_secs: 60,
            require_tls: false,
            allow_untrusted_tls: true,
        }
    }
}

impl Config {
    /// Directory holding TLS certs and the generated identity, creating it
    /// if necessary.
    pub fn certs_dir(&self) -> Result<PathBuf> {
        let dir = self.state_dir.join("certs");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create certs dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from `{dir}/config.json`, falling back to
    /// `Default` if absent, then applies `ADCORE_*` environment overrides.
    pub fn load(dir: &std::path::Path) -> Result<Self> {
        let mut config = Self::load_from_file(dir).unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(dir: &std::path::Path) -> Result<Self> {
        let path = dir.join("config.json");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(nick) = std::env::var("ADCORE_NICK") {
            self.nick = nick;
        }
        if let Ok(dir) = std::env::var("ADCORE_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var("ADCORE_REQUIRE_TLS") {
            self.require_tls = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Persists the configuration to `{dir}/config.json` with owner-only
    /// permissions.
    pub fn save(&self, dir: &std::path::Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_slot_values() {
        let config = Config::default();
        assert!(config.slots.download_slots > 0);
        assert!(config.slots.upload_slots > 0);
        assert_eq!(config.v4.mode, ConnectivityMode::AutoDetect);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nick, config.nick);
        assert_eq!(back.slots.download_slots, config.slots.download_slots);
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.nick = "saved-nick".to_string();
        config.save(tmp.path()).unwrap();

        let loaded = Config::load(tmp.path()).unwrap();
        assert_eq!(loaded.nick, "saved-nick");
    }
}
