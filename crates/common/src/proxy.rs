use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

const RELAYS_FILE: &str = "relays.json";

/// Relay protocol/scheme
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    /// HTTP relay (default)
    #[default]
    Http,
    /// HTTPS relay
    Https,
    /// SOCKS5 relay
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

impl FromStr for ProxyScheme {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" => Ok(Self::Socks5),
            _ => Err(()),
        }
    }
}

/// One external relay the browser can be launched behind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub scheme: ProxyScheme,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RelayEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: ProxyScheme::Http,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Value for Chrome's `--proxy-server` flag.
    ///
    /// Credentials are never embedded here; Chrome ignores them for HTTPS
    /// targets, so pages authenticate through the fetch domain instead.
    pub fn proxy_server(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }

    /// Full `--proxy-server=` launch argument
    pub fn launch_arg(&self) -> String {
        format!("--proxy-server={}", self.proxy_server())
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    fn same_address(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }
}

/// Source of the relay used for the next browser launch.
///
/// The resource manager asks its provider once per launch, so rotating
/// providers move every restart to a different relay.
///
/// # Example
///
/// ```rust,ignore
/// use scrape_hive_common::proxy::{ProxyProvider, RelayEndpoint};
///
/// #[derive(Debug, Clone)]
/// struct OfficeRelay;
///
/// impl ProxyProvider for OfficeRelay {
///     fn next_endpoint(&self) -> anyhow::Result<Option<RelayEndpoint>> {
///         Ok(Some(RelayEndpoint::new("10.0.0.5", 3128)))
///     }
///
///     fn name(&self) -> &str {
///         "office_relay"
///     }
///
///     fn clone_box(&self) -> Box<dyn ProxyProvider> {
///         Box::new(self.clone())
///     }
/// }
/// ```
pub trait ProxyProvider: Debug + Send + Sync {
    /// Relay for the next launch, or None for a direct connection
    fn next_endpoint(&self) -> Result<Option<RelayEndpoint>>;

    /// Get unique identifier for this provider (used in logging)
    fn name(&self) -> &str;

    /// Clone this provider into a Box
    fn clone_box(&self) -> Box<dyn ProxyProvider>;
}

/// Make Box<dyn ProxyProvider> cloneable
impl Clone for Box<dyn ProxyProvider> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Persisted list of relay endpoints, handed out round-robin.
///
/// Stored as `relays.json` in the data directory. Clones share the same
/// list and cursor.
#[derive(Debug, Clone)]
pub struct RelayRegistry {
    path: PathBuf,
    relays: Arc<RwLock<Vec<RelayEndpoint>>>,
    cursor: Arc<AtomicUsize>,
}

impl RelayRegistry {
    /// Load `relays.json` from `dir`, starting empty if the file is missing
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(RELAYS_FILE);
        let relays = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice::<Vec<RelayEndpoint>>(&bytes)?
        } else {
            Vec::new()
        };

        info!(path = %path.display(), relays = relays.len(), "Relay registry loaded");

        Ok(Self {
            path,
            relays: Arc::new(RwLock::new(relays)),
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Add a relay; an existing entry with the same host and port is replaced
    pub fn add(&self, endpoint: RelayEndpoint) -> Result<()> {
        let mut relays = self.write()?;
        match relays
            .iter_mut()
            .find(|r| r.same_address(&endpoint.host, endpoint.port))
        {
            Some(existing) => *existing = endpoint,
            None => relays.push(endpoint),
        }
        self.save(&relays)
    }

    /// Remove a relay by address; returns whether anything was removed
    pub fn remove(&self, host: &str, port: u16) -> Result<bool> {
        let mut relays = self.write()?;
        let before = relays.len();
        relays.retain(|r| !r.same_address(host, port));
        if relays.len() == before {
            return Ok(false);
        }
        self.save(&relays)?;
        Ok(true)
    }

    /// Next relay in rotation, None when the registry is empty
    pub fn next_relay(&self) -> Result<Option<RelayEndpoint>> {
        let relays = self
            .relays
            .read()
            .map_err(|_| anyhow!("relay registry lock poisoned"))?;
        if relays.is_empty() {
            return Ok(None);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % relays.len();
        Ok(relays.get(index).cloned())
    }

    pub fn list(&self) -> Vec<RelayEndpoint> {
        self.relays.read().map(|r| r.to_vec()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.relays.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<RelayEndpoint>>> {
        self.relays
            .write()
            .map_err(|_| anyhow!("relay registry lock poisoned"))
    }

    fn save(&self, relays: &[RelayEndpoint]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(relays)?)?;
        debug!(path = %self.path.display(), relays = relays.len(), "Relay registry saved");
        Ok(())
    }
}

impl ProxyProvider for RelayRegistry {
    fn next_endpoint(&self) -> Result<Option<RelayEndpoint>> {
        self.next_relay()
    }

    fn name(&self) -> &str {
        "relay_registry"
    }

    fn clone_box(&self) -> Box<dyn ProxyProvider> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_server_strips_credentials() {
        let relay = RelayEndpoint::new("relay.example.com", 8080).with_credentials("user", "pass");
        assert_eq!(relay.proxy_server(), "http://relay.example.com:8080");
        assert_eq!(
            relay.launch_arg(),
            "--proxy-server=http://relay.example.com:8080"
        );
        assert_eq!(
            relay.credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(RelayEndpoint::new("h", 1).credentials(), None);
    }

    #[test]
    fn test_scheme_from_str() {
        assert_eq!("SOCKS5".parse::<ProxyScheme>(), Ok(ProxyScheme::Socks5));
        assert!("ftp".parse::<ProxyScheme>().is_err());
    }

    #[test]
    fn test_registry_add_dedupes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RelayRegistry::load(dir.path()).unwrap();
        assert!(registry.is_empty());

        registry.add(RelayEndpoint::new("a.example", 3128)).unwrap();
        registry
            .add(RelayEndpoint::new("a.example", 3128).with_credentials("u", "p"))
            .unwrap();
        registry.add(RelayEndpoint::new("b.example", 3128)).unwrap();
        assert_eq!(registry.len(), 2);

        let reloaded = RelayRegistry::load(dir.path()).unwrap();
        let relays = reloaded.list();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_registry_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RelayRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.next_relay().unwrap(), None);

        registry.add(RelayEndpoint::new("a", 1)).unwrap();
        registry.add(RelayEndpoint::new("b", 2)).unwrap();

        let hosts: Vec<String> = (0..4)
            .map(|_| registry.next_relay().unwrap().unwrap().host)
            .collect();
        assert_eq!(hosts, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_registry_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RelayRegistry::load(dir.path()).unwrap();
        registry.add(RelayEndpoint::new("a", 1)).unwrap();

        assert!(!registry.remove("a", 2).unwrap());
        assert!(registry.remove("a", 1).unwrap());
        assert!(RelayRegistry::load(dir.path()).unwrap().is_empty());
    }
}
