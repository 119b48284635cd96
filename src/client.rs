//! Client façade over the UDP underlay.
//!
//! Holds the configuration, owns at most one live underlay, and exposes
//! the dial path. The underlay auto-closes when its last session is
//! removed; the next dial transparently builds a fresh one.

use crate::crypto::BlockCipher;
use crate::net::session::Session;
use crate::net::udp::UdpUnderlay;
use crate::net::underlay::{TransportError, Underlay};
use crate::replay::ReplayCache;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum serialized config file size accepted on load.
const MAX_CONFIG_FILE_SIZE: u64 = 64 * 1024;

/// Per-attempt wait for the open-session response.
const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Open requests sent before a dial gives up.
const DIAL_ATTEMPTS: usize = 3;

/// Default MTU when the config does not set one.
pub const DEFAULT_MTU: usize = 1400;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("client is not running")]
    NotRunning,

    #[error("client is already running")]
    AlreadyRunning,

    #[error("no configuration loaded")]
    NoConfig,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Candidate identities known to the server. The client dials with
    /// exactly one of them; see [`ClientConfig::dial_profile`].
    pub profiles: Vec<UserProfile>,
    /// Username of the profile dials use. Unset means the first profile.
    pub active_profile: Option<String>,
    pub server_addr: SocketAddr,
    pub mtu: usize,
}

impl ClientConfig {
    pub fn new(profile: UserProfile, server_addr: SocketAddr) -> Self {
        Self {
            profiles: vec![profile],
            active_profile: None,
            server_addr,
            mtu: DEFAULT_MTU,
        }
    }

    /// The profile dials run under. A client underlay carries exactly one
    /// candidate cipher, so this selection is what narrows the list down.
    pub fn dial_profile(&self) -> Result<&UserProfile, ClientError> {
        match &self.active_profile {
            Some(name) => self
                .profiles
                .iter()
                .find(|p| &p.username == name)
                .ok_or_else(|| {
                    ClientError::InvalidConfig(format!("no profile named {:?}", name))
                }),
            None => self
                .profiles
                .first()
                .ok_or_else(|| ClientError::InvalidConfig("no user profiles".into())),
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.profiles.is_empty() {
            return Err(ClientError::InvalidConfig(
                "at least one user profile is required".into(),
            ));
        }
        for profile in &self.profiles {
            if profile.username.is_empty() {
                return Err(ClientError::InvalidConfig("empty username".into()));
            }
        }
        if let Some(name) = &self.active_profile {
            if !self.profiles.iter().any(|p| &p.username == name) {
                return Err(ClientError::InvalidConfig(format!(
                    "active profile {:?} is not in the profile list",
                    name
                )));
            }
        }
        if self.mtu < 256 {
            return Err(ClientError::InvalidConfig(format!(
                "mtu {} is too small",
                self.mtu
            )));
        }
        Ok(())
    }

    /// Load from a bincode file, rejecting oversized files before
    /// deserialization.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let data = std::fs::read(&path)?;
        if data.len() as u64 > MAX_CONFIG_FILE_SIZE {
            return Err(ClientError::InvalidConfig(format!(
                "config file too large: {} bytes",
                data.len()
            )));
        }
        let config: ClientConfig = bincode::deserialize(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ClientError> {
        let data = bincode::serialize(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

/// The high-level client: config lifecycle, start/stop, dial.
pub struct Client {
    config: Mutex<Option<ClientConfig>>,
    running: AtomicBool,
    replay: Arc<ReplayCache>,
    underlay: tokio::sync::Mutex<Option<Arc<UdpUnderlay>>>,
}

impl Client {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(None),
            running: AtomicBool::new(false),
            replay: Arc::new(ReplayCache::default()),
            underlay: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the configuration. Rejected while the client runs.
    pub fn set_config(&self, config: ClientConfig) -> Result<(), ClientError> {
        if self.is_running() {
            return Err(ClientError::AlreadyRunning);
        }
        config.validate()?;
        *self.lock_config() = Some(config);
        Ok(())
    }

    pub fn config(&self) -> Option<ClientConfig> {
        self.lock_config().clone()
    }

    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<(), ClientError> {
        self.set_config(ClientConfig::load(path)?)
    }

    pub fn store_config<P: AsRef<Path>>(&self, path: P) -> Result<(), ClientError> {
        match self.config() {
            Some(config) => config.save(path),
            None => Err(ClientError::NoConfig),
        }
    }

    pub fn start(&self) -> Result<(), ClientError> {
        if self.lock_config().is_none() {
            return Err(ClientError::NoConfig);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyRunning);
        }
        debug!("client started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(underlay) = self.underlay.lock().await.take() {
            underlay.close();
        }
        debug!("client stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open a new session to the configured server. Retries the open
    /// request a few times before reporting a dial timeout.
    pub async fn dial(&self) -> Result<Arc<Session>, ClientError> {
        if !self.is_running() {
            return Err(ClientError::NotRunning);
        }
        let config = self.config().ok_or(ClientError::NoConfig)?;
        let underlay = self.ensure_underlay(&config).await?;

        let session_id = {
            let mut rng = rand::thread_rng();
            loop {
                let id: u32 = rng.gen();
                if id != 0 {
                    break id;
                }
            }
        };

        let session = underlay.open_session(session_id, Vec::new()).await?;
        let mut dial_err = None;
        for attempt in 1..=DIAL_ATTEMPTS {
            if tokio::time::timeout(DIAL_RETRY_INTERVAL, session.ready())
                .await
                .is_ok()
            {
                return Ok(session);
            }
            if attempt < DIAL_ATTEMPTS {
                debug!(
                    "dial attempt {} for session {} timed out, resending",
                    attempt, session_id
                );
                if let Err(e) = session.send_open_request(Vec::new()).await {
                    dial_err = Some(ClientError::Transport(e));
                    break;
                }
            }
        }

        session.done_token().cancel();
        session.wait_loops().await;
        let _ = underlay.remove_session(session_id);
        Err(dial_err.unwrap_or(ClientError::Transport(TransportError::DialTimeout)))
    }

    /// Reuse the live underlay or build a fresh one (the previous may have
    /// auto-closed when its last session was removed).
    async fn ensure_underlay(
        &self,
        config: &ClientConfig,
    ) -> Result<Arc<UdpUnderlay>, ClientError> {
        let mut guard = self.underlay.lock().await;
        if let Some(underlay) = guard.as_ref() {
            if !underlay.is_closed() {
                return Ok(underlay.clone());
            }
        }

        // One candidate on the client side: the selected profile's cipher.
        let profile = config.dial_profile()?;
        let cipher = BlockCipher::from_credentials(&profile.username, &profile.password);
        let underlay = UdpUnderlay::new(
            "udp",
            None,
            Some(config.server_addr),
            config.mtu,
            vec![cipher],
            self.replay.clone(),
        )
        .await?;

        let event_underlay = underlay.clone();
        tokio::spawn(async move {
            if let Err(e) = event_underlay.run_event_loop(CancellationToken::new()).await {
                warn!("client event loop terminated: {}", e);
            }
        });

        *guard = Some(underlay.clone());
        Ok(underlay)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    fn lock_config(&self) -> std::sync::MutexGuard<'_, Option<ClientConfig>> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }
}
