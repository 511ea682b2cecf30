use std::path::Path;
use std::time::Duration;

use ipaclinker_core::peer::CandidateFilter;
use ipaclinker_core::protocol::node_id::NodeId;
use ipaclinker_core::transport::IceServer;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mapping::client::ClientOptions;
use crate::mapping::server::ServerOptions;

pub const DEFAULT_SIGNAL_PORT: u16 = 61477;
pub const DEFAULT_WELCOME: &str = "您正在通过 IpacLinker P2P 连接访问服务器!";

/// Process configuration, read from a JSON file. Every field is optional.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub client: ClientSection,
    pub server: ServerSection,
    pub exclude_candidate_pair: ExcludeCandidatePair,
    pub signal: SignalSection,
    /// Relay address, `host:port`.
    pub signal_server: String,
    pub ice_server: Vec<String>,
    pub debug: bool,
    pub timings: Timings,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ClientSection {
    pub enable: bool,
    pub list: Vec<ClientMapping>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ClientMapping {
    /// Server identity to connect to.
    pub server: String,
    /// Local port to open.
    pub port: u16,
    pub uuid: Option<String>,
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ServerSection {
    pub enable: bool,
    pub list: Vec<ServerMapping>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ServerMapping {
    pub uuid: Option<String>,
    /// Local port the tunnel connects to.
    pub port: u16,
    pub name: Option<String>,
    /// Welcome text sent to every client once its session is up.
    pub msg: Option<String>,
    /// Prefix each local connection with a PROXY protocol header.
    pub proxy_protocol_v2: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExcludeCandidatePair {
    pub list: Vec<String>,
    /// Apply the list to servers only.
    pub server_only: bool,
}

impl Default for ExcludeCandidatePair {
    fn default() -> Self {
        Self {
            list: vec![
                r"^.+ff:fe.{2}:.+$".to_string(),
                r"^192\.168\..+$".to_string(),
                r"^100\..+$".to_string(),
            ],
            server_only: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SignalSection {
    pub enable: bool,
    pub port: u16,
}

impl Default for SignalSection {
    fn default() -> Self {
        Self {
            enable: false,
            port: DEFAULT_SIGNAL_PORT,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct Timings {
    pub connect_poll_interval_ms: u64,
    pub connect_poll_attempts: u32,
    pub restart_delay_ms: u64,
    pub liveness_interval_ms: u64,
    pub reconnect_interval_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_poll_interval_ms: 3000,
            connect_poll_attempts: 10,
            restart_delay_ms: 4000,
            liveness_interval_ms: 1000,
            reconnect_interval_ms: 1000,
        }
    }
}

impl Timings {
    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientSection::default(),
            server: ServerSection::default(),
            exclude_candidate_pair: ExcludeCandidatePair::default(),
            signal: SignalSection::default(),
            signal_server: format!("127.0.0.1:{DEFAULT_SIGNAL_PORT}"),
            ice_server: vec![
                "stun:stun.zoiper.com".to_string(),
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun.gmx.net".to_string(),
                "stun:stun.schlund.de".to_string(),
                "turn:openrelayproject:openrelayproject@openrelay.metered.ca:80".to_string(),
                "turn:free:free@freeturn.net:3478".to_string(),
            ],
            debug: false,
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Reads the config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Config> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_json(text: &str) -> Result<Config> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_server.iter().map(|s| IceServer::parse(s)).collect()
    }

    fn unnamed_servers(&self) -> usize {
        if !self.server.enable {
            return 0;
        }
        self.server
            .list
            .iter()
            .filter(|item| item.name.as_deref().map_or(true, str::is_empty))
            .count()
    }

    pub fn candidate_filter(&self) -> Result<CandidateFilter> {
        CandidateFilter::from_patterns(&self.exclude_candidate_pair.list)
            .map_err(|e| Error::Config(format!("exclude_candidate_pair: {e}")))
    }

    /// Validated client mappings, empty when the client role is disabled.
    pub fn client_mappings(&self) -> Result<Vec<ClientOptions>> {
        if !self.client.enable {
            return Ok(Vec::new());
        }
        let filter = if self.exclude_candidate_pair.server_only {
            CandidateFilter::default()
        } else {
            self.candidate_filter()?
        };
        // unnamed mappings are numbered across both lists, servers first
        let mut unnamed = self.unnamed_servers();
        let mut mappings = Vec::with_capacity(self.client.list.len());
        for item in &self.client.list {
            let name = mapping_name(item.name.as_deref(), &mut unnamed);
            if item.server.is_empty() {
                return Err(Error::Config(format!("[{name}] client mapping without server")));
            }
            if item.port == 0 {
                return Err(Error::Config(format!("[{name}] client mapping without port")));
            }
            let server = NodeId::new(item.server.as_str())
                .map_err(|e| Error::Config(format!("[{name}] {e}")))?;
            let uuid = resolve_uuid(&name, item.uuid.as_deref())?;
            mappings.push(ClientOptions {
                name,
                server,
                uuid,
                port: item.port,
                signal_server: self.signal_server.clone(),
                filter: filter.clone(),
                timings: self.timings,
            });
        }
        Ok(mappings)
    }

    /// Validated server mappings, empty when the server role is disabled.
    pub fn server_mappings(&self) -> Result<Vec<ServerOptions>> {
        if !self.server.enable {
            return Ok(Vec::new());
        }
        let filter = self.candidate_filter()?;
        let mut unnamed = 0;
        let mut mappings = Vec::with_capacity(self.server.list.len());
        for item in &self.server.list {
            let name = mapping_name(item.name.as_deref(), &mut unnamed);
            if item.port == 0 {
                return Err(Error::Config(format!("[{name}] server mapping without port")));
            }
            let uuid = resolve_uuid(&name, item.uuid.as_deref())?;
            if item.uuid.as_deref().map_or(true, str::is_empty) {
                log::warn!("[{name}] no uuid configured, clients must use the random Server[{uuid}]");
            }
            mappings.push(ServerOptions {
                name,
                uuid,
                port: item.port,
                msg: item
                    .msg
                    .clone()
                    .unwrap_or_else(|| DEFAULT_WELCOME.to_string()),
                proxy_protocol: item.proxy_protocol_v2,
                signal_server: self.signal_server.clone(),
                filter: filter.clone(),
                timings: self.timings,
            });
        }
        Ok(mappings)
    }
}

fn mapping_name(name: Option<&str>, unnamed: &mut usize) -> String {
    match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            *unnamed += 1;
            format!("#{unnamed}")
        }
    }
}

fn resolve_uuid(name: &str, uuid: Option<&str>) -> Result<NodeId> {
    match uuid {
        Some(uuid) if !uuid.is_empty() => {
            NodeId::new(uuid).map_err(|e| Error::Config(format!("[{name}] {e}")))
        }
        _ => Ok(NodeId::random()),
    }
}
