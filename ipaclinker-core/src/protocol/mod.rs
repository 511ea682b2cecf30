//! Signaling wire messages.
//!
//! Every message travels as `{ "type": <name>, "data": <payload> }`. Requests
//! flow from nodes to the relay, [`RelayMessage`]s flow back. The `buf` of a
//! signal is opaque to the relay: it is forwarded verbatim.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod node_id;

/// Version both sides of a mapping must agree on.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Messages a node sends to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    ServerReg(ServerReg),
    ClientReg(ClientReg),
    ServerSendSignal(SignalEnvelope),
    ClientSendSignal(SignalEnvelope),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerReg {
    pub version: String,
    pub server: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientReg {
    pub version: String,
    pub server: String,
    pub uuid: String,
}

/// A signal addressed to the other side of a server/client pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub server: String,
    pub uuid: String,
    pub event: SignalEvent,
    pub buf: Value,
}

/// Messages the relay sends to a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum RelayMessage {
    /// Reply to a server registration.
    ServerReg(Ack),
    /// Reply to a client registration, sent to the client.
    ClientReg(Ack),
    /// A client registered against this server.
    #[serde(rename = "client_registered")]
    ClientRegistered(ClientArrived),
    /// A registered client lost its relay connection.
    #[serde(rename = "client_unregister")]
    ClientUnregister(ClientLeft),
    /// Signal from the server, delivered to a client.
    #[serde(rename = "serverSignal")]
    ServerSignal(Signal),
    /// Signal from a client, delivered to the server.
    #[serde(rename = "clientSignal")]
    ClientSignal(Signal),
    #[serde(rename = "errMsg")]
    ErrMsg(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientArrived {
    pub uuid: String,
    pub ip: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientLeft {
    pub uuid: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Signal {
    pub event: SignalEvent,
    pub buf: Value,
    pub uuid: String,
}

impl Signal {
    pub fn decode<T: DeserializeOwned>(&self) -> crate::error::Result<T> {
        Ok(T::deserialize(&self.buf)?)
    }
}

/// What a signal's `buf` carries.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalEvent {
    #[serde(rename = "client_signal_description")]
    ClientDescription,
    #[serde(rename = "client_signal_candidate")]
    ClientCandidate,
    #[serde(rename = "server_signal_description")]
    ServerDescription,
    #[serde(rename = "server_signal_candidate")]
    ServerCandidate,
    #[serde(rename = "clientMsg")]
    ClientMsg,
    #[serde(rename = "serverMsg")]
    ServerMsg,
    #[serde(rename = "errMsg")]
    ErrMsg,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged during negotiation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// ICE candidate in its textual form plus the media id it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub mid: String,
}

impl IceCandidate {
    /// The address field, i.e. the fifth whitespace-delimited token of
    /// `candidate:<foundation> <component> <proto> <priority> <address> ...`.
    pub fn address(&self) -> Option<&str> {
        self.candidate.split_whitespace().nth(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope() {
        let req = Request::ClientReg(ClientReg {
            version: PROTOCOL_VERSION.to_string(),
            server: "S1".to_string(),
            uuid: "C1".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "ClientReg", "data": {"version": "0.1", "server": "S1", "uuid": "C1"}})
        );
    }

    #[test]
    fn test_relay_message_names() {
        let msg = RelayMessage::ClientSignal(Signal {
            event: SignalEvent::ClientCandidate,
            buf: json!({"candidate": "c", "mid": "0"}),
            uuid: "C1".to_string(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "clientSignal");
        assert_eq!(value["data"]["event"], "client_signal_candidate");

        let msg: RelayMessage =
            serde_json::from_value(json!({"type": "errMsg", "data": "boom"})).unwrap();
        assert_eq!(msg, RelayMessage::ErrMsg("boom".to_string()));
    }

    #[test]
    fn test_description_shape() {
        let desc: SessionDescription =
            serde_json::from_value(json!({"type": "offer", "sdp": "v=0"})).unwrap();
        assert_eq!(desc.kind, SdpType::Offer);
    }

    #[test]
    fn test_candidate_address() {
        let cand = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.7 50000 typ host".to_string(),
            mid: "0".to_string(),
        };
        assert_eq!(cand.address(), Some("192.168.1.7"));
        let short = IceCandidate {
            candidate: "candidate:1 1 udp".to_string(),
            mid: String::new(),
        };
        assert_eq!(short.address(), None);
    }
}
