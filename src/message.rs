//! Parent/child handshake messages.
//!
//! Each frame is a `u32` little-endian length header followed by that many
//! bytes of JSON. The JSON object carries a `Name` discriminator next to
//! exactly one variant payload, so a peer can dispatch on the name without
//! depending on structural typing.

use crate::errors::ProtocolError;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{Read, Write},
};

/// Largest accepted frame body. Bounded so the peer can allocate safely.
pub const MAX_FRAME_LEN: u32 = 65536;

/// One handshake frame: a name discriminator plus the matching payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Message {
        Message {
            name: payload.name().to_string(),
            payload,
        }
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Message {
        Message::new(payload)
    }
}

/// The tagged union of everything parent and child say to each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum Payload {
    ParentHello(ParentHello),
    ChildHello(ChildHello),
    ParentInitIdmapCompleted(ParentInitIdmapCompleted),
    ChildInitUserNSCompleted(ChildInitUserNSCompleted),
    ParentInitNetworkDriverCompleted(NetworkConfig),
    ParentInitPortDriverCompleted(PortDriverOpaque),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::ParentHello(_) => "ParentHello",
            Payload::ChildHello(_) => "ChildHello",
            Payload::ParentInitIdmapCompleted(_) => "ParentInitIdmapCompleted",
            Payload::ChildInitUserNSCompleted(_) => "ChildInitUserNSCompleted",
            Payload::ParentInitNetworkDriverCompleted(_) => "ParentInitNetworkDriverCompleted",
            Payload::ParentInitPortDriverCompleted(_) => "ParentInitPortDriverCompleted",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentHello {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildHello {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentInitIdmapCompleted {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildInitUserNSCompleted {}

/// What the network driver negotiated on the parent side.
///
/// All fields are empty for host networking. `opaque` is private to the
/// driver pair; the core only carries it across the pipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "Dev")]
    pub dev: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Netmask")]
    pub netmask: u8,
    #[serde(rename = "Gateway")]
    pub gateway: String,
    #[serde(rename = "DNS")]
    pub dns: Vec<String>,
    #[serde(rename = "MTU")]
    pub mtu: u32,
    #[serde(rename = "NetworkDriverOpaque")]
    pub opaque: HashMap<String, String>,
}

/// Driver-private context for the child half of the port driver.
/// Empty for port driver "none".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortDriverOpaque {
    #[serde(rename = "PortDriverOpaque")]
    pub opaque: HashMap<String, String>,
}

/// Serialize one message and write it as a single frame.
pub fn send<W: Write>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    log::debug!("sending {:?}", msg);
    let body = serde_json::to_vec(msg)?;
    if body.is_empty() || body.len() > MAX_FRAME_LEN as usize {
        return Err(ProtocolError::FrameLength(body.len() as u32));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read exactly one frame and decode it. Short reads are errors.
pub fn recv<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameLength(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    let msg: Message = serde_json::from_slice(&body)?;
    log::debug!("received {:?}", msg);
    Ok(msg)
}

/// Receive one message and require its name discriminator to match.
pub fn wait_for<R: Read>(reader: &mut R, expected: &str) -> Result<Message, ProtocolError> {
    let msg = recv(reader)?;
    if msg.name != expected {
        return Err(ProtocolError::UnexpectedMessage {
            expected: expected.to_string(),
            got: msg.name,
        });
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(payload: Payload) -> Message {
        let mut buf = Vec::new();
        send(&mut buf, &Message::new(payload)).unwrap();
        recv(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn hello_roundtrip() {
        let msg = roundtrip(Payload::ParentHello(ParentHello {}));
        assert_eq!(msg.name, "ParentHello");
        assert!(matches!(msg.payload, Payload::ParentHello(_)));
    }

    #[test]
    fn network_config_roundtrip() {
        let mut opaque = HashMap::new();
        opaque.insert("mac".to_string(), "02:00:00:00:00:01".to_string());
        let config = NetworkConfig {
            dev: "tap0".to_string(),
            ip: "10.0.2.100".to_string(),
            netmask: 24,
            gateway: "10.0.2.2".to_string(),
            dns: vec!["10.0.2.3".to_string()],
            mtu: 65520,
            opaque,
        };
        let msg = roundtrip(Payload::ParentInitNetworkDriverCompleted(config.clone()));
        assert_eq!(msg.name, "ParentInitNetworkDriverCompleted");
        match msg.payload {
            Payload::ParentInitNetworkDriverCompleted(got) => {
                assert_eq!(got.dev, config.dev);
                assert_eq!(got.ip, config.ip);
                assert_eq!(got.netmask, config.netmask);
                assert_eq!(got.gateway, config.gateway);
                assert_eq!(got.dns, config.dns);
                assert_eq!(got.mtu, config.mtu);
                assert_eq!(got.opaque, config.opaque);
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn wait_for_mismatch() {
        let mut buf = Vec::new();
        send(&mut buf, &Message::new(Payload::ChildHello(ChildHello {}))).unwrap();
        let err = wait_for(&mut Cursor::new(buf), "ParentHello").unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { .. }));
    }

    #[test]
    fn ordered_stream() {
        let mut buf = Vec::new();
        send(&mut buf, &Message::new(Payload::ParentHello(ParentHello {}))).unwrap();
        send(
            &mut buf,
            &Message::new(Payload::ParentInitIdmapCompleted(
                ParentInitIdmapCompleted {},
            )),
        )
        .unwrap();
        let mut cursor = Cursor::new(buf);
        wait_for(&mut cursor, "ParentHello").unwrap();
        wait_for(&mut cursor, "ParentInitIdmapCompleted").unwrap();
    }

    #[test]
    fn zero_length_frame_rejected() {
        let buf = 0u32.to_le_bytes().to_vec();
        let err = recv(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameLength(0)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        let err = recv(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameLength(_)));
    }

    #[test]
    fn truncated_body_rejected() {
        let mut buf = 8u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = recv(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
