//! Minecraft handshake and login-start sniffer.
//!
//! Wire layout (every packet is `VarInt length | VarInt id | body`):
//!
//! ```text
//! Handshake (id 0):   VarInt version | String address | u16 port | VarInt next_state
//! Status request:     0x01 0x00
//! Login start (id 0): String name (<= 16) | version-gated fields
//! ```
//!
//! Login start fields by protocol version:
//!
//! | version   | after the name                                              |
//! |-----------|-------------------------------------------------------------|
//! | >= 764    | UUID (16 bytes), if exactly 16 bytes remain                 |
//! | 761..=763 | bool has_uuid, UUID                                         |
//! | 759..=760 | bool has_sig, [i64 + ByteArray + ByteArray], bool has_uuid, UUID |
//! | < 759     | nothing                                                     |

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use craftgate_networking::varint::{self, get_bool, get_string, get_u16, get_u8, get_varint};
use craftgate_networking::{CachedStream, CACHE_CAPACITY};
use tokio::io::AsyncRead;
use uuid::Uuid;

use super::{read_varint, timed, ClientConn, Sniffer, SNIFF_STEP_TIMEOUT};
use crate::error::SniffError;
use crate::metadata::{Metadata, MinecraftMetadata, NextState, Protocol};

/// Largest handshake packet accepted. Real ones are far smaller.
pub const MAX_HANDSHAKE_LEN: usize = 264;

/// Longest player name.
pub const MAX_PLAYER_NAME_LEN: usize = 16;

const HANDSHAKE_PACKET_ID: u8 = 0x00;
const LOGIN_START_PACKET_ID: u8 = 0x00;

/// First protocol version with the signature block (1.19).
const SIGNATURE_DATA_VERSION: u32 = 759;
/// First protocol version with the has-UUID flag and no signature (1.19.3).
const OPTIONAL_UUID_VERSION: u32 = 761;
/// First protocol version with a mandatory UUID (1.20.2).
const MANDATORY_UUID_VERSION: u32 = 764;

#[derive(Debug, Clone)]
pub struct MinecraftSniffer {
    step_timeout: Duration,
}

impl MinecraftSniffer {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }
}

impl Default for MinecraftSniffer {
    fn default() -> Self {
        Self::new(SNIFF_STEP_TIMEOUT)
    }
}

#[async_trait]
impl Sniffer for MinecraftSniffer {
    async fn sniff(&self, conn: &mut ClientConn, metadata: &mut Metadata) -> Result<(), SniffError> {
        sniff_handshake(conn, metadata, self.step_timeout).await
    }
}

/// Decoded handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub address: String,
    pub port: u16,
    pub next_state: NextState,
}

impl Handshake {
    /// Decode a handshake body (packet id onwards).
    pub fn decode(mut body: &[u8]) -> Result<Self, SniffError> {
        if get_u8(&mut body)? != HANDSHAKE_PACKET_ID {
            return Err(SniffError::BadPacket("not a handshake packet"));
        }
        let protocol_version = get_varint(&mut body)?;
        if protocol_version <= 0 {
            return Err(SniffError::BadPacket("bad protocol version"));
        }
        let address = get_string(&mut body, None)?;
        if address.is_empty() {
            return Err(SniffError::BadPacket("empty server address"));
        }
        let port = get_u16(&mut body)?;
        if port == 0 {
            return Err(SniffError::BadPacket("zero server port"));
        }
        let next_state = NextState::from_byte(get_u8(&mut body)?)
            .ok_or(SniffError::BadPacket("unknown next state"))?;

        Ok(Self {
            protocol_version: protocol_version as u32,
            address,
            port,
            next_state,
        })
    }

    /// Append this handshake as a framed packet.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut body = Vec::with_capacity(self.address.len() + 16);
        body.put_u8(HANDSHAKE_PACKET_ID);
        varint::put_varint(&mut body, self.protocol_version as i32);
        varint::put_string(&mut body, &self.address);
        body.put_u16(self.port);
        body.put_u8(self.next_state as u8);
        varint::put_packet(buf, &body);
    }
}

/// Decoded login-start packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub name: String,
    pub uuid: Uuid,
}

impl LoginStart {
    /// Decode a login-start body sent by a client speaking `protocol_version`.
    pub fn decode(mut body: &[u8], protocol_version: u32) -> Result<Self, SniffError> {
        if get_u8(&mut body)? != LOGIN_START_PACKET_ID {
            return Err(SniffError::BadPacket("not a login start packet"));
        }
        let name = get_string(&mut body, Some(MAX_PLAYER_NAME_LEN))?;
        let mut uuid = Uuid::nil();

        if protocol_version >= MANDATORY_UUID_VERSION {
            if body.remaining() == 16 {
                uuid = read_uuid(&mut body)?;
            }
        } else if protocol_version >= OPTIONAL_UUID_VERSION {
            if get_bool(&mut body)? {
                uuid = read_uuid(&mut body)?;
            }
        } else if protocol_version >= SIGNATURE_DATA_VERSION {
            if get_bool(&mut body)? {
                // expiry timestamp, public key, key signature
                varint::skip(&mut body, 8)?;
                varint::skip_byte_array(&mut body)?;
                varint::skip_byte_array(&mut body)?;
            }
            // Some 1.19 clients end the packet here.
            if body.has_remaining() && get_bool(&mut body)? {
                uuid = read_uuid(&mut body)?;
            }
        }

        Ok(Self { name, uuid })
    }
}

fn read_uuid(body: &mut &[u8]) -> Result<Uuid, SniffError> {
    if body.remaining() < 16 {
        return Err(SniffError::BadPacket("truncated uuid"));
    }
    let mut bytes = [0u8; 16];
    body.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

/// Sniff a Minecraft handshake at the cursor of `conn`.
///
/// On success `metadata.minecraft` is set and its sniff position marks the
/// end of the handshake packet. Status connections peek the two-byte status
/// request; login and transfer connections also decode the login-start packet.
pub async fn sniff_handshake<S: AsyncRead + Unpin>(
    conn: &mut CachedStream<S>,
    metadata: &mut Metadata,
    step: Duration,
) -> Result<(), SniffError> {
    if metadata.minecraft.is_some() {
        return Ok(());
    }

    let len = packet_len(read_varint(conn, step).await?, MAX_HANDSHAKE_LEN)?;
    let handshake = Handshake::decode(timed(step, conn.peek(len)).await?)?;
    conn.consume(len);
    let sniff_position = conn.current_position();

    let mut record = MinecraftMetadata {
        protocol_version: handshake.protocol_version,
        origin_destination: handshake.address,
        origin_port: handshake.port,
        rewritten_destination: None,
        rewritten_port: None,
        player_name: String::new(),
        uuid: Uuid::nil(),
        next_state: handshake.next_state,
        sniff_position,
    };

    match handshake.next_state {
        NextState::Status => {
            timed(step, conn.peek(2)).await?;
        }
        NextState::Login | NextState::Transfer => {
            let len = packet_len(read_varint(conn, step).await?, CACHE_CAPACITY)?;
            let login = LoginStart::decode(timed(step, conn.peek(len)).await?, record.protocol_version)?;
            conn.consume(len);
            record.player_name = login.name;
            record.uuid = login.uuid;
        }
    }

    metadata.minecraft = Some(record);
    metadata.protocol = Some(Protocol::Minecraft);
    Ok(())
}

fn packet_len(len: i32, max: usize) -> Result<usize, SniffError> {
    match usize::try_from(len) {
        Ok(0) | Err(_) => Err(SniffError::BadPacket("bad packet length")),
        Ok(len) if len > max => Err(SniffError::BadPacket("packet too long")),
        Ok(len) => Ok(len),
    }
}
