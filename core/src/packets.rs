//! The packets exchanged between nodes during a mixing round and their binary
//! encoding
//!
//! Every packet starts with a one byte tag; integers are big endian and field
//! elements are padded to the field's full byte width. Decoding is exact:
//! trailing bytes and out of range field elements are rejected

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    algebra::{PrimeField, Scalar},
    error::MixError,
    guid::{Guid, GUID_BYTES},
};

/// Tag of a client to mailbox packet
const TAG_CLIENT_MB: u8 = 1;
/// Tag of a mailbox to committee packet
const TAG_MB_MC_UP: u8 = 2;
/// Tag of a leader init packet
const TAG_MC_LEADER_INIT: u8 = 3;
/// Tag of a committee reveal packet
const TAG_MC_V: u8 = 4;
/// Tag of a committee to mailbox packet
const TAG_MC_MB_DOWN: u8 = 5;
/// Tag of a mailbox to client packet
const TAG_MB_CLIENT: u8 = 6;

/// Error message emitted when a packet ends early
const ERR_TRUNCATED: &str = "packet truncated";

// -----------
// | Packets |
// -----------

/// A client's contribution to a round, sent to its mailbox server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMbPacket {
    /// The contribution id
    pub cid: Guid,
    /// The contribution, a root payload read as a field element
    pub x: Scalar,
    /// The committee the contribution should be mixed by
    pub mc_group: u32,
}

/// A mailbox server's shares of one contribution, sent to one committee member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MbMcUpPacket {
    /// The contribution id
    pub cid: Guid,
    /// The member's shares of `x^1..=x^mixsize`
    pub z: Vec<Scalar>,
}

/// The leader's announcement of a round and the contributions it mixes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McLeaderInitPacket {
    /// The round id
    pub mpcid: Guid,
    /// The contribution ids in the round, in ascending order
    pub cids: Vec<Guid>,
}

/// A member's summed shares of the round's power sums
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McVPacket {
    /// The round id
    pub mpcid: Guid,
    /// Shares of the `mixsize` power sums
    pub v: Vec<Scalar>,
}

/// A recovered message leaving the committee for its destination mailbox
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McMbDownPacket {
    /// The output id, derived from the round id
    pub oid: Guid,
    /// The ciphertext for the final recipient
    pub a: Vec<u8>,
    /// The ciphertext holding the mailbox instruction
    pub b: Vec<u8>,
}

/// A message handed from a mailbox to the client it serves
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MbClientPacket {
    /// The output id
    pub oid: Guid,
    /// The ciphertext for the client
    pub a: Vec<u8>,
}

/// Any packet of the mixing protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MixPacket {
    /// Client to mailbox
    ClientMb(ClientMbPacket),
    /// Mailbox to committee member
    MbMcUp(MbMcUpPacket),
    /// Leader to followers
    McLeaderInit(McLeaderInitPacket),
    /// Between committee members
    McV(McVPacket),
    /// Committee to mailbox
    McMbDown(McMbDownPacket),
    /// Mailbox to client
    MbClient(MbClientPacket),
}

impl MixPacket {
    /// A short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            MixPacket::ClientMb(_) => "client-mb",
            MixPacket::MbMcUp(_) => "mb-mc-up",
            MixPacket::McLeaderInit(_) => "mc-leader-init",
            MixPacket::McV(_) => "mc-v",
            MixPacket::McMbDown(_) => "mc-mb-down",
            MixPacket::MbClient(_) => "mb-client",
        }
    }

    /// Encode the packet, field elements padded to their field's byte width
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            MixPacket::ClientMb(p) => {
                buf.put_u8(TAG_CLIENT_MB);
                buf.put_slice(p.cid.as_bytes());
                buf.put_slice(&p.x.to_bytes_be());
                buf.put_u32(p.mc_group);
            },
            MixPacket::MbMcUp(p) => {
                buf.put_u8(TAG_MB_MC_UP);
                buf.put_slice(p.cid.as_bytes());
                put_scalars(&mut buf, &p.z);
            },
            MixPacket::McLeaderInit(p) => {
                buf.put_u8(TAG_MC_LEADER_INIT);
                buf.put_slice(p.mpcid.as_bytes());
                buf.put_u32(p.cids.len() as u32);
                for cid in p.cids.iter() {
                    buf.put_slice(cid.as_bytes());
                }
            },
            MixPacket::McV(p) => {
                buf.put_u8(TAG_MC_V);
                buf.put_slice(p.mpcid.as_bytes());
                put_scalars(&mut buf, &p.v);
            },
            MixPacket::McMbDown(p) => {
                buf.put_u8(TAG_MC_MB_DOWN);
                buf.put_slice(p.oid.as_bytes());
                put_bytes(&mut buf, &p.a);
                put_bytes(&mut buf, &p.b);
            },
            MixPacket::MbClient(p) => {
                buf.put_u8(TAG_MB_CLIENT);
                buf.put_slice(p.oid.as_bytes());
                put_bytes(&mut buf, &p.a);
            },
        }

        buf.freeze()
    }

    /// Decode a packet, field elements read as `field.n_bytes()` wide
    pub fn decode(field: &PrimeField, mut data: &[u8]) -> Result<Self, MixError> {
        let buf = &mut data;
        ensure(buf, 1)?;
        let packet = match buf.get_u8() {
            TAG_CLIENT_MB => {
                let cid = get_guid(buf)?;
                let x = get_scalar(buf, field)?;
                ensure(buf, 4)?;
                MixPacket::ClientMb(ClientMbPacket { cid, x, mc_group: buf.get_u32() })
            },
            TAG_MB_MC_UP => {
                let cid = get_guid(buf)?;
                MixPacket::MbMcUp(MbMcUpPacket { cid, z: get_scalars(buf, field)? })
            },
            TAG_MC_LEADER_INIT => {
                let mpcid = get_guid(buf)?;
                let count = get_count(buf, GUID_BYTES)?;
                let cids = (0..count).map(|_| get_guid(buf)).collect::<Result<Vec<_>, _>>()?;
                MixPacket::McLeaderInit(McLeaderInitPacket { mpcid, cids })
            },
            TAG_MC_V => {
                let mpcid = get_guid(buf)?;
                MixPacket::McV(McVPacket { mpcid, v: get_scalars(buf, field)? })
            },
            TAG_MC_MB_DOWN => {
                let oid = get_guid(buf)?;
                let a = get_bytes(buf)?;
                let b = get_bytes(buf)?;
                MixPacket::McMbDown(McMbDownPacket { oid, a, b })
            },
            TAG_MB_CLIENT => {
                let oid = get_guid(buf)?;
                MixPacket::MbClient(MbClientPacket { oid, a: get_bytes(buf)? })
            },
            tag => return Err(MixError::Serialization(format!("unknown packet tag {tag}"))),
        };

        if buf.has_remaining() {
            return Err(MixError::Serialization(format!(
                "{} trailing bytes after {} packet",
                buf.remaining(),
                packet.kind()
            )));
        }

        Ok(packet)
    }
}

// -----------
// | Helpers |
// -----------

/// Write a count followed by fixed width field elements
fn put_scalars(buf: &mut BytesMut, scalars: &[Scalar]) {
    buf.put_u32(scalars.len() as u32);
    for s in scalars.iter() {
        buf.put_slice(&s.to_bytes_be());
    }
}

/// Write a length prefixed byte string
fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Error unless `n` more bytes are available
fn ensure(buf: &&[u8], n: usize) -> Result<(), MixError> {
    if buf.remaining() < n {
        return Err(MixError::Serialization(ERR_TRUNCATED.to_string()));
    }

    Ok(())
}

/// Read a GUID
fn get_guid(buf: &mut &[u8]) -> Result<Guid, MixError> {
    ensure(buf, GUID_BYTES)?;
    let mut bytes = [0u8; GUID_BYTES];
    buf.copy_to_slice(&mut bytes);
    Ok(Guid::from_bytes(bytes))
}

/// Read a fixed width field element
fn get_scalar(buf: &mut &[u8], field: &PrimeField) -> Result<Scalar, MixError> {
    let width = field.n_bytes();
    ensure(buf, width)?;
    let scalar = field.from_be_bytes(&buf[..width])?;
    buf.advance(width);
    Ok(scalar)
}

/// Read an element count, checking the elements fit in what remains
fn get_count(buf: &mut &[u8], element_size: usize) -> Result<usize, MixError> {
    ensure(buf, 4)?;
    let count = buf.get_u32() as usize;
    match count.checked_mul(element_size) {
        Some(len) if len <= buf.remaining() => Ok(count),
        _ => Err(MixError::Serialization(ERR_TRUNCATED.to_string())),
    }
}

/// Read a count followed by fixed width field elements
fn get_scalars(buf: &mut &[u8], field: &PrimeField) -> Result<Vec<Scalar>, MixError> {
    let count = get_count(buf, field.n_bytes())?;
    (0..count).map(|_| get_scalar(buf, field)).collect()
}

/// Read a length prefixed byte string
fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, MixError> {
    let len = get_count(buf, 1)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use rand::thread_rng;

    use super::{ClientMbPacket, McLeaderInitPacket, McMbDownPacket, McVPacket, MixPacket};
    use crate::{
        guid::Guid,
        test_helpers::{large_field, toy_field},
    };

    /// Tests the exact layout of a client packet
    #[test]
    fn test_client_packet_layout() {
        let field = toy_field();
        let packet = MixPacket::ClientMb(ClientMbPacket {
            cid: Guid::from_bytes([7; 16]),
            x: field.scalar(0x42),
            mc_group: 3,
        });

        let bytes = packet.encode();
        let mut expected = vec![1u8];
        expected.extend([7u8; 16]);
        expected.push(0x42);
        expected.extend([0, 0, 0, 3]);
        assert_eq!(bytes.to_vec(), expected);

        assert_eq!(MixPacket::decode(&field, &bytes).unwrap(), packet);
    }

    /// Tests that every packet kind decodes back to itself
    #[test]
    fn test_packets_decode() {
        let mut rng = thread_rng();
        let field = large_field();
        let packets = vec![
            MixPacket::McLeaderInit(McLeaderInitPacket {
                mpcid: Guid::random(&mut rng),
                cids: (0..4).map(|_| Guid::random(&mut rng)).collect(),
            }),
            MixPacket::McV(McVPacket {
                mpcid: Guid::random(&mut rng),
                v: (0..3).map(|_| field.random(&mut rng)).collect(),
            }),
            MixPacket::McMbDown(McMbDownPacket {
                oid: Guid::random(&mut rng),
                a: vec![1, 2, 3],
                b: vec![],
            }),
        ];

        for packet in packets {
            let bytes = packet.encode();
            assert_eq!(MixPacket::decode(&field, &bytes).unwrap(), packet);
        }
    }

    /// Tests the malformed inputs
    #[test]
    fn test_decode_rejects_malformed() {
        let field = toy_field();
        let packet = MixPacket::McV(McVPacket {
            mpcid: Guid::default(),
            v: vec![field.scalar(1), field.scalar(2)],
        });
        let bytes = packet.encode().to_vec();

        // Truncated
        assert!(MixPacket::decode(&field, &bytes[..bytes.len() - 1]).is_err());

        // Trailing
        let mut long = bytes.clone();
        long.push(0);
        assert!(MixPacket::decode(&field, &long).is_err());

        // Out of range element
        let mut bad = bytes.clone();
        let last = bad.len() - 1;
        bad[last] = 97;
        assert!(MixPacket::decode(&field, &bad).is_err());

        // Unknown tag, oversized count
        assert!(MixPacket::decode(&field, &[9]).is_err());
        let mut huge = bytes;
        huge[17..21].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(MixPacket::decode(&field, &huge).is_err());
        assert!(MixPacket::decode(&field, &[]).is_err());
    }
}
