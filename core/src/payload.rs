//! The payload a client hides inside a field element, and the chunking of
//! messages too long for a single payload
//!
//! A root payload is three ciphertexts: `a` for the recipient, `b` holding the
//! instruction for the destination mailbox, and `c` naming that mailbox for the
//! committee. The triple is zero padded to `prime_space` bytes and read as a
//! big endian integer, which is then below the prime by construction

use bytes::{Buf, BufMut, BytesMut};
use digest::Digest;
use rand::{CryptoRng, RngCore};
use rustc_hash::{FxHashMap, FxHashSet};
use sha3::Sha3_256;

use crate::{
    algebra::{PrimeField, Scalar},
    crypto::{anon_encrypt_size, KEY_BYTES},
    error::MixError,
    guid::{Guid, GUID_BYTES},
    phonebook::{Psn, PSN_HASH_BYTES},
};

/// The bytes taken by a length prefix
const LEN_PREFIX_BYTES: usize = 4;
/// The header bytes of a message chunk
pub const CHUNK_HEADER_BYTES: usize = GUID_BYTES + 2 + 2;
/// The smallest root payload: empty mailbox name and one byte of message
pub const MIN_ROOT_PAYLOAD_BYTES: usize = root_payload_overhead(0) + 1;

/// Error message emitted when a payload ends early
const ERR_TRUNCATED: &str = "payload truncated";

/// The bytes of a root payload not available to message data, given the
/// length of the destination client's persona
pub const fn root_payload_overhead(psn_len: usize) -> usize {
    3 * LEN_PREFIX_BYTES
        + anon_encrypt_size(CHUNK_HEADER_BYTES)
        + anon_encrypt_size(1 + LEN_PREFIX_BYTES + psn_len)
        + anon_encrypt_size(PSN_HASH_BYTES)
}

/// The message bytes that fit in one chunk addressed to a persona of
/// `psn_len` bytes
pub fn chunk_capacity(prime_space: usize, psn_len: usize) -> Result<usize, MixError> {
    match prime_space.checked_sub(root_payload_overhead(psn_len)) {
        Some(capacity) if capacity > 0 => Ok(capacity),
        _ => Err(MixError::Config(format!(
            "{prime_space} payload bytes leave no room for a message to a {psn_len} byte persona"
        ))),
    }
}

// ----------------
// | Root Payload |
// ----------------

/// The three ciphertexts a contribution carries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootPayload {
    /// The ciphertext for the final recipient
    pub a: Vec<u8>,
    /// The ciphertext holding the mailbox instruction
    pub b: Vec<u8>,
    /// The ciphertext naming the destination mailbox
    pub c: Vec<u8>,
}

impl RootPayload {
    /// Serialize into `prime_space` bytes and read them as a field element
    pub fn to_scalar(&self, field: &PrimeField, prime_space: usize) -> Result<Scalar, MixError> {
        let mut buf = BytesMut::with_capacity(prime_space);
        for part in [&self.a, &self.b, &self.c] {
            buf.put_u32(part.len() as u32);
            buf.put_slice(part);
        }

        if buf.len() > prime_space {
            return Err(MixError::Serialization(format!(
                "root payload of {} bytes exceeds {prime_space}",
                buf.len()
            )));
        }
        buf.resize(prime_space, 0);

        field.from_be_bytes(&buf)
    }

    /// Parse the payload encoded in a recovered root
    pub fn from_scalar(root: &Scalar, prime_space: usize) -> Result<Self, MixError> {
        if root.value().bits() as usize > 8 * prime_space {
            return Err(MixError::Serialization("root exceeds the payload width".to_string()));
        }

        let bytes = root.to_bytes_be_padded(prime_space);
        let mut buf = bytes.as_slice();
        let a = get_bytes(&mut buf)?;
        let b = get_bytes(&mut buf)?;
        let c = get_bytes(&mut buf)?;
        if buf.iter().any(|byte| *byte != 0) {
            return Err(MixError::Serialization("non-zero root payload padding".to_string()));
        }

        Ok(Self { a, b, c })
    }
}

// -----------------------
// | Mailbox Instruction |
// -----------------------

/// The commands a mailbox server executes for a recovered message
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MailboxCommand {
    /// Forward the message to the named client
    MailDelivery = 1,
}

impl TryFrom<u8> for MailboxCommand {
    type Error = MixError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MailboxCommand::MailDelivery),
            _ => Err(MixError::Serialization(format!("unknown mailbox command {value}"))),
        }
    }
}

/// The plaintext of `b`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxInstruction {
    /// The command to run
    pub command: MailboxCommand,
    /// The client the command concerns
    pub psn: Psn,
}

impl MailboxInstruction {
    /// Serialize the instruction
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.command as u8);
        buf.put_u32(self.psn.as_str().len() as u32);
        buf.put_slice(self.psn.as_str().as_bytes());
        buf.to_vec()
    }

    /// Parse an instruction, rejecting trailing bytes
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, MixError> {
        let buf = &mut data;
        if !buf.has_remaining() {
            return Err(MixError::Serialization(ERR_TRUNCATED.to_string()));
        }

        let command = MailboxCommand::try_from(buf.get_u8())?;
        let name = get_bytes(buf)?;
        if buf.has_remaining() {
            return Err(MixError::Serialization("trailing bytes after instruction".to_string()));
        }

        let name = String::from_utf8(name).map_err(|e| MixError::Serialization(e.to_string()))?;
        Ok(Self { command, psn: Psn::new(name) })
    }
}

// ------------------
// | Message Chunks |
// ------------------

/// One piece of a message, the plaintext of `a`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageChunk {
    /// Shared by every chunk of a message
    pub group: Guid,
    /// The position of this chunk
    pub index: u16,
    /// The number of chunks in the message
    pub count: u16,
    /// The chunk's slice of the message
    pub data: Vec<u8>,
}

impl MessageChunk {
    /// Serialize the chunk
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_BYTES + self.data.len());
        buf.put_slice(self.group.as_bytes());
        buf.put_u16(self.index);
        buf.put_u16(self.count);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parse a chunk
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, MixError> {
        if data.len() < CHUNK_HEADER_BYTES {
            return Err(MixError::Serialization(ERR_TRUNCATED.to_string()));
        }

        let mut group = [0u8; GUID_BYTES];
        data.copy_to_slice(&mut group);
        let index = data.get_u16();
        let count = data.get_u16();
        if index >= count {
            return Err(MixError::Serialization(format!("chunk {index} of {count}")));
        }

        Ok(Self { group: Guid::from_bytes(group), index, count, data: data.to_vec() })
    }
}

/// Split a message into chunks of at most `capacity` bytes
///
/// An empty message still yields one chunk so that it is delivered
pub fn split_message<R: RngCore + CryptoRng>(
    message: &[u8],
    capacity: usize,
    rng: &mut R,
) -> Result<Vec<MessageChunk>, MixError> {
    if capacity == 0 {
        return Err(MixError::Config("chunk capacity is zero".to_string()));
    }

    let pieces: Vec<&[u8]> =
        if message.is_empty() { vec![message] } else { message.chunks(capacity).collect() };
    let count = u16::try_from(pieces.len())
        .map_err(|_| MixError::Config(format!("message needs {} chunks", pieces.len())))?;

    let group = Guid::random(rng);
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(i, data)| MessageChunk { group, index: i as u16, count, data: data.to_vec() })
        .collect())
}

/// A message that has received some of its chunks
#[derive(Debug)]
struct PartialMessage {
    /// The expected chunk count
    count: u16,
    /// The chunks received so far
    chunks: Vec<Option<Vec<u8>>>,
    /// The number of filled slots
    received: usize,
}

/// Reassembles chunked messages and suppresses repeated deliveries
#[derive(Debug, Default)]
pub struct ChunkJoiner {
    /// Messages still missing chunks
    partial: FxHashMap<Guid, PartialMessage>,
    /// Hashes of the messages already delivered
    delivered: FxHashSet<[u8; KEY_BYTES]>,
}

impl ChunkJoiner {
    /// Construct an empty joiner
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a chunk, returning the message it completes if any
    ///
    /// A message completed a second time, e.g. from a replayed chunk, is
    /// returned only once
    pub fn push(&mut self, chunk: MessageChunk) -> Result<Option<Vec<u8>>, MixError> {
        if chunk.index >= chunk.count {
            return Err(MixError::Corruption(format!(
                "chunk {} of {} for message {}",
                chunk.index, chunk.count, chunk.group
            )));
        }

        let partial = self.partial.entry(chunk.group).or_insert_with(|| PartialMessage {
            count: chunk.count,
            chunks: vec![None; chunk.count as usize],
            received: 0,
        });

        if partial.count != chunk.count {
            return Err(MixError::Corruption(format!(
                "chunk count {} disagrees with {} for message {}",
                chunk.count, partial.count, chunk.group
            )));
        }

        let slot = &mut partial.chunks[chunk.index as usize];
        if slot.is_none() {
            *slot = Some(chunk.data);
            partial.received += 1;
        }

        if partial.received < partial.count as usize {
            return Ok(None);
        }

        let message: Vec<u8> = self
            .partial
            .remove(&chunk.group)
            .map(|p| p.chunks.into_iter().flatten().flatten().collect())
            .unwrap_or_default();

        let digest = Sha3_256::new()
            .chain_update(chunk.group.as_bytes())
            .chain_update(&message)
            .finalize();
        let mut hash = [0u8; KEY_BYTES];
        hash.copy_from_slice(&digest);

        if !self.delivered.insert(hash) {
            return Ok(None);
        }
        Ok(Some(message))
    }

    /// The number of messages waiting on chunks
    pub fn n_pending(&self) -> usize {
        self.partial.len()
    }
}

/// Read a length prefixed byte string
fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, MixError> {
    if buf.remaining() < LEN_PREFIX_BYTES {
        return Err(MixError::Serialization(ERR_TRUNCATED.to_string()));
    }

    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(MixError::Serialization(ERR_TRUNCATED.to_string()));
    }

    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use rand::{seq::SliceRandom, thread_rng, RngCore};

    use super::{
        chunk_capacity, root_payload_overhead, split_message, ChunkJoiner, MailboxCommand,
        MailboxInstruction, MessageChunk, RootPayload,
    };
    use crate::{
        phonebook::Psn,
        test_helpers::{large_field, large_params},
    };

    /// Tests that a payload filling the whole space survives the field
    #[test]
    fn test_root_payload_full_width() {
        let params = large_params(3);
        let field = large_field();
        let space = params.prime_space();

        let payload = RootPayload { a: vec![0xff; space - 12 - 2], b: vec![0xff], c: vec![0xff] };
        let x = payload.to_scalar(&field, space).unwrap();
        assert_eq!(RootPayload::from_scalar(&x, space).unwrap(), payload);

        let too_long = RootPayload { a: vec![0; space], b: vec![], c: vec![] };
        assert!(too_long.to_scalar(&field, space).is_err());
    }

    /// Tests that arbitrary field elements are rejected as payloads
    #[test]
    fn test_root_payload_rejects_noise() {
        let mut rng = thread_rng();
        let params = large_params(3);
        let field = large_field();

        // A random element almost surely has a huge first length prefix
        let noise = field.random(&mut rng);
        assert!(RootPayload::from_scalar(&noise, params.prime_space()).is_err());
    }

    /// Tests the mailbox instruction encoding
    #[test]
    fn test_instruction() {
        let instruction =
            MailboxInstruction { command: MailboxCommand::MailDelivery, psn: Psn::from("bob") };
        let bytes = instruction.to_bytes();
        assert_eq!(bytes, vec![1, 0, 0, 0, 3, b'b', b'o', b'b']);
        assert_eq!(MailboxInstruction::from_bytes(&bytes).unwrap(), instruction);

        assert!(MailboxInstruction::from_bytes(&[2, 0, 0, 0, 0]).is_err());
        assert!(MailboxInstruction::from_bytes(&[1, 0, 0, 0, 1]).is_err());
    }

    /// Tests the capacity arithmetic for the large prime
    #[test]
    fn test_chunk_capacity() {
        let space = large_params(3).prime_space();
        let capacity = chunk_capacity(space, 8).unwrap();
        assert_eq!(capacity + root_payload_overhead(8), space);
        assert!(chunk_capacity(space, space).is_err());
    }

    /// Tests that shuffled chunks reassemble and are delivered once
    #[test]
    fn test_split_and_join() {
        let mut rng = thread_rng();
        let mut message = vec![0u8; 100];
        rng.fill_bytes(&mut message);

        let mut chunks = split_message(&message, 30, &mut rng).unwrap();
        assert_eq!(chunks.len(), 4);
        chunks.shuffle(&mut rng);

        let mut joiner = ChunkJoiner::new();
        let mut outputs = Vec::new();
        for chunk in chunks.iter() {
            let encoded = chunk.to_bytes();
            if let Some(msg) = joiner.push(MessageChunk::from_bytes(&encoded).unwrap()).unwrap() {
                outputs.push(msg);
            }
        }
        assert_eq!(outputs, vec![message]);

        // Replaying every chunk completes the message again but is suppressed
        for chunk in chunks {
            assert!(joiner.push(chunk).unwrap().is_none());
        }
        assert_eq!(joiner.n_pending(), 0);
    }

    /// Tests the degenerate and malformed chunk cases
    #[test]
    fn test_chunk_edge_cases() {
        let mut rng = thread_rng();
        let chunks = split_message(&[], 10, &mut rng).unwrap();
        assert_eq!(chunks.len(), 1);

        let mut joiner = ChunkJoiner::new();
        assert_eq!(joiner.push(chunks[0].clone()).unwrap(), Some(vec![]));

        assert!(split_message(b"hello", 0, &mut rng).is_err());
        assert!(MessageChunk::from_bytes(&[0; 10]).is_err());

        // Index past the count
        let mut bad = MessageChunk { group: Default::default(), index: 2, count: 2, data: vec![] }
            .to_bytes();
        assert!(MessageChunk::from_bytes(&bad).is_err());
        bad[17] = 1;
        assert!(MessageChunk::from_bytes(&bad).is_ok());
    }
}
