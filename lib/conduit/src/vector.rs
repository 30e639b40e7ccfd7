use crate::frame::LENGTH_PREFIX_SIZE;
use crate::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Size of the `(vector, rvector)` header carried by every vector message.
pub const VECTOR_HEADER_SIZE: usize = 16;

/// One decoded vector message. `vector` is the sender's locally-unique
/// identifier; `rvector` names the vector this message replies to, with zero
/// meaning "not a reply".
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VectorMessage {
    pub vector: u64,
    pub rvector: u64,
    pub payload: Vec<u8>,
}

/// Builds the complete wire frame for one vector message as a single chunk:
/// length prefix, both vectors and the user payload, all big-endian.
#[inline]
pub fn encode_message(vector: u64, rvector: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + VECTOR_HEADER_SIZE + payload.len());

    frame
        .write_u32::<BigEndian>((VECTOR_HEADER_SIZE + payload.len()) as u32)
        .expect("Error writing length prefix");
    frame.write_u64::<BigEndian>(vector).expect("Error writing vector");
    frame.write_u64::<BigEndian>(rvector).expect("Error writing rvector");
    frame.extend_from_slice(payload);

    frame
}

/// Splits the vector header off a received frame payload.
#[inline]
pub fn split(mut frame: Vec<u8>) -> NetworkResult<VectorMessage> {
    if frame.len() < VECTOR_HEADER_SIZE {
        return Err(NetworkError::Fatal(ErrorType::TruncatedFrame));
    }

    let payload = frame.split_off(VECTOR_HEADER_SIZE);
    let mut header = Cursor::new(&frame[..]);
    let vector = header.read_u64::<BigEndian>()?;
    let rvector = header.read_u64::<BigEndian>()?;

    Ok(VectorMessage {
        vector,
        rvector,
        payload,
    })
}
