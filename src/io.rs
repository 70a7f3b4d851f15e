use std::{convert::TryInto, io::Read, mem::size_of};

use crate::{
    error::{ErrorKind, GroveError},
    types::GroveResult,
};

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: Read>(reader: &mut R) -> GroveResult<Self>
    where
        Self: Sized;
}

pub fn read_exact_from<R: Read>(
    reader: &mut R,
    bytes_count: usize,
) -> GroveResult<Vec<u8>> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .map_err(|e| GroveError::new(ErrorKind::IoError, &e.to_string()))?;
    Ok(buffer)
}

pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        let buf = Vec::new();
        Self { buf }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Pad the buffer with zeroes up to `size`; panics when the content is
    /// already larger (the caller sized the target region).
    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.clone();

        if buf.len() > size {
            panic!(
                "buffer size is larger than the given size: {} > {}",
                buf.len(),
                size
            );
        }

        buf.resize(size, 0);
        buf
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> GroveResult<Self> {
                    let bytes = read_exact_from(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

// Little-endian helpers for in-place page access. All on-disk multi-byte
// integers are little-endian; record-number keys are the one exception
// (big-endian so that bytewise comparison yields numeric order).

pub fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub fn set_u16(buf: &mut [u8], offset: usize, n: u16) {
    buf[offset..offset + 2].copy_from_slice(&n.to_le_bytes());
}

pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub fn set_u32(buf: &mut [u8], offset: usize, n: u32) {
    buf[offset..offset + 4].copy_from_slice(&n.to_le_bytes());
}

pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub fn set_u64(buf: &mut [u8], offset: usize, n: u64) {
    buf[offset..offset + 8].copy_from_slice(&n.to_le_bytes());
}
