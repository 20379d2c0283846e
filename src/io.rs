use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::Read,
    mem::size_of,
    os::unix::fs::FileExt,
    path::Path,
};

use crate::error::{DbError, DbResult};

/// A file accessed with positioned reads and writes (pread/pwrite).
/// Aligned page-sized IO through these calls is atomic on the platforms
/// we care about, so callers hold no extra latch around them.
pub struct DbFile {
    file: File,
}

impl DbFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> DbResult {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes; bytes past EOF come back zeroed.
    /// Returns the number of bytes actually read from the file.
    pub fn read_at_short(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DbError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        for b in buf[done..].iter_mut() {
            *b = 0;
        }
        Ok(done)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> DbResult {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub fn sync(&self) -> DbResult {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64, DbError> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_len(&self, len: u64) -> DbResult {
        self.file.set_len(len)?;
        Ok(())
    }
}

pub fn read_into<T: Decodeable, R: std::io::Read>(reader: &mut R) -> T {
    T::decode_from(reader)
}

pub fn read_exact<R: std::io::Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .unwrap_or_else(|_| panic!("io error, expect {}", bytes_count));
    buffer
}

/// Append-only byte buffer used to serialize pages and log records.
pub struct DbWriter {
    buf: Vec<u8>,
}

impl DbWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    /// Write raw bytes with no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Serialize into a buffer of exactly `size` bytes, zero-padded.
    pub fn to_padded_bytes(self, size: usize) -> Vec<u8> {
        let mut buf = self.buf;
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

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self;
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        u8::decode_from(reader) == 1
    }
}

/// # Format
///
/// - 2 bytes: payload size (little endian)
/// - n bytes: payload
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(2 + self.len());
        let len = self.len() as u16;
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(self);
        buffer
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let len = u16::decode_from(reader);
        read_exact(reader, len as usize)
    }
}

impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec().encode()
    }
}

impl Decodeable for String {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let bytes = Vec::<u8>::decode_from(reader);
        String::from_utf8(bytes).expect("invalid utf8")
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
                fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
                    let bytes = read_exact(reader, size_of::<Self>());
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);
