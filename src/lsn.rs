use core::fmt;
use std::convert::TryInto;

use crate::io::{read_exact, Decodeable, Encodeable};

/// Log sequence number: (partition number, byte offset within the
/// partition), packed into a u64 so that the numeric order equals the
/// log order. `Lsn::NULL` is the bottom of the order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    pub const NULL: Lsn = Lsn(0);

    pub fn new(partition: u32, offset: u32) -> Self {
        Lsn(((partition as u64) << 32) | offset as u64)
    }

    pub fn from_u64(v: u64) -> Self {
        Lsn(v)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn partition(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The LSN `len` bytes further into the same partition.
    pub fn advance(self, len: u32) -> Lsn {
        Lsn::new(self.partition(), self.offset() + len)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.partition(), self.offset())
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Encodeable for Lsn {
    fn encode(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }
}

impl Decodeable for Lsn {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let bytes = read_exact(reader, 8);
        Lsn(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order() {
        let a = Lsn::new(1, 100);
        let b = Lsn::new(1, 200);
        let c = Lsn::new(2, 0);
        assert!(Lsn::NULL < a);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.advance(100), b);
    }
}
