//! Utility functions shared by the on-disk structures.

use std::fmt;
use std::mem::size_of;

/// Performs the log2 operation on the given integer.
///
/// If the result is undefined, the function returns None.
pub fn log2(n: u64) -> Option<u64> {
    let num_bits = (size_of::<u64>() * 8) as u64;

    let n = num_bits - n.leading_zeros() as u64;
    if n > 0 {
        Some(n - 1)
    } else {
        None
    }
}

/// Reads the big-endian 32-bit integer at offset `off` in `buf`.
///
/// The caller is responsible for the bounds of `off`.
pub fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Writes `val` as a big-endian 32-bit integer at offset `off` in `buf`.
pub fn write_i32(buf: &mut [u8], off: usize, val: i32) {
    buf[off..off + 4].copy_from_slice(&val.to_be_bytes());
}

/// Structure representing a number of bytes.
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut order = log2(self.0).unwrap_or(0) / log2(1024).unwrap();

        let suffix = match order {
            0 => "bytes",
            1 => "KiB",
            2 => "MiB",
            3 => "GiB",
            4 => "TiB",
            5 => "PiB",
            6 => "EiB",
            7 => "ZiB",
            8 => "YiB",

            _ => {
                order = 0;
                "bytes"
            }
        };

        let unit = 1024usize.pow(order as u32);
        let nbr = self.0 / unit as u64;

        write!(fmt, "{} {}", nbr, suffix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytesize() {
        assert_eq!(format!("{}", ByteSize(0)).as_str(), "0 bytes");
        assert_eq!(format!("{}", ByteSize(1)).as_str(), "1 bytes");
        assert_eq!(format!("{}", ByteSize(1023)).as_str(), "1023 bytes");
        assert_eq!(format!("{}", ByteSize(1024)).as_str(), "1 KiB");
        assert_eq!(format!("{}", ByteSize(1025)).as_str(), "1 KiB");
        assert_eq!(format!("{}", ByteSize(2048)).as_str(), "2 KiB");
        assert_eq!(format!("{}", ByteSize(1024 * 1024)).as_str(), "1 MiB");
        assert_eq!(
            format!("{}", ByteSize(1024 * 1024 * 1024)).as_str(),
            "1 GiB"
        );
    }

    #[test]
    fn int_codec() {
        let mut buf = [0u8; 12];
        write_i32(&mut buf, 4, 0x01020304);
        assert_eq!(buf[4..8], [1, 2, 3, 4]);
        assert_eq!(read_i32(&buf, 4), 0x01020304);

        write_i32(&mut buf, 0, -1);
        assert_eq!(buf[0..4], [0xff, 0xff, 0xff, 0xff]);
        assert_eq!(read_i32(&buf, 0), -1);
    }

    #[test]
    fn log2_values() {
        assert_eq!(log2(0), None);
        assert_eq!(log2(1), Some(0));
        assert_eq!(log2(64), Some(6));
        assert_eq!(log2(65), Some(6));
        assert_eq!(log2(1024), Some(10));
    }
}
