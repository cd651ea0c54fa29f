//! Binary framing helpers shared by the estimator snapshot codec
//!
//! All integers are little-endian. Strings are `[len u32][utf-8 bytes]`.
//! Every read is bounds-checked and reports [`Error::Decode`] instead of
//! panicking on truncated input.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Magic bytes opening an estimator snapshot
pub const MAGIC: &[u8; 4] = b"HLCE";

/// Snapshot format version
pub const FORMAT_VERSION: u8 = 1;

/// Write a length-prefixed string
pub fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Read a length-prefixed string into an owned buffer
pub fn get_string<B: Buf>(buf: &mut B, what: &str) -> Result<String> {
    let len = get_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(Error::Decode(format!(
            "{}: string of {} bytes truncated to {}",
            what,
            len,
            buf.remaining()
        )));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| Error::Decode(format!("{}: {}", what, e)))
}

/// Read a u32, failing on short input
pub fn get_u32<B: Buf>(buf: &mut B, what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Decode(format!("{}: truncated u32", what)));
    }
    Ok(buf.get_u32_le())
}

/// Read a u64, failing on short input
pub fn get_u64<B: Buf>(buf: &mut B, what: &str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::Decode(format!("{}: truncated u64", what)));
    }
    Ok(buf.get_u64_le())
}

/// Write the snapshot header
pub fn put_header<B: BufMut>(buf: &mut B) {
    buf.put_slice(MAGIC);
    buf.put_u8(FORMAT_VERSION);
}

/// Validate the snapshot header
pub fn check_header<B: Buf>(buf: &mut B) -> Result<()> {
    if buf.remaining() < MAGIC.len() + 1 {
        return Err(Error::Decode("snapshot: missing header".to_string()));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(Error::Decode(format!("snapshot: bad magic {:?}", magic)));
    }
    let version = buf.get_u8();
    if version != FORMAT_VERSION {
        return Err(Error::Decode(format!(
            "snapshot: unsupported version {}",
            version
        )));
    }
    Ok(())
}
