//! Textual encodings for hash digests.
//!
//! Base-16 and the store's base-32 are implemented here; base-64 goes through
//! the `base64` crate. The base-32 alphabet is fixed and omits `e o t u` to
//! avoid accidental words in path names.

use crate::error::{Error, Result};

/// The 32-character store alphabet.
pub const NIX32_ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Number of base-32 characters needed for `len` bytes.
pub const fn nix32_len(len: usize) -> usize {
    (len * 8).div_ceil(5)
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Encode bytes as lowercase base-16.
pub fn base16_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push(HEX_DIGITS[usize::from(b >> 4)] as char);
        s.push(HEX_DIGITS[usize::from(b & 0xf)] as char);
    }
    s
}

/// Decode lowercase or uppercase base-16.
pub fn base16_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Format(format!(
            "invalid base-16 length {}",
            s.len()
        )));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char)
            .to_digit(16)
            .ok_or_else(|| Error::Format(format!("invalid base-16 character '{}'", pair[0] as char)))?;
        let lo = (pair[1] as char)
            .to_digit(16)
            .ok_or_else(|| Error::Format(format!("invalid base-16 character '{}'", pair[1] as char)))?;
        out.push((hi as u8) << 4 | lo as u8);
    }
    Ok(out)
}

/// Encode bytes in the store base-32 alphabet.
///
/// The input is read as a big-endian integer and emitted five bits per
/// character, high bits first. Output width is fixed at `nix32_len(len)`;
/// when the bit count is not a multiple of five the excess high bits are
/// zero, so short inputs render with leading `'0'` characters.
pub fn nix32_encode(bytes: &[u8]) -> String {
    let nchars = nix32_len(bytes.len());
    let mut out = String::with_capacity(nchars);
    let mut acc: u32 = 0;
    let mut nbits: u32 = (nchars * 5 - bytes.len() * 8) as u32;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        nbits += 8;
        while nbits >= 5 {
            nbits -= 5;
            out.push(NIX32_ALPHABET[((acc >> nbits) & 0x1f) as usize] as char);
            acc &= (1 << nbits) - 1;
        }
    }
    out
}

fn nix32_digit(c: u8) -> Result<u32> {
    NIX32_ALPHABET
        .iter()
        .position(|&a| a == c)
        .map(|p| p as u32)
        .ok_or_else(|| Error::Format(format!("invalid base-32 character '{}'", c as char)))
}

/// Decode a string in the store base-32 alphabet.
///
/// The padding bits above the byte width must be zero.
pub fn nix32_decode(s: &str) -> Result<Vec<u8>> {
    let nbytes = s.len() * 5 / 8;
    let mut out = Vec::with_capacity(nbytes);
    let mut acc: u32 = 0;
    let mut nbits: u32 = 0;
    for &c in s.as_bytes().iter().rev() {
        acc |= nix32_digit(c)? << nbits;
        nbits += 5;
        if nbits >= 8 {
            out.push((acc & 0xff) as u8);
            acc >>= 8;
            nbits -= 8;
        }
    }
    if acc != 0 {
        return Err(Error::Format(format!(
            "invalid base-32 string '{s}': non-zero padding"
        )));
    }
    out.reverse();
    Ok(out)
}

/// Encode bytes as standard base-64.
pub fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base-64.
pub fn base64_decode(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::Format(format!("invalid base-64: {e}")))
}
