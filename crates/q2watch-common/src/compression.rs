// compression.rs — zlib packet inflation for the R1Q2/Q2PRO protocol family
//
// Extended servers compress large payloads with raw deflate (no zlib
// header, windowBits = -15). Two forms appear on the wire: an svc_zpacket
// segment with an explicit {inlen, outlen} header inside a sequenced
// stream, and whole payloads compressed without any framing at all.

use flate2::read::DeflateDecoder;
use std::io::Read;

/// Cap on any decompressed payload, against decompression bombs.
pub const MAX_DECOMPRESS_SIZE: usize = 65536;

/// Inflate raw-deflate data, up to `max_size` bytes of output.
pub fn inflate_raw(data: &[u8], max_size: usize) -> Option<Vec<u8>> {
    let max_size = max_size.min(MAX_DECOMPRESS_SIZE);

    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(max_size.min(data.len() * 4));

    let mut buffer = [0u8; 4096];
    loop {
        match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if out.len() + n > max_size {
                    return None;
                }
                out.extend_from_slice(&buffer[..n]);
            }
            Err(_) => return None,
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Inflate data whose uncompressed size is declared on the wire
/// (svc_zpacket). A size mismatch means a desynced stream.
pub fn inflate_sized(data: &[u8], expected_size: usize) -> Result<Vec<u8>, String> {
    if expected_size > MAX_DECOMPRESS_SIZE {
        return Err(format!(
            "declared size {} exceeds maximum {}",
            expected_size, MAX_DECOMPRESS_SIZE
        ));
    }

    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| format!("inflate failed: {}", e))?;

    if out.len() != expected_size {
        return Err(format!(
            "size mismatch: declared {}, got {}",
            expected_size,
            out.len()
        ));
    }

    Ok(out)
}

/// Some servers compress an entire sequenced payload without framing.
/// Try bare raw-deflate first, then the {u16 inlen, u16 outlen} header
/// form. Returns None when the payload is not compressed after all.
pub fn sniff_inflate(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < 4 {
        return None;
    }

    if let Some(out) = inflate_raw(payload, MAX_DECOMPRESS_SIZE) {
        return Some(out);
    }

    let inlen = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let outlen = u16::from_le_bytes([payload[2], payload[3]]) as usize;
    if inlen == 0 || inlen > payload.len() - 4 || outlen == 0 {
        return None;
    }
    inflate_sized(&payload[4..4 + inlen], outlen).ok()
}
