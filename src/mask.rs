//! Payload masking
//!
//! Client-to-server payloads are XORed with a 4-byte key (RFC 6455 §5.3).
//! The offset-aware variant keeps `key[(done + i) mod 4]` alignment when a
//! frame body is unmasked chunk by chunk.

/// Unmask (or mask) a whole buffer in place
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    apply_mask_offset(buf, key, 0);
}

/// Unmask (or mask) a buffer that starts `offset` bytes into the frame payload
pub fn apply_mask_offset(buf: &mut [u8], key: [u8; 4], offset: usize) {
    // Rotate the key so index 0 lines up with the payload offset, then
    // work a word at a time.
    let k = [
        key[offset % 4],
        key[(offset + 1) % 4],
        key[(offset + 2) % 4],
        key[(offset + 3) % 4],
    ];
    let word = u64::from_ne_bytes([k[0], k[1], k[2], k[3], k[0], k[1], k[2], k[3]]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let v = u64::from_ne_bytes(chunk.try_into().expect("chunk is 8 bytes")) ^ word;
        chunk.copy_from_slice(&v.to_ne_bytes());
    }
    for (i, b) in chunks.into_remainder().iter_mut().enumerate() {
        *b ^= k[i % 4];
    }
}
