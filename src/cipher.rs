//! Reversible byte transform applied to extracted payloads before they are embedded
//! as an opaque asset.
//!
//! The transform is a plain byte-wise complement: obfuscation, not encryption. It
//! hides the container magic from naive scanners and nothing more; do not mistake it
//! for a confidentiality mechanism. Its single load-bearing property is that it is an
//! involution (`transform(transform(x)) == x`), so the on-device loader recovers the
//! original bytes by running the identical transform again.

/// Keyless, stateless involutive byte transform.
///
/// Each output byte is the bitwise complement of the input byte. Pure: the same
/// input always produces the same output.
///
/// # Examples
///
/// ```rust
/// use dexfuse::cipher::ByteCipher;
///
/// let payload = b"dex\n035\0".to_vec();
/// let masked = ByteCipher::transform(&payload);
/// assert_ne!(masked, payload);
/// assert_eq!(ByteCipher::transform(&masked), payload);
/// ```
pub struct ByteCipher;

impl ByteCipher {
    /// Transform `data` into a new buffer, complementing every byte.
    #[must_use]
    pub fn transform(data: &[u8]) -> Vec<u8> {
        data.iter().map(|byte| !byte).collect()
    }

    /// Transform `data` in place, avoiding the allocation for large payloads.
    pub fn transform_in_place(data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte = !*byte;
        }
    }
}
