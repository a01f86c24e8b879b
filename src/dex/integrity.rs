//! Recomputation of the container's structural signature and header checksum.
//!
//! Any conformant DEX loader validates both integrity fields before trusting the
//! container, so this step is mandatory after any relocation. The two fields are
//! recomputed signature first, because the checksum's coverage includes the
//! signature bytes:
//!
//! 1. **signature** — SHA-1 over `image[32..]`, everything after the signature
//!    field itself (magic and checksum are excluded along with it);
//! 2. **checksum** — Adler-32 over `image[12..]`, everything after the magic and
//!    the checksum field.
//!
//! These exact exclusion ranges come from the published DEX format; the excluded
//! regions are skipped, never zeroed, so the digest covers precisely the advertised
//! bytes. Repair is pure in-memory computation and cannot fail once the container
//! parsed; only the subsequent [`crate::dex::container::DexContainer::save`] can
//! surface an I/O error.

use adler::adler32_slice;
use sha1::{Digest, Sha1};

use crate::dex::{
    container::DexContainer,
    header::{CHECKSUM_OFFSET, SIGNATURE_END, SIGNATURE_LEN, SIGNATURE_OFFSET},
};

/// Compute the structural signature of a container image: SHA-1 over everything
/// after the signature field.
#[must_use]
pub fn compute_signature(image: &[u8]) -> [u8; SIGNATURE_LEN] {
    let digest = Sha1::digest(&image[SIGNATURE_END..]);
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&digest);
    signature
}

/// Compute the header checksum of a container image: Adler-32 over everything after
/// the magic and checksum fields.
#[must_use]
pub fn compute_checksum(image: &[u8]) -> u32 {
    adler32_slice(&image[SIGNATURE_OFFSET..])
}

impl DexContainer {
    /// Recompute and write both integrity fields, signature first.
    ///
    /// Idempotent: a second call recomputes identical values since no other byte
    /// changed in between.
    pub fn repair(&mut self) {
        let signature = compute_signature(self.image());
        {
            let image = self.image_mut();
            image[SIGNATURE_OFFSET..SIGNATURE_END].copy_from_slice(&signature);
        }

        let checksum = compute_checksum(self.image());
        {
            let image = self.image_mut();
            image[CHECKSUM_OFFSET..SIGNATURE_OFFSET].copy_from_slice(&checksum.to_le_bytes());
        }

        let header = self.header_mut();
        header.signature = signature;
        header.checksum = checksum;

        tracing::debug!(checksum = format_args!("{checksum:#010x}"), "integrity fields repaired");
    }

    /// Check the stored integrity fields against a fresh recomputation.
    #[must_use]
    pub fn verify_integrity(&self) -> bool {
        self.header().signature == compute_signature(self.image())
            && self.header().checksum == compute_checksum(self.image())
    }
}
