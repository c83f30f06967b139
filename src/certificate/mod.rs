//! Certificate material for A1 (PKCS#12) taxpayer certificates.
//!
//! The stored bundle is only ever decrypted into an [`IdentityMaterial`], which lives for the
//! duration of one protocol call (or one sync cycle) and wipes its key material on drop.

/// PKCS#12 decoding and tax identifier extraction
mod identity;

pub use identity::*;

#[cfg(test)]
pub(crate) use identity::tests::test_bundle;
