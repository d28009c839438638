//! Permission signatures for block locators.
//!
//! A signed locator carries an `A<hmac>@<expiry>` hint. The HMAC-SHA256
//! covers the block hash, the requester's token and the hex expiry, so a
//! signature issued to one token cannot be replayed by another.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{KeepError, KeepResult};
use crate::locator::{expiry_hex, Locator, SignatureHint};

type HmacSha256 = Hmac<Sha256>;

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signs and verifies locators with a shared secret.
pub struct BlobSigner {
    key: Zeroizing<Vec<u8>>,
    ttl: Duration,
}

impl BlobSigner {
    /// Create a signer with the cluster secret and signature lifetime.
    pub fn new(key: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            key: Zeroizing::new(key.as_ref().to_vec()),
            ttl,
        }
    }

    /// Validity window of signatures issued by [`BlobSigner::sign`].
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// HMAC over `hash@token@expiry`. The size hint and any other hints are
    /// not covered, so a signature stays valid if the size is altered; reads
    /// check the size hint against the stored data instead.
    fn mac(&self, hash: &str, token: &str, expiry: u64) -> KeepResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|e| KeepError::Config {
            reason: format!("signing key rejected: {}", e),
        })?;
        mac.update(hash.as_bytes());
        mac.update(b"@");
        mac.update(token.as_bytes());
        mac.update(b"@");
        mac.update(expiry_hex(expiry).as_bytes());
        Ok(mac)
    }

    /// Sign `locator` for `token`, expiring at `expiry`.
    ///
    /// Any existing signature hints are replaced; other hints are kept.
    pub fn sign_until(&self, locator: &Locator, token: &str, expiry: SystemTime) -> KeepResult<Locator> {
        let expiry = unix_secs(expiry);
        let signature = hex::encode(self.mac(&locator.hash, token, expiry)?.finalize().into_bytes());
        let hint = SignatureHint { signature, expiry };
        Ok(locator.without_signature().with_hint(hint.to_hint()))
    }

    /// Sign `locator` for `token` with the configured lifetime.
    pub fn sign(&self, locator: &Locator, token: &str) -> KeepResult<Locator> {
        self.sign_until(locator, token, SystemTime::now() + self.ttl)
    }

    /// Verify the signature on `locator` for `token` against the current time.
    pub fn verify(&self, locator: &Locator, token: &str) -> KeepResult<()> {
        self.verify_at(locator, token, SystemTime::now())
    }

    /// Verify the signature on `locator` for `token` as of `now`.
    ///
    /// Returns [`KeepError::Forbidden`] when the hint is missing, malformed or
    /// wrong, and [`KeepError::Expired`] when it is genuine but out of date.
    pub fn verify_at(&self, locator: &Locator, token: &str, now: SystemTime) -> KeepResult<()> {
        let hint = locator
            .signature_hint()
            .and_then(SignatureHint::parse)
            .ok_or(KeepError::Forbidden)?;
        let claimed = hex::decode(&hint.signature).map_err(|_| KeepError::Forbidden)?;

        self.mac(&locator.hash, token, hint.expiry)?
            .verify_slice(&claimed)
            .map_err(|_| {
                debug!(hash = %locator.hash, "signature mismatch");
                KeepError::Forbidden
            })?;

        if unix_secs(now) > hint.expiry {
            return Err(KeepError::Expired);
        }
        Ok(())
    }
}
