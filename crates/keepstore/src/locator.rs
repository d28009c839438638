//! Locator codec: `hash+size+hints` strings and the signature hint.
//!
//! A locator names a block by the lowercase hex MD5 of its contents,
//! optionally followed by its size and a list of `+`-separated hints.
//! The size, when present, is always the first hint. Other hints start
//! with an uppercase letter; `A` marks a permission signature and `R`
//! a remote reference.

use std::fmt;
use std::str::FromStr;

use crate::error::{KeepError, KeepResult};

/// Length of a block hash in hex digits.
pub const HASH_LEN: usize = 32;

/// Returns the lowercase hex MD5 digest of `data`.
pub fn block_hash(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// True if `s` is exactly 32 lowercase hex digits.
pub fn is_block_hash(s: &str) -> bool {
    s.len() == HASH_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_valid_hint(hint: &str) -> bool {
    let mut chars = hint.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '_' | '-'))
}

/// A parsed block locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    /// Lowercase hex MD5 of the block contents.
    pub hash: String,
    /// Block size in bytes, if the locator carried one.
    pub size: Option<u64>,
    /// Remaining hints in their original order.
    pub hints: Vec<String>,
}

impl Locator {
    /// Builds a bare `hash+size` locator.
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: hash.into(),
            size: Some(size),
            hints: Vec::new(),
        }
    }

    /// Builds the locator for `data`.
    pub fn for_data(data: &[u8]) -> Self {
        Self::new(block_hash(data), data.len() as u64)
    }

    /// Parses a locator string.
    pub fn parse(s: &str) -> KeepResult<Self> {
        let invalid = || KeepError::InvalidLocator {
            locator: s.to_string(),
        };
        let mut parts = s.split('+');
        let hash = parts.next().ok_or_else(invalid)?;
        if !is_block_hash(hash) {
            return Err(invalid());
        }

        let mut size = None;
        let mut hints = Vec::new();
        for (i, part) in parts.enumerate() {
            if part.is_empty() {
                return Err(invalid());
            }
            if i == 0 && part.bytes().all(|b| b.is_ascii_digit()) {
                size = Some(part.parse().map_err(|_| invalid())?);
                continue;
            }
            if !is_valid_hint(part) {
                return Err(invalid());
            }
            hints.push(part.to_string());
        }

        Ok(Self {
            hash: hash.to_string(),
            size,
            hints,
        })
    }

    /// The first permission signature hint (without the leading `A`), if any.
    pub fn signature_hint(&self) -> Option<&str> {
        self.hints
            .iter()
            .find(|h| h.starts_with('A'))
            .map(|h| &h[1..])
    }

    /// True if the locator carries a permission signature.
    pub fn is_signed(&self) -> bool {
        self.signature_hint().is_some()
    }

    /// True if the locator references a block held by a remote cluster.
    pub fn is_remote(&self) -> bool {
        self.hints.iter().any(|h| h.starts_with('R'))
    }

    /// Copy of this locator with every signature hint removed.
    pub fn without_signature(&self) -> Self {
        Self {
            hash: self.hash.clone(),
            size: self.size,
            hints: self
                .hints
                .iter()
                .filter(|h| !h.starts_with('A'))
                .cloned()
                .collect(),
        }
    }

    /// Appends a hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)?;
        if let Some(size) = self.size {
            write!(f, "+{}", size)?;
        }
        for hint in &self.hints {
            write!(f, "+{}", hint)?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = KeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Decoded `A<signature>@<expiry>` hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHint {
    /// Hex-encoded HMAC.
    pub signature: String,
    /// Expiry as unix seconds.
    pub expiry: u64,
}

impl SignatureHint {
    /// Parses the hint body that follows the `A` prefix.
    pub fn parse(body: &str) -> Option<Self> {
        let (signature, expiry_hex) = body.split_once('@')?;
        if signature.is_empty() || !signature.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let expiry = u64::from_str_radix(expiry_hex, 16).ok()?;
        Some(Self {
            signature: signature.to_string(),
            expiry,
        })
    }

    /// Renders the full hint, including the `A` prefix.
    pub fn to_hint(&self) -> String {
        format!("A{}@{}", self.signature, expiry_hex(self.expiry))
    }
}

/// Formats an expiry timestamp the way signature hints carry it.
pub fn expiry_hex(expiry: u64) -> String {
    format!("{:08x}", expiry)
}
