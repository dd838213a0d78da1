//! In-memory protection of sensitive values
//!
//! A protected value never sits in memory as plaintext. It is XORed with a
//! Salsa20 keystream derived from a per-database [`MemoryMask`] and a nonce
//! unique to the value, and only revealed into a zeroizing buffer on demand.

use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::random_bytes;

/// Obfuscation key shared by the protected values of one database
pub struct MemoryMask {
    key: [u8; 32],
    next_nonce: AtomicU64,
}

impl MemoryMask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            key: random_bytes::<32>(),
            next_nonce: AtomicU64::new(0),
        })
    }

    fn apply(&self, nonce: u64, data: &mut [u8]) {
        let mut cipher = Salsa20::new(&self.key.into(), &nonce.to_le_bytes().into());
        cipher.apply_keystream(data);
    }

    fn mask(self: &Arc<Self>, plain: &[u8]) -> Masked {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let mut ciphertext = plain.to_vec();
        self.apply(nonce, &mut ciphertext);
        Masked {
            ciphertext,
            nonce,
            mask: Arc::clone(self),
        }
    }

    /// Protect a string under this mask
    pub fn protect(self: &Arc<Self>, value: &str) -> ProtectedString {
        ProtectedString(ProtectedBytes::Masked(self.mask(value.as_bytes())))
    }
}

impl Drop for MemoryMask {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MemoryMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryMask(***)")
    }
}

#[derive(Clone)]
struct Masked {
    ciphertext: Vec<u8>,
    nonce: u64,
    mask: Arc<MemoryMask>,
}

impl Masked {
    fn reveal(&self) -> Zeroizing<Vec<u8>> {
        let mut plain = Zeroizing::new(self.ciphertext.clone());
        self.mask.apply(self.nonce, &mut plain);
        plain
    }
}

#[derive(Clone)]
enum ProtectedBytes {
    Plain(Zeroizing<Vec<u8>>),
    Masked(Masked),
}

impl ProtectedBytes {
    fn new(data: &[u8], protect: bool) -> Self {
        if protect {
            ProtectedBytes::Masked(MemoryMask::new().mask(data))
        } else {
            ProtectedBytes::Plain(Zeroizing::new(data.to_vec()))
        }
    }

    fn reveal(&self) -> Zeroizing<Vec<u8>> {
        match self {
            ProtectedBytes::Plain(data) => data.clone(),
            ProtectedBytes::Masked(masked) => masked.reveal(),
        }
    }

    fn is_protected(&self) -> bool {
        matches!(self, ProtectedBytes::Masked(_))
    }

    fn len(&self) -> usize {
        match self {
            ProtectedBytes::Plain(data) => data.len(),
            ProtectedBytes::Masked(masked) => masked.ciphertext.len(),
        }
    }

    fn set_protected(&mut self, protect: bool, mask: Option<&Arc<MemoryMask>>) {
        if protect == self.is_protected() {
            return;
        }
        let plain = self.reveal();
        *self = match (protect, mask) {
            (true, Some(mask)) => ProtectedBytes::Masked(mask.mask(&plain)),
            _ => ProtectedBytes::new(&plain, protect),
        };
    }

    fn remask(&mut self, mask: &Arc<MemoryMask>) {
        if let ProtectedBytes::Masked(masked) = self {
            if Arc::ptr_eq(&masked.mask, mask) {
                return;
            }
            let plain = masked.reveal();
            *masked = mask.mask(&plain);
        }
    }
}

/// A string with an in-memory protection flag.
///
/// Deliberately not `PartialEq`: use [`ProtectedString::same_value`].
#[derive(Clone)]
pub struct ProtectedString(ProtectedBytes);

impl ProtectedString {
    /// A standalone value. Protected values get a mask of their own until
    /// they are added to a database.
    pub fn new(value: &str, protect: bool) -> Self {
        Self(ProtectedBytes::new(value.as_bytes(), protect))
    }

    pub fn plain(value: &str) -> Self {
        Self::new(value, false)
    }

    pub fn protected(value: &str) -> Self {
        Self::new(value, true)
    }

    pub fn empty() -> Self {
        Self::plain("")
    }

    /// Recover the plaintext into a buffer that is wiped on drop
    pub fn reveal(&self) -> Zeroizing<String> {
        let bytes = self.0.reveal();
        Zeroizing::new(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn is_protected(&self) -> bool {
        self.0.is_protected()
    }

    /// Length in bytes of the UTF-8 value
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub fn set_protected(&mut self, protect: bool) {
        self.0.set_protected(protect, None);
    }

    pub fn same_value(&self, other: &ProtectedString) -> bool {
        *self.0.reveal() == *other.0.reveal()
    }

    pub(crate) fn remask(&mut self, mask: &Arc<MemoryMask>) {
        self.0.remask(mask);
    }
}

impl Default for ProtectedString {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<&str> for ProtectedString {
    fn from(value: &str) -> Self {
        Self::plain(value)
    }
}

impl std::fmt::Debug for ProtectedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_protected() {
            write!(f, "ProtectedString(***)")
        } else {
            write!(f, "ProtectedString(plain, {} bytes)", self.len())
        }
    }
}

/// Attachment data with an in-memory protection flag
#[derive(Clone)]
pub struct ProtectedBinary(ProtectedBytes);

impl ProtectedBinary {
    pub fn new(data: &[u8], protect: bool) -> Self {
        Self(ProtectedBytes::new(data, protect))
    }

    pub fn reveal(&self) -> Zeroizing<Vec<u8>> {
        self.0.reveal()
    }

    pub fn is_protected(&self) -> bool {
        self.0.is_protected()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub fn set_protected(&mut self, protect: bool) {
        self.0.set_protected(protect, None);
    }

    pub fn same_value(&self, other: &ProtectedBinary) -> bool {
        *self.0.reveal() == *other.0.reveal()
    }

    pub(crate) fn remask(&mut self, mask: &Arc<MemoryMask>) {
        self.0.remask(mask);
    }
}

impl std::fmt::Debug for ProtectedBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProtectedBinary({}, {} bytes)",
            if self.is_protected() { "protected" } else { "plain" },
            self.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_value_is_not_stored_in_clear() {
        let secret = ProtectedString::protected("hunter2-hunter2");
        match &secret.0 {
            ProtectedBytes::Masked(m) => assert_ne!(m.ciphertext, b"hunter2-hunter2"),
            ProtectedBytes::Plain(_) => panic!("expected a masked value"),
        }
        assert_eq!(secret.reveal().as_str(), "hunter2-hunter2");
    }

    #[test]
    fn test_values_under_one_mask_use_distinct_keystreams() {
        let mask = MemoryMask::new();
        let a = mask.protect("same");
        let b = mask.protect("same");
        let (ProtectedBytes::Masked(ma), ProtectedBytes::Masked(mb)) = (&a.0, &b.0) else {
            panic!("expected masked values");
        };
        assert_ne!(ma.ciphertext, mb.ciphertext);
        assert!(a.same_value(&b));
    }

    #[test]
    fn test_toggle_protection() {
        let mut value = ProtectedString::plain("visible");
        assert!(!value.is_protected());
        value.set_protected(true);
        assert!(value.is_protected());
        assert_eq!(value.reveal().as_str(), "visible");
        value.set_protected(false);
        assert_eq!(value.reveal().as_str(), "visible");
    }

    #[test]
    fn test_remask_keeps_value() {
        let mut value = ProtectedString::protected("moved");
        let mask = MemoryMask::new();
        value.remask(&mask);
        assert_eq!(value.reveal().as_str(), "moved");
        let ProtectedBytes::Masked(m) = &value.0 else {
            panic!("expected a masked value");
        };
        assert!(Arc::ptr_eq(&m.mask, &mask));
    }

    #[test]
    fn test_debug_hides_secret() {
        let value = ProtectedString::protected("do-not-print");
        assert!(!format!("{:?}", value).contains("do-not-print"));
    }

    #[test]
    fn test_binary_roundtrip() {
        let data = vec![0u8, 1, 2, 250, 255];
        let bin = ProtectedBinary::new(&data, true);
        assert_eq!(bin.len(), 5);
        assert_eq!(&*bin.reveal(), &data);
    }
}
