use std::any::Any;
use std::sync::Arc;

/// A type-erased, thread-safe container for goal outputs.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// A 32-byte BLAKE3 key identifying a computation by its content.
///
/// An `Identity` is derived deterministically from a computation's inputs and
/// configuration, so two invocations with equal identities are assumed to
/// produce equivalent results. The caching layer uses it to look up stored
/// values instead of recomputing them.
///
/// Identities for nested sub-results are derived with [`extend`](Self::extend),
/// which folds a child's local name into the parent key. This keeps per-leaf
/// keys stable without the caller enumerating them manually.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Identity([u8; 32]);

impl<T> From<T> for Identity
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Identity(value.into())
    }
}

impl Identity {
    /// Derives an identity from raw input bytes.
    pub fn of(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Derives the identity of a named child of this computation.
    pub fn extend(&self, name: &str) -> Self {
        blake3::Hasher::new()
            .update(&self.0)
            .update(name.as_bytes())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(Identity::of("abc"), Identity::of("abc"));
        assert_ne!(Identity::of("abc"), Identity::of("abd"));
    }

    #[test]
    fn test_extend_depends_on_name() {
        let base = Identity::of("base");
        assert_eq!(base.extend("x"), base.extend("x"));
        assert_ne!(base.extend("x"), base.extend("y"));
        assert_ne!(base.extend("x"), base);
    }

    #[test]
    fn test_hex_shape() {
        let hex = Identity::of("abc").to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
