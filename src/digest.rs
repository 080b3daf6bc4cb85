use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Digest: content address of a blob or manifest, canonically
/// `sha256:<64 lowercase hex chars>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    bytes: [u8; 32],
}

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest has wrong length")]
    WrongLength,
    #[error("unsupported digest algorithm, only sha256 is accepted")]
    UnsupportedAlgorithm,
    #[error("digest contains non-hex characters")]
    InvalidHex,
}

const PREFIX: &str = "sha256:";

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest { bytes }
    }

    /// Computes the sha256 digest of the given contents.
    pub fn of_contents(contents: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(contents);
        Digest {
            bytes: hasher.finalize().into(),
        }
    }

    /// The hex part without the `sha256:` prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let hex_part = match raw.split_once(':') {
            Some(("sha256", rest)) => rest,
            Some(_) => return Err(DigestParseError::UnsupportedAlgorithm),
            None => return Err(DigestParseError::WrongLength),
        };
        if hex_part.len() != 64 {
            return Err(DigestParseError::WrongLength);
        }
        if hex_part.bytes().any(|c| c.is_ascii_uppercase()) {
            return Err(DigestParseError::InvalidHex);
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes).map_err(|_| DigestParseError::InvalidHex)?;
        Ok(Digest { bytes })
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental sha256 state for chunked blob uploads.
#[derive(Clone)]
pub struct RunningDigest {
    hasher: Sha256,
}

impl Default for RunningDigest {
    fn default() -> Self {
        RunningDigest {
            hasher: Sha256::new(),
        }
    }
}

impl RunningDigest {
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish(self) -> Digest {
        Digest {
            bytes: self.hasher.finalize().into(),
        }
    }

    /// Serialized hasher state is not portable across versions, so uploads
    /// re-hash from storage on process restart instead of persisting this.
    pub fn of_stored_chunks<'a>(chunks: impl Iterator<Item = &'a [u8]>) -> Self {
        let mut state = RunningDigest::default();
        for chunk in chunks {
            state.update(chunk);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn parses_and_formats_canonical_digests() {
        let parsed: Digest = HELLO_WORLD.parse().unwrap();
        assert_eq!(parsed.to_string(), HELLO_WORLD);
        assert_eq!(parsed, Digest::of_contents(b"hello world"));
    }

    #[test]
    fn rejects_malformed_digests() {
        assert_eq!(
            "sha512:abc".parse::<Digest>(),
            Err(DigestParseError::UnsupportedAlgorithm)
        );
        assert_eq!(
            "sha256:abc".parse::<Digest>(),
            Err(DigestParseError::WrongLength)
        );
        let uppercase = HELLO_WORLD.to_uppercase().replace("SHA256", "sha256");
        assert_eq!(
            uppercase.parse::<Digest>(),
            Err(DigestParseError::InvalidHex)
        );
        assert_eq!(
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".parse::<Digest>(),
            Err(DigestParseError::WrongLength)
        );
    }

    #[test]
    fn running_digest_matches_one_shot() {
        let mut state = RunningDigest::default();
        state.update(b"hello");
        state.update(b" world");
        assert_eq!(state.finish(), Digest::of_contents(b"hello world"));
    }
}
