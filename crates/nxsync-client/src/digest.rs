use crate::TransferError;
use sha2::Digest as _;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Infers the algorithm from the length of a hex digest.
    pub fn guess(digest: &str) -> Result<Self, TransferError> {
        let digest = digest.trim();
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TransferError::UnknownDigest(digest.to_string()));
        }
        match digest.len() {
            32 => Ok(DigestAlgorithm::Md5),
            40 => Ok(DigestAlgorithm::Sha1),
            64 => Ok(DigestAlgorithm::Sha256),
            128 => Ok(DigestAlgorithm::Sha512),
            _ => Err(TransferError::UnknownDigest(digest.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            DigestAlgorithm::Md5 => Hasher::Md5(md5::Md5::new()),
            DigestAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    pub fn hex_digest(self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(TransferError::UnknownDigest(s.to_string())),
        }
    }
}

/// Incremental digest fed chunk by chunk.
pub enum Hasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hasher::Md5(_) => "md5",
            Hasher::Sha1(_) => "sha1",
            Hasher::Sha256(_) => "sha256",
            Hasher::Sha512(_) => "sha512",
        };
        f.debug_tuple("Hasher").field(&name).finish()
    }
}

/// Expected digest and the algorithm used to check it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDigest {
    pub value: String,
    pub algorithm: DigestAlgorithm,
}

impl ExpectedDigest {
    /// Uses `algorithm` when given, otherwise guesses from the digest.
    pub fn new(value: &str, algorithm: Option<DigestAlgorithm>) -> Result<Self, TransferError> {
        let algorithm = match algorithm {
            Some(a) => a,
            None => {
                let guessed = DigestAlgorithm::guess(value)?;
                tracing::trace!(algorithm = %guessed, "guessed digest algorithm from digest");
                guessed
            }
        };
        Ok(Self {
            value: value.trim().to_ascii_lowercase(),
            algorithm,
        })
    }

    pub fn matches(&self, actual: &str) -> bool {
        self.value.eq_ignore_ascii_case(actual)
    }
}
