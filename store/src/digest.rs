/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::StoreError;

pub const FINGERPRINT_SIZE: usize = 32;

/// A SHA-256 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

/// sha256 of zero bytes.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

/// The digest of zero bytes, which is also the digest of the empty directory.
pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Fingerprint(hasher.finalize().into())
    }

    pub fn from_hex(hex_string: &str) -> Result<Fingerprint, StoreError> {
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        hex::decode_to_slice(hex_string, &mut bytes).map_err(|e| StoreError::InvalidFingerprint {
            input: hex_string.to_owned(),
            message: e.to_string(),
        })?;
        Ok(Fingerprint(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

/// Identifies a blob of bytes: either file contents or the serialized form of a directory tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Digest {
        Digest::new(Fingerprint::of(bytes), bytes.len())
    }

    pub fn is_empty(&self) -> bool {
        *self == EMPTY_DIGEST
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_digest_is_hash_of_nothing() {
        assert_eq!(Digest::of_bytes(b""), EMPTY_DIGEST);
        assert!(EMPTY_DIGEST.is_empty());
    }

    #[test]
    fn hex_parses_back() {
        let digest = Digest::of_bytes(b"hello");
        assert_eq!(
            digest.hash.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(Fingerprint::from_hex(&digest.hash.to_hex()).unwrap(), digest.hash);
        assert_eq!(digest.size_bytes, 5);
    }

    #[test]
    fn bad_hex_is_an_error() {
        assert!(Fingerprint::from_hex("abc").is_err());
    }
}
