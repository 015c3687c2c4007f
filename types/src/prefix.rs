// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::multihash::{Code, MultihashDigest};
use cid::{Cid, Version};
use integer_encoding::{VarIntReader, VarIntWriter};
use std::convert::TryFrom;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid prefix bytes: {0}")]
    Bytes(#[from] std::io::Error),
    #[error("invalid cid version {0}")]
    Version(u64),
    #[error("unsupported multihash code {0}")]
    MultihashCode(u64),
    #[error(transparent)]
    Cid(#[from] cid::Error),
}

/// Metadata of a [`Cid`] without the content digest. Payload blocks cross
/// the wire as (prefix, data) pairs; the receiver recomputes the digest
/// to recover and check the block's Cid.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Prefix {
    pub version: Version,
    pub codec: u64,
    pub mh_type: u64,
    pub mh_len: usize,
}

impl Prefix {
    /// Generate new prefix from encoded bytes
    pub fn new_from_bytes(data: &[u8]) -> Result<Prefix, Error> {
        let mut cur = Cursor::new(data);

        let raw_version: u64 = cur.read_varint()?;
        let codec = cur.read_varint()?;
        let mh_type: u64 = cur.read_varint()?;
        let mh_len: usize = cur.read_varint()?;

        let version = Version::try_from(raw_version).map_err(|_| Error::Version(raw_version))?;

        Ok(Prefix {
            version,
            codec,
            mh_type,
            mh_len,
        })
    }

    /// Encodes prefix to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(4);

        // io can't fail on Vec
        res.write_varint(u64::from(self.version)).unwrap();
        res.write_varint(self.codec).unwrap();
        res.write_varint(self.mh_type).unwrap();
        res.write_varint(self.mh_len).unwrap();

        res
    }

    /// Hashes `data` with the prefix's digest function and returns the
    /// resulting Cid.
    pub fn to_cid(&self, data: &[u8]) -> Result<Cid, Error> {
        let hasher = Code::try_from(self.mh_type).map_err(|_| Error::MultihashCode(self.mh_type))?;
        let mh = hasher.digest(data);
        Ok(Cid::new(self.version, self.codec, mh)?)
    }
}

impl From<&Cid> for Prefix {
    fn from(cid: &Cid) -> Self {
        Prefix {
            version: cid.version(),
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: cid.hash().size() as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_ipld_encoding::DAG_CBOR;

    #[test]
    fn prefix_roundtrip() {
        let data = b"some data";
        let cid = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(data));

        let prefix = Prefix::from(&cid);
        let parsed = Prefix::new_from_bytes(&prefix.to_bytes()).unwrap();
        assert_eq!(prefix, parsed);
        assert_eq!(parsed.to_cid(data).unwrap(), cid);
    }
}
