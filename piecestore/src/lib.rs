// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Durable index from payload data to the pieces and sectors it is
//! stored in. The storage provider writes entries at deal hand-off; the
//! retrieval provider reads them to answer queries and locate sectors
//! for unsealing.

mod types;

pub use self::types::{BlockLocation, CidInfo, DealInfo, PieceBlockLocation, PieceInfo};

use cid::Cid;
use db::Store;
use fvm_ipld_encoding::{from_slice, to_vec};
use std::sync::Arc;
use thiserror::Error;

const PIECE_PREFIX: &str = "/storagemarket/pieces";
const CID_INFO_PREFIX: &str = "/storagemarket/cid-infos";

#[derive(Debug, Error)]
pub enum Error {
    /// No entry for the queried Cid. Callers distinguish this from a
    /// store failure.
    #[error("piece store: not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] db::Error),
    #[error("{0}")]
    Encoding(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Error {
        Error::Encoding(e.to_string())
    }
}

/// Mapping of payload data to storage pieces and on-chain deals.
pub trait PieceStore: Send + Sync {
    /// Record that `deal_info`'s deal stores the piece `piece_cid`.
    fn add_deal_for_piece(&self, piece_cid: &Cid, deal_info: DealInfo) -> Result<(), Error>;

    /// Record where payload blocks live inside a piece.
    fn add_piece_block_locations(
        &self,
        piece_cid: &Cid,
        locations: &[(Cid, BlockLocation)],
    ) -> Result<(), Error>;

    fn get_piece_info(&self, piece_cid: &Cid) -> Result<PieceInfo, Error>;

    fn get_cid_info(&self, payload_cid: &Cid) -> Result<CidInfo, Error>;

    fn has_piece_info(&self, piece_cid: &Cid) -> Result<bool, Error> {
        match self.get_piece_info(piece_cid) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// [`PieceStore`] over any [`Store`] backend.
pub struct DbPieceStore<DB> {
    db: Arc<DB>,
}

impl<DB> DbPieceStore<DB> {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }
}

impl<DB> DbPieceStore<DB>
where
    DB: Store,
{
    fn key(prefix: &str, cid: &Cid) -> Vec<u8> {
        format!("{}/{}", prefix, cid).into_bytes()
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: Vec<u8>) -> Result<Option<T>, Error> {
        match self.db.read(key)? {
            Some(bz) => Ok(Some(from_slice(&bz)?)),
            None => Ok(None),
        }
    }

    fn write<T: serde::Serialize>(&self, key: Vec<u8>, value: &T) -> Result<(), Error> {
        self.db.write(key, to_vec(value)?)?;
        Ok(())
    }
}

impl<DB> PieceStore for DbPieceStore<DB>
where
    DB: Store + Send + Sync,
{
    fn add_deal_for_piece(&self, piece_cid: &Cid, deal_info: DealInfo) -> Result<(), Error> {
        let key = Self::key(PIECE_PREFIX, piece_cid);
        let mut info: PieceInfo = self.read(key.clone())?.unwrap_or_else(|| PieceInfo {
            piece_cid: *piece_cid,
            deals: Vec::new(),
        });
        if !info.deals.contains(&deal_info) {
            info.deals.push(deal_info);
        }
        self.write(key, &info)
    }

    fn add_piece_block_locations(
        &self,
        piece_cid: &Cid,
        locations: &[(Cid, BlockLocation)],
    ) -> Result<(), Error> {
        for (payload_cid, location) in locations {
            let key = Self::key(CID_INFO_PREFIX, payload_cid);
            let mut info: CidInfo = self.read(key.clone())?.unwrap_or_else(|| CidInfo {
                cid: *payload_cid,
                piece_block_locations: Vec::new(),
            });
            let entry = PieceBlockLocation {
                piece_cid: *piece_cid,
                location: location.clone(),
            };
            if !info.piece_block_locations.contains(&entry) {
                info.piece_block_locations.push(entry);
            }
            self.write(key, &info)?;
        }
        Ok(())
    }

    fn get_piece_info(&self, piece_cid: &Cid) -> Result<PieceInfo, Error> {
        self.read(Self::key(PIECE_PREFIX, piece_cid))?
            .ok_or(Error::NotFound)
    }

    fn get_cid_info(&self, payload_cid: &Cid) -> Result<CidInfo, Error> {
        self.read(Self::key(CID_INFO_PREFIX, payload_cid))?
            .ok_or(Error::NotFound)
    }
}
