// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::deal::DealID;
use fvm_shared::sector::SectorNumber;

/// One on-chain deal a piece is stored under, with the sector region
/// the piece occupies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct DealInfo {
    pub deal_id: DealID,
    pub sector_id: SectorNumber,
    /// Padded offset of the piece within the sector
    pub offset: u64,
    /// Padded length of the piece
    pub length: u64,
}

/// Position of a single payload block inside a piece.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct BlockLocation {
    pub rel_offset: u64,
    pub block_size: u64,
}

/// [`BlockLocation`] qualified by the piece holding the block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct PieceBlockLocation {
    pub piece_cid: Cid,
    pub location: BlockLocation,
}

/// Every piece location known for one payload block Cid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct CidInfo {
    pub cid: Cid,
    pub piece_block_locations: Vec<PieceBlockLocation>,
}

/// Piece metadata: the deals a piece appears in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct PieceInfo {
    pub piece_cid: Cid,
    pub deals: Vec<DealInfo>,
}
