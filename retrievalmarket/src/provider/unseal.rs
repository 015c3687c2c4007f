// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Payload traversal with on-demand unsealing. Blocks are resolved from
//! the local block-store; on a miss the piece holding the deal's payload
//! is located, unsealed through the node, and its CAR spliced into the
//! block-store before the lookup is retried.

use crate::node::RetrievalProviderNode;
use crate::types::Block;
use anyhow::anyhow;
use async_std::sync::Mutex;
use async_trait::async_trait;
use cid::Cid;
use futures::channel::mpsc::Sender;
use futures::SinkExt;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_car::CarReader;
use fvm_ipld_encoding::DAG_CBOR;
use ipld::selector::LinkResolver;
use ipld::Ipld;
use market_types::Prefix;
use parking_lot::Mutex as SyncMutex;
use piecestore::PieceStore;
use std::collections::HashMap;
use std::sync::Arc;

const IPLD_RAW: u64 = 0x55;

/// Per-piece locks serializing block-store writes during unsealing.
#[derive(Default)]
pub struct PieceLocks {
    locks: SyncMutex<HashMap<Cid, Arc<Mutex<()>>>>,
}

impl PieceLocks {
    fn lock_for(&self, piece_cid: &Cid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(*piece_cid)
            .or_insert_with(Default::default)
            .clone()
    }
}

/// Link loader feeding a deal's traversal: resolves blocks (unsealing
/// when necessary) and streams every loaded block to the deal's send
/// loop. The bounded channel pauses the traversal while the send loop
/// waits out a payment checkpoint.
pub struct UnsealingLoader<BS> {
    pub blockstore: Arc<BS>,
    pub piece_store: Arc<dyn PieceStore>,
    pub node: Arc<dyn RetrievalProviderNode>,
    pub payload_cid: Cid,
    pub piece_cid: Option<Cid>,
    pub piece_locks: Arc<PieceLocks>,
    pub blocks: Sender<anyhow::Result<Block>>,
}

impl<BS> UnsealingLoader<BS>
where
    BS: Blockstore + Send + Sync,
{
    /// Fetch a block's raw bytes, unsealing the backing piece on a miss.
    pub async fn load_raw(&self, cid: &Cid) -> anyhow::Result<Vec<u8>> {
        if let Some(data) = self.blockstore.get(cid)? {
            return Ok(data);
        }
        self.unseal_piece().await?;
        self.blockstore
            .get(cid)?
            .ok_or_else(|| anyhow!("block {} not found after unsealing", cid))
    }

    async fn unseal_piece(&self) -> anyhow::Result<()> {
        let cid_info = self.piece_store.get_cid_info(&self.payload_cid)?;
        let location = cid_info
            .piece_block_locations
            .iter()
            .find(|location| match &self.piece_cid {
                Some(piece_cid) => location.piece_cid == *piece_cid,
                None => true,
            })
            .ok_or_else(|| anyhow!("no piece holds payload {}", self.payload_cid))?;

        let piece_info = self.piece_store.get_piece_info(&location.piece_cid)?;
        let deal = piece_info
            .deals
            .first()
            .ok_or_else(|| anyhow!("no deals store piece {}", piece_info.piece_cid))?;

        let lock = self.piece_locks.lock_for(&piece_info.piece_cid);
        let _guard = lock.lock().await;

        let reader = self
            .node
            .unseal_sector(deal.sector_id, deal.offset, deal.length)
            .await?;
        let mut car = CarReader::new(reader)
            .await
            .map_err(|e| anyhow!("reading unsealed car: {}", e))?;
        while let Some(block) = car
            .next_block()
            .await
            .map_err(|e| anyhow!("reading unsealed car: {}", e))?
        {
            self.blockstore.put_keyed(&block.cid, &block.data)?;
        }
        Ok(())
    }
}

fn decode_block(cid: &Cid, data: &[u8]) -> Result<Ipld, String> {
    match cid.codec() {
        DAG_CBOR => encoding::from_slice(data).map_err(|e| e.to_string()),
        IPLD_RAW => Ok(Ipld::Bytes(data.to_vec())),
        codec => Err(format!("unsupported codec {} in payload", codec)),
    }
}

#[async_trait]
impl<BS> LinkResolver for UnsealingLoader<BS>
where
    BS: Blockstore + Send + Sync,
{
    async fn load_link(&mut self, link: &Cid) -> Result<Option<Ipld>, String> {
        let data = self.load_raw(link).await.map_err(|e| e.to_string())?;
        let block = Block {
            prefix: Prefix::from(link).to_bytes(),
            data: data.clone(),
        };
        self.blocks
            .send(Ok(block))
            .await
            .map_err(|_| "block consumer gone".to_string())?;
        decode_block(link, &data).map(Some)
    }
}
