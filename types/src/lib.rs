// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Types shared between the storage and retrieval market crates.

mod prefix;

pub use self::prefix::Prefix;

use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use ipld::selector::{RecursionLimit, Selector};

/// Opaque token identifying a chain tip. Node implementations resolve
/// signature and address lookups against the tip the token names.
pub type TipSetToken = Vec<u8>;

/// Off-chain payment-channel coordinates a deal pays through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct PaymentInfo {
    /// Address of the payment channel actor
    pub payment_channel: Address,
    /// Lane vouchers for this deal are issued on
    pub lane: u64,
}

/// Selector covering every node reachable from the root: the default
/// traversal for whole-DAG transfers.
pub fn all_selector() -> Selector {
    Selector::ExploreRecursive {
        sequence: Box::new(Selector::ExploreAll {
            next: Box::new(Selector::ExploreRecursiveEdge),
        }),
        limit: RecursionLimit::None,
        stop_at: None,
        current: None,
    }
}

/// Serde for [`libp2p::PeerId`] as its canonical byte representation,
/// for peer ids embedded in persisted deal records.
pub mod peerid_ser {
    use fvm_ipld_encoding::serde_bytes::ByteBuf;
    use libp2p::PeerId;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(peer: &PeerId, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&peer.to_bytes())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PeerId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bz = ByteBuf::deserialize(deserializer)?;
        PeerId::from_bytes(&bz).map_err(|e| de::Error::custom(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_ipld_encoding::{from_slice, to_vec};
    use libp2p::PeerId;
    use serde::{Deserialize, Serialize};

    #[test]
    fn payment_info_roundtrip() {
        let info = PaymentInfo {
            payment_channel: Address::new_id(77),
            lane: 3,
        };
        let bz = to_vec(&info).unwrap();
        assert_eq!(from_slice::<PaymentInfo>(&bz).unwrap(), info);
    }

    #[test]
    fn peer_id_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper(#[serde(with = "peerid_ser")] PeerId);

        let peer = PeerId::random();
        let bz = to_vec(&Wrapper(peer.clone())).unwrap();
        let decoded: Wrapper = from_slice(&bz).unwrap();
        assert_eq!(decoded.0, peer);
    }

    #[test]
    fn all_selector_is_recursive() {
        match all_selector() {
            Selector::ExploreRecursive { limit, .. } => {
                assert_eq!(limit, RecursionLimit::None);
            }
            _ => panic!("default selector must recurse"),
        }
    }
}
