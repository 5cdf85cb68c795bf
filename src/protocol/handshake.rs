//! # Type Table Negotiation
//!
//! Each side opens with a `Hello` frame listing its registered types as
//! `(tag, name)` pairs. Tags are local to a registry, so the receiver builds a
//! [`TagMap`] from the peer's tags to its own by matching names. A connection
//! is `Open` once it has both sent its own table and received the peer's.
//!
//! Types only one side knows are tolerated: messages of those types fail to
//! decode with a conversion error and the connection carries on.

use crate::core::serialization::TypeRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::frame::{Frame, FrameKind};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// The `Hello` frame announcing `registry` for `peer_id`
pub fn hello(peer_id: u16, registry: &TypeRegistry) -> Frame {
    Frame::control(FrameKind::Hello {
        peer_id,
        types: registry.type_table(),
    })
}

/// Remote type tag to local type tag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap {
    remote_to_local: HashMap<u16, u16>,
}

impl TagMap {
    pub fn local(&self, remote_tag: u16) -> Result<u16> {
        self.remote_to_local.get(&remote_tag).copied().ok_or_else(|| {
            ProtocolError::Conversion(format!("peer type tag {remote_tag} has no local descriptor"))
        })
    }

    pub fn len(&self) -> usize {
        self.remote_to_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote_to_local.is_empty()
    }
}

/// Build the tag map from a peer's announced table
#[instrument(skip(registry, remote_types), fields(remote_types = remote_types.len()))]
pub fn negotiate(registry: &TypeRegistry, remote_types: &[(u16, String)]) -> Result<TagMap> {
    let mut remote_to_local = HashMap::with_capacity(remote_types.len());
    for (remote_tag, name) in remote_types {
        match registry.tag_by_name(name) {
            Some(local_tag) => {
                if remote_to_local.insert(*remote_tag, local_tag).is_some() {
                    return Err(ProtocolError::HandshakeError(format!(
                        "peer announced tag {remote_tag} twice"
                    )));
                }
            }
            None => warn!(remote_tag, type_name = %name, "Peer type unknown locally"),
        }
    }
    debug!(mapped = remote_to_local.len(), "Type table negotiated");
    Ok(TagMap { remote_to_local })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::field_serializable;

    #[derive(Debug, Default)]
    struct Alpha {
        a: i32,
    }
    field_serializable!(Alpha, "test.Alpha", { a: I32 });

    #[derive(Debug, Default)]
    struct Beta {
        b: i32,
    }
    field_serializable!(Beta, "test.Beta", { b: I32 });

    #[test]
    fn test_tags_map_by_name_across_registration_order() {
        let left = TypeRegistry::new();
        left.register_fields::<Alpha>().unwrap();
        left.register_fields::<Beta>().unwrap();

        let right = TypeRegistry::new();
        right.register_fields::<Beta>().unwrap();
        right.register_fields::<Alpha>().unwrap();

        let map = negotiate(&right, &left.type_table()).unwrap();
        let left_alpha = left.tag_of::<Alpha>().unwrap();
        assert_eq!(map.local(left_alpha).unwrap(), right.tag_of::<Alpha>().unwrap());
    }

    #[test]
    fn test_unknown_remote_type_is_skipped() {
        let local = TypeRegistry::new();
        let mut table = local.type_table();
        table.push((500, "elsewhere.Only".to_string()));
        let map = negotiate(&local, &table).unwrap();
        assert_eq!(map.len(), local.len());
        assert!(matches!(map.local(500), Err(ProtocolError::Conversion(_))));
    }

    #[test]
    fn test_duplicate_remote_tag_rejected() {
        let local = TypeRegistry::new();
        let table = vec![(1, "peerlink.Ping".to_string()), (1, "peerlink.Pong".to_string())];
        assert!(matches!(
            negotiate(&local, &table),
            Err(ProtocolError::HandshakeError(_))
        ));
    }

    #[test]
    fn test_hello_carries_type_table() {
        let registry = TypeRegistry::new();
        match hello(4, &registry).kind {
            FrameKind::Hello { peer_id, types } => {
                assert_eq!(peer_id, 4);
                assert_eq!(types, registry.type_table());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
