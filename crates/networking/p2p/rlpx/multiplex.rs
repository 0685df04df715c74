use std::cmp::Ordering;
use std::collections::HashSet;

use crate::subprotocol::SubprotocolRegistry;

use super::{error::RLPxError, p2p::Capability};

/// Message ids 0..=15 are reserved for the devp2p base protocol; capability
/// ranges start above them.
pub(crate) const BASE_SUBPROTOCOL_ID: u8 = 16;

/// One negotiated wire-id range. Subprotocol ids `0..=hi-lo` map onto wire
/// ids `lo..=hi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CapabilityRange {
    pub lo: u8,
    pub hi: u8,
    /// Index of the serving subprotocol in the registry.
    pub subprotocol: usize,
    /// The capability this range was negotiated for.
    pub capability: Capability,
}

/// Per-connection mapping from wire message ids (>= 16) to subprotocols,
/// derived from the peer's Hello. Both ends must compute identical tables
/// or every multiplexed message id desynchronizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct OffsetMap {
    ranges: Vec<CapabilityRange>,
}

impl OffsetMap {
    /// Allocates ranges over the peer's capabilities in the exact order they
    /// were advertised. Each selected capability takes `message_space + 1`
    /// ids with the first one skipped; the resulting gap ids are part of the
    /// devp2p numbering and must not be compacted away.
    pub(crate) fn negotiate(
        peer_capabilities: &[Capability],
        registry: &SubprotocolRegistry,
    ) -> Result<Self, RLPxError> {
        let mut names = HashSet::new();
        for capability in peer_capabilities {
            if !names.insert(capability.name.as_str()) {
                return Err(RLPxError::ProtocolBreach(format!(
                    "duplicate capability {} in hello",
                    capability.name
                )));
            }
        }

        let mut ranges = Vec::new();
        let mut start = BASE_SUBPROTOCOL_ID as u16;
        for capability in peer_capabilities {
            let Some((index, subprotocol)) = registry.find_supporting(capability) else {
                continue;
            };
            let space = subprotocol.message_space(capability.version) as u16;
            let hi = start + space + 1;
            if hi > u8::MAX as u16 {
                return Err(RLPxError::ProtocolBreach(
                    "capability message id space exhausted".to_string(),
                ));
            }
            ranges.push(CapabilityRange {
                lo: (start + 1) as u8,
                hi: hi as u8,
                subprotocol: index,
                capability: capability.clone(),
            });
            start = hi;
        }
        Ok(Self { ranges })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub(crate) fn ranges(&self) -> &[CapabilityRange] {
        &self.ranges
    }

    /// Resolves an inbound wire id to its range and subprotocol-local id.
    pub(crate) fn lookup_inbound(&self, wire_id: u8) -> Option<(&CapabilityRange, u8)> {
        let index = self
            .ranges
            .binary_search_by(|range| {
                if wire_id < range.lo {
                    Ordering::Greater
                } else if wire_id > range.hi {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .ok()?;
        let range = &self.ranges[index];
        Some((range, wire_id - range.lo))
    }

    /// Resolves an outbound `(capability, local id)` pair to a wire id using
    /// the first range whose handler supports the requested capability.
    pub(crate) fn lookup_outbound(
        &self,
        registry: &SubprotocolRegistry,
        capability: &Capability,
        msg_id: u8,
    ) -> Option<u8> {
        self.ranges
            .iter()
            .find(|range| {
                msg_id <= range.hi - range.lo
                    && registry
                        .get(range.subprotocol)
                        .is_some_and(|subprotocol| subprotocol.supports(capability))
            })
            .map(|range| range.lo + msg_id)
    }
}
