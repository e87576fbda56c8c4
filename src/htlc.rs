//! Read-only views of incoming HTLCs, and the wallet-level events an FSM
//! reacts to.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{
    BlockHeight, ChannelId, FullPaymentTag, HtlcId, MsatAmount, PaymentSecret,
};

/// Per-variant payload carried by one incoming HTLC.
///
/// Not `Serialize`/`Deserialize`: these are ephemeral, in-process snapshot
/// views, not persisted or wire types, and `outgoing_node_id`/`src_node_id`
/// below are 33-byte compressed pubkeys, a length serde's array impls don't
/// cover.
#[derive(Clone, Debug)]
pub enum HtlcPayload {
    /// Payload for a [`PaymentKind::FinalIncoming`] HTLC.
    ///
    /// [`PaymentKind::FinalIncoming`]: crate::types::PaymentKind::FinalIncoming
    Local { total_amount: MsatAmount },
    /// Payload for a [`PaymentKind::TrampolineRouted`] HTLC.
    ///
    /// [`PaymentKind::TrampolineRouted`]: crate::types::PaymentKind::TrampolineRouted
    Trampoline {
        outer_total_amount: MsatAmount,
        inner: TrampolineInner,
        /// Opaque onion payload to forward if we relay trampoline-to-trampoline.
        next_packet: Vec<u8>,
    },
}

/// The decoded inner trampoline onion hop.
#[derive(Clone, Debug)]
pub struct TrampolineInner {
    pub amount_to_forward: MsatAmount,
    pub outgoing_cltv: BlockHeight,
    pub outgoing_node_id: [u8; 33],
    /// `Some` iff the sender instructs us to relay to a non-trampoline,
    /// MPP-capable recipient.
    pub payment_secret: Option<PaymentSecret>,
    pub invoice_features_set: bool,
    pub invoice_routing_info: Vec<RoutingHint>,
}

/// An extra graph edge taken from invoice routing hints.
#[derive(Clone, Debug)]
pub struct RoutingHint {
    pub src_node_id: [u8; 33],
    pub short_channel_id: u64,
    pub base_fee_msat: u32,
    pub proportional_fee_millionths: u32,
    pub cltv_expiry_delta: u16,
}

/// A decoded, validated incoming HTLC, as handed to an FSM in a snapshot.
#[derive(Clone, Debug)]
pub struct IncomingHtlc {
    pub channel_id: ChannelId,
    pub htlc_id: HtlcId,
    pub amount: MsatAmount,
    pub cltv_expiry: BlockHeight,
    pub payload: HtlcPayload,
}

impl IncomingHtlc {
    pub fn local_total_amount(&self) -> Option<MsatAmount> {
        match &self.payload {
            HtlcPayload::Local { total_amount } => Some(*total_amount),
            HtlcPayload::Trampoline { .. } => None,
        }
    }

    pub fn trampoline_inner(&self) -> Option<&TrampolineInner> {
        match &self.payload {
            HtlcPayload::Trampoline { inner, .. } => Some(inner),
            HtlcPayload::Local { .. } => None,
        }
    }

    pub fn outer_total_amount(&self) -> Option<MsatAmount> {
        match &self.payload {
            HtlcPayload::Trampoline {
                outer_total_amount, ..
            } => Some(*outer_total_amount),
            HtlcPayload::Local { .. } => None,
        }
    }
}

/// A single outgoing send attempt dispatched on behalf of a trampoline relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingAttempt {
    pub amount: MsatAmount,
}

/// The wallet's periodic, consistent view of all unresolved HTLCs, grouped by
/// payment tag.
#[derive(Clone, Debug, Default)]
pub struct InFlightPayments {
    pub incoming: HashMap<FullPaymentTag, Vec<IncomingHtlc>>,
    pub outgoing: HashMap<FullPaymentTag, Vec<OutgoingAttempt>>,
}

impl InFlightPayments {
    pub fn incoming_for(&self, tag: &FullPaymentTag) -> &[IncomingHtlc] {
        self.incoming.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing_for(&self, tag: &FullPaymentTag) -> &[OutgoingAttempt] {
        self.outgoing.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True iff neither map contains any entry for `tag`.
    pub fn is_empty_for(&self, tag: &FullPaymentTag) -> bool {
        self.incoming_for(tag).is_empty() && self.outgoing_for(tag).is_empty()
    }
}

/// A single remote failure observed on one outgoing part.
#[derive(Clone, Debug)]
pub struct OutgoingFailure {
    /// The node that generated the failure, if it was a remote (onion-wrapped)
    /// failure and we could decrypt who sent it.
    pub origin_node_id: Option<[u8; 33]>,
    pub message: OutgoingFailureKind,
}

/// The shape of a single outgoing-send failure, before we've picked the one
/// upstream message to report.
#[derive(Clone, Debug)]
pub enum OutgoingFailureKind {
    /// We never found a usable route (a purely local failure).
    NoRouteFound,
    /// A remote node in the route sent back a wire failure message.
    Remote(crate::types::FailureMessage),
}
