//! External collaborators each FSM is handed a non-owning handle to: the
//! clock/chain-height oracle (C2), the preimage & invoice store (C3), the
//! channel command bus (C4), and the outgoing-payment sender (C5).
//!
//! The FSMs never talk to channels, the database, or the router directly;
//! every side effect crosses one of these trait boundaries so the state
//! machines stay synchronous, single-threaded actors.

use async_trait::async_trait;

use crate::types::{
    BlockHeight, ChannelId, FullPaymentTag, HtlcId, MsatAmount, PaymentHash,
    PaymentInfo, PaymentSecret, Preimage,
};

/// C2: supplies the current chain height. Must be monotonic.
pub trait ChainClock: Send + Sync + 'static {
    fn current_block_height(&self) -> BlockHeight;
}

/// C3: lookup of known preimages and invoice metadata by payment hash.
///
/// Implementations are expected to memoize `get_payment_info`/`get_preimage`;
/// callers that transition an FSM to `Revealed` must call
/// [`PreimageInvoiceStore::invalidate`] so that subsequent reads observe the
/// persisted state.
#[async_trait]
pub trait PreimageInvoiceStore: Send + Sync + 'static {
    async fn get_payment_info(
        &self,
        hash: PaymentHash,
    ) -> anyhow::Result<Option<PaymentInfo>>;

    async fn get_preimage(
        &self,
        hash: PaymentHash,
    ) -> anyhow::Result<Option<Preimage>>;

    async fn update_incoming_succeeded(
        &self,
        hash: PaymentHash,
        amount: MsatAmount,
    ) -> anyhow::Result<()>;

    async fn store_preimage(
        &self,
        hash: PaymentHash,
        preimage: Preimage,
    ) -> anyhow::Result<()>;

    async fn add_relayed_preimage_info(
        &self,
        hash: PaymentHash,
        preimage: Preimage,
        amount_forwarded: MsatAmount,
        final_fee: MsatAmount,
    ) -> anyhow::Result<()>;

    /// Invalidate any memoized `get_payment_info`/`get_preimage` entries for
    /// `hash`, so that readers observe the just-persisted state.
    fn invalidate(&self, hash: PaymentHash);
}

/// C4: fulfill/fail commands routed back to the channel holding each HTLC.
///
/// The channel layer must treat duplicate fulfill/fail for the same
/// `(channel_id, htlc_id)` as a no-op; FSMs re-emit their terminal decision on
/// every snapshot that still shows the HTLC, to survive command loss and
/// restarts.
pub trait ChannelCommandBus: Send + Sync + 'static {
    fn fulfill(&self, channel_id: ChannelId, htlc_id: HtlcId, preimage: Preimage);

    fn fail(
        &self,
        channel_id: ChannelId,
        htlc_id: HtlcId,
        failure: crate::types::FailureMessage,
    );

    /// Shortcut for `fail(.., IncorrectOrUnknownPaymentDetails(amount))`.
    fn fail_incorrect_details(
        &self,
        channel_id: ChannelId,
        htlc_id: HtlcId,
        amount: MsatAmount,
    ) {
        self.fail(
            channel_id,
            htlc_id,
            crate::types::FailureMessage::incorrect_details(amount),
        );
    }
}

/// Parameters for a multipart outgoing send, dispatched by the trampoline
/// relayer once a covered, validated incoming set is ready to forward.
#[derive(Clone, Debug)]
pub struct SendMultiPartRequest {
    pub full_tag: FullPaymentTag,
    pub max_cltv: u32,
    pub destination_node_id: [u8; 33],
    pub amount_to_forward: MsatAmount,
    pub fee_reserve: MsatAmount,
    pub outgoing_cltv: BlockHeight,
    pub dispatch: DispatchMode,
}

/// Whether we're handing the next hop a non-trampoline MPP recipient's real
/// `payment_secret` plus routing hints, or forwarding the inner trampoline
/// onion with a fresh, unlinkable outer secret.
#[derive(Clone, Debug)]
pub enum DispatchMode {
    AssistedMpp {
        payment_secret: PaymentSecret,
        assisted_edges: Vec<crate::htlc::RoutingHint>,
    },
    TrampolineOnion {
        next_packet: Vec<u8>,
        random_payment_secret: PaymentSecret,
    },
}

/// C5: the outgoing-payment sender, multipart-send with listener callbacks
/// for failure/fulfillment.
///
/// Registration/removal of listeners must be safe under concurrent events;
/// the sender delivers its callbacks as cross-actor messages (enqueued on the
/// FSM's own input queue), never as a synchronous re-entrant call.
#[async_trait]
pub trait OutgoingPaymentSender: Send + Sync + 'static {
    /// C5 bookkeeping: create a sender FSM bound to this tag.
    fn create_sender_fsm(&self, full_tag: FullPaymentTag);

    /// C5 bookkeeping: tear down the sender FSM for this tag.
    fn remove_sender_fsm(&self, full_tag: FullPaymentTag);

    async fn send_multi_part(&self, request: SendMultiPartRequest) -> anyhow::Result<()>;

    /// Total fee actually spent on the outgoing send for `full_tag`, once it
    /// has fulfilled. Used to compute the relay's realized margin.
    fn used_fee(&self, full_tag: FullPaymentTag) -> MsatAmount;
}

/// Trait-alias helper mirroring [`trait_alias`]-style bundling used
/// throughout this crate: a cheap, cloneable handle bundling every external
/// service an FSM needs.
pub trait Services: Clone + Send + Sync + 'static {
    type Clock: ChainClock;
    type Store: PreimageInvoiceStore;
    type Bus: ChannelCommandBus;
    type Sender: OutgoingPaymentSender;

    fn clock(&self) -> &Self::Clock;
    fn store(&self) -> &Self::Store;
    fn bus(&self) -> &Self::Bus;
    fn sender(&self) -> &Self::Sender;
}
