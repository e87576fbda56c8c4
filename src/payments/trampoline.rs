//! C8: the Trampoline Relayer. Validates a routed incoming set, dispatches a
//! correlated outgoing multipart send, and maps its terminal outcome back to
//! exactly one upstream failure message (or a fulfill).

use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::constants::{
    required_relay_fee, DEFAULT_TRAMPOLINE_FEE_PARAMS, MINIMUM_HTLC, TRAMPOLINE_CLTV_DELTA,
};
use crate::htlc::{IncomingHtlc, InFlightPayments, OutgoingFailure, OutgoingFailureKind};
use crate::scheduler::DelayedCommandScheduler;
use crate::traits::{DispatchMode, SendMultiPartRequest, Services};
use crate::types::{BlockHeight, FailureMessage, FullPaymentTag, MsatAmount, PaymentSecret, Preimage};

#[derive(Clone, Debug)]
enum TrampolineState {
    Receiving,
    SendingProcessing { final_node: [u8; 33] },
    /// `retry`: whether a future `Receiving` retry is warranted (restart
    /// recovery) or this is a pathological dead end (abort once settled).
    SendingStopping { retry: bool },
    SendingRevealed { preimage: Preimage },
    FinalizingRevealed { preimage: Preimage },
    FinalizingAborted { failure: FailureMessage },
}

/// Amounts captured at send-time, so that `becomeRevealed` can compute
/// `final_fee` even in the pathological case where the incoming set is empty
/// by the time the preimage arrives (see the outer spec's restart-recovery
/// scenario).
#[derive(Clone, Copy, Debug, Default)]
struct CachedSend {
    outer_total_amount: MsatAmount,
    amount_to_forward: MsatAmount,
}

pub struct TrampolineRelayerFsm<S: Services> {
    tag: FullPaymentTag,
    services: S,
    state: TrampolineState,
    cached_send: Option<CachedSend>,
    scheduler: DelayedCommandScheduler<()>,
    timeout_rx: mpsc::UnboundedReceiver<()>,
}

impl<S: Services> TrampolineRelayerFsm<S> {
    pub fn new(tag: FullPaymentTag, services: S) -> Self {
        debug_assert!(matches!(
            tag.kind,
            crate::types::PaymentKind::TrampolineRouted
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut scheduler = DelayedCommandScheduler::new(tx);
        scheduler.replace_work(());
        services.sender().create_sender_fsm(tag);
        Self {
            tag,
            services,
            state: TrampolineState::Receiving,
            cached_send: None,
            scheduler,
            timeout_rx: rx,
        }
    }

    pub fn handle_arrival(&mut self) {
        if matches!(self.state, TrampolineState::Receiving) {
            self.scheduler.replace_work(());
        }
    }

    fn poll_timeout(&mut self) {
        if self.timeout_rx.try_recv().is_ok() && matches!(self.state, TrampolineState::Receiving) {
            info!(tag = ?self.tag, "Trampoline receive grace period expired");
            self.state = TrampolineState::FinalizingAborted {
                failure: FailureMessage::PaymentTimeout,
            };
        }
    }

    /// Notification that some outgoing part was fulfilled by the downstream
    /// peer. Valid from any pre-terminal state.
    pub fn handle_outgoing_fulfill(&mut self, preimage: Preimage) {
        if matches!(
            self.state,
            TrampolineState::FinalizingRevealed { .. } | TrampolineState::FinalizingAborted { .. }
        ) {
            return;
        }
        self.state = TrampolineState::SendingRevealed { preimage };
    }

    /// Terminal outcome of the outgoing send when every attempt has failed.
    pub fn handle_outgoing_failed(&mut self, failures: Vec<OutgoingFailure>) {
        match self.state.clone() {
            TrampolineState::SendingStopping { retry: true } => {
                self.state = TrampolineState::Receiving;
                self.scheduler.replace_work(());
            }
            TrampolineState::SendingStopping { retry: false } => {
                let failure = aborted_with_error(&failures, None);
                self.state = TrampolineState::FinalizingAborted { failure };
            }
            TrampolineState::SendingProcessing { final_node } => {
                let failure = aborted_with_error(&failures, Some(final_node));
                self.state = TrampolineState::FinalizingAborted { failure };
            }
            other => {
                warn!(tag = ?self.tag, ?other, "Outgoing-failed event in unexpected state");
            }
        }
    }

    /// Applies one `InFlightPayments` snapshot. Returns `true` if the FSM
    /// should now be torn down.
    pub async fn handle_snapshot(&mut self, snapshot: &InFlightPayments) -> bool {
        self.poll_timeout();

        let ins = snapshot.incoming_for(&self.tag);
        let outs = snapshot.outgoing_for(&self.tag);
        let empty = ins.is_empty() && outs.is_empty();

        match self.state.clone() {
            TrampolineState::Receiving => self.resolve_trampoline(ins, outs).await,
            TrampolineState::SendingRevealed { preimage } => {
                if let Err(err) = self.become_revealed(preimage, ins).await {
                    warn!(tag = ?self.tag, %err, "Error finalizing revealed trampoline relay");
                }
                false
            }
            TrampolineState::SendingProcessing { .. } | TrampolineState::SendingStopping { .. } => {
                if empty {
                    self.shutdown();
                    true
                } else {
                    false
                }
            }
            TrampolineState::FinalizingRevealed { preimage } => {
                if empty {
                    self.shutdown();
                    true
                } else {
                    for htlc in ins {
                        self.services.bus().fulfill(htlc.channel_id, htlc.htlc_id, preimage);
                    }
                    false
                }
            }
            TrampolineState::FinalizingAborted { failure } => {
                if empty {
                    self.shutdown();
                    true
                } else {
                    for htlc in ins {
                        self.services.bus().fail(htlc.channel_id, htlc.htlc_id, failure);
                    }
                    false
                }
            }
        }
    }

    async fn resolve_trampoline(&mut self, ins: &[IncomingHtlc], outs: &[crate::htlc::OutgoingAttempt]) -> bool {
        if ins.is_empty() && outs.is_empty() {
            self.shutdown();
            return true;
        }

        let preimage_try = match self.services.store().get_preimage(self.tag.payment_hash).await {
            Ok(p) => p,
            Err(err) => {
                warn!(tag = ?self.tag, %err, "Error looking up preimage");
                None
            }
        };
        if let Some(preimage) = preimage_try {
            if let Err(err) = self.become_revealed(preimage, ins).await {
                warn!(tag = ?self.tag, %err, "Error finalizing trampoline relay");
            }
            return false;
        }

        let covered = relay_covered(ins);
        match (covered, outs.is_empty()) {
            (true, true) => {
                self.become_sending_or_aborted(ins).await;
            }
            (true, false) => {
                self.state = TrampolineState::SendingStopping { retry: true };
            }
            (false, false) => {
                self.state = TrampolineState::SendingStopping { retry: false };
            }
            (false, true) => {
                // Wait for more parts.
            }
        }
        false
    }

    async fn become_sending_or_aborted(&mut self, ins: &[IncomingHtlc]) {
        debug_assert!(!ins.is_empty());
        let current_height = self.services.clock().current_block_height();

        match validate_relay(ins, current_height) {
            Err(failure) => {
                self.state = TrampolineState::FinalizingAborted { failure };
                for htlc in ins {
                    self.services.bus().fail(htlc.channel_id, htlc.htlc_id, failure);
                }
            }
            Ok(()) => {
                let head = &ins[0];
                let inner = head.trampoline_inner().expect("validated trampoline payload");
                let sum_in: MsatAmount = ins.iter().map(|h| h.amount).sum();
                let fee = required_relay_fee(sum_in, &DEFAULT_TRAMPOLINE_FEE_PARAMS);
                let total_fee_reserve = sum_in
                    .checked_sub(inner.amount_to_forward)
                    .and_then(|rem| rem.checked_sub(fee))
                    .unwrap_or(MsatAmount::ZERO);
                let min_cltv = ins.iter().map(|h| h.cltv_expiry).min().expect("non-empty");
                let max_cltv = min_cltv
                    .0
                    .saturating_sub(inner.outgoing_cltv.0)
                    .saturating_sub(TRAMPOLINE_CLTV_DELTA);

                let next_packet = match &head.payload {
                    crate::htlc::HtlcPayload::Trampoline { next_packet, .. } => next_packet.clone(),
                    crate::htlc::HtlcPayload::Local { .. } => unreachable!("validated trampoline payload"),
                };

                let dispatch = if inner.invoice_features_set {
                    DispatchMode::AssistedMpp {
                        payment_secret: inner.payment_secret.expect("validated by rule 1"),
                        assisted_edges: inner.invoice_routing_info.clone(),
                    }
                } else {
                    DispatchMode::TrampolineOnion {
                        next_packet,
                        random_payment_secret: random_payment_secret(),
                    }
                };

                let request = SendMultiPartRequest {
                    full_tag: self.tag,
                    max_cltv,
                    destination_node_id: inner.outgoing_node_id,
                    amount_to_forward: inner.amount_to_forward,
                    fee_reserve: total_fee_reserve,
                    outgoing_cltv: inner.outgoing_cltv,
                    dispatch,
                };
                let outer_total_amount = head.outer_total_amount().expect("validated trampoline payload");
                let amount_to_forward = inner.amount_to_forward;
                let final_node = inner.outgoing_node_id;

                match self.services.sender().send_multi_part(request).await {
                    Ok(()) => {
                        self.cached_send = Some(CachedSend {
                            outer_total_amount,
                            amount_to_forward,
                        });
                        self.state = TrampolineState::SendingProcessing { final_node };
                    }
                    Err(err) => {
                        warn!(tag = ?self.tag, %err, "Failed to dispatch outgoing multipart send");
                        let failure = FailureMessage::TemporaryNodeFailure;
                        self.state = TrampolineState::FinalizingAborted { failure };
                        for htlc in ins {
                            self.services.bus().fail(htlc.channel_id, htlc.htlc_id, failure);
                        }
                    }
                }
            }
        }
    }

    async fn become_revealed(&mut self, preimage: Preimage, ins: &[IncomingHtlc]) -> anyhow::Result<()> {
        let hash = self.tag.payment_hash;
        let head = ins.first();
        let outer_total_amount = self
            .cached_send
            .map(|c| c.outer_total_amount)
            .or_else(|| head.and_then(IncomingHtlc::outer_total_amount))
            .unwrap_or(MsatAmount::ZERO);
        let amount_to_forward = self
            .cached_send
            .map(|c| c.amount_to_forward)
            .or_else(|| head.and_then(|h| h.trampoline_inner().map(|i| i.amount_to_forward)))
            .unwrap_or(MsatAmount::ZERO);
        let used_fee = self.services.sender().used_fee(self.tag);
        let final_fee = outer_total_amount
            .saturating_sub(amount_to_forward)
            .saturating_sub(used_fee);

        self.services.store().store_preimage(hash, preimage).await?;
        self.services
            .store()
            .add_relayed_preimage_info(hash, preimage, amount_to_forward, final_fee)
            .await?;
        self.services.store().invalidate(hash);

        self.state = TrampolineState::FinalizingRevealed { preimage };
        for htlc in ins {
            self.services.bus().fulfill(htlc.channel_id, htlc.htlc_id, preimage);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.services.sender().remove_sender_fsm(self.tag);
    }
}

/// `sum(ins) >= first.outer.total_amount`.
fn relay_covered(ins: &[IncomingHtlc]) -> bool {
    let Some(head) = ins.first() else {
        return false;
    };
    let Some(total) = head.outer_total_amount() else {
        return false;
    };
    let sum_in: MsatAmount = ins.iter().map(|h| h.amount).sum();
    sum_in >= total
}

/// Rejects a covered incoming set with exactly one failure message: the first
/// rule (in order) whose predicate holds.
fn validate_relay(ins: &[IncomingHtlc], current_height: BlockHeight) -> Result<(), FailureMessage> {
    let head = ins.first().expect("non-empty");
    let head_inner = head.trampoline_inner().expect("trampoline payload");
    let head_total = head.outer_total_amount().expect("trampoline payload");

    if head_inner.invoice_features_set && head_inner.payment_secret.is_none() {
        return Err(FailureMessage::TemporaryNodeFailure);
    }

    let sum_in: MsatAmount = ins.iter().map(|h| h.amount).sum();
    let fee = required_relay_fee(sum_in, &DEFAULT_TRAMPOLINE_FEE_PARAMS);
    let available = sum_in.checked_sub(head_inner.amount_to_forward);
    let fee_ok = available.is_some_and(|avail| fee <= avail);
    if !fee_ok {
        return Err(FailureMessage::TrampolineFeeInsufficient);
    }

    let amounts_disagree = ins
        .iter()
        .filter_map(IncomingHtlc::trampoline_inner)
        .any(|inner| inner.amount_to_forward != head_inner.amount_to_forward);
    if amounts_disagree {
        return Err(FailureMessage::incorrect_details(head.amount));
    }

    let totals_disagree = ins
        .iter()
        .filter_map(IncomingHtlc::outer_total_amount)
        .any(|total| total != head_total);
    if totals_disagree {
        return Err(FailureMessage::incorrect_details(head.amount));
    }

    let min_cltv = ins.iter().map(|h| h.cltv_expiry).min().expect("non-empty");
    let cltv_margin_ok = min_cltv
        .checked_sub(head_inner.outgoing_cltv.0 + TRAMPOLINE_CLTV_DELTA)
        .is_some();
    if !cltv_margin_ok {
        return Err(FailureMessage::TrampolineExpiryTooSoon);
    }

    if head_inner.outgoing_cltv <= current_height {
        return Err(FailureMessage::TrampolineExpiryTooSoon);
    }

    if head_inner.amount_to_forward < MINIMUM_HTLC {
        return Err(FailureMessage::TemporaryNodeFailure);
    }

    Ok(())
}

/// Selects exactly one upstream failure message from an outgoing send's
/// terminal failures. `final_node` is `None` when aborting from a `Stopping`
/// state, in which case rule 1 never matches by design: we never infer a
/// better final-node candidate than the one recorded at send time.
fn aborted_with_error(failures: &[OutgoingFailure], final_node: Option<[u8; 33]>) -> FailureMessage {
    if let Some(final_node) = final_node {
        if let Some(msg) = failures.iter().find_map(|f| match (&f.origin_node_id, &f.message) {
            (Some(origin), OutgoingFailureKind::Remote(msg)) if *origin == final_node => Some(*msg),
            _ => None,
        }) {
            return msg;
        }
    }

    if failures
        .iter()
        .any(|f| matches!(f.message, OutgoingFailureKind::NoRouteFound))
    {
        return FailureMessage::TrampolineFeeInsufficient;
    }

    if let Some(msg) = failures.iter().find_map(|f| match &f.message {
        OutgoingFailureKind::Remote(msg) => Some(*msg),
        OutgoingFailureKind::NoRouteFound => None,
    }) {
        return msg;
    }

    FailureMessage::TemporaryNodeFailure
}

fn random_payment_secret() -> PaymentSecret {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    PaymentSecret(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::htlc::{HtlcPayload, OutgoingAttempt, RoutingHint, TrampolineInner};
    use crate::test_support::{Command, TestServices};
    use crate::types::{ChannelId, HtlcId, PaymentHash, PaymentKind};

    fn tag(hash: u8) -> FullPaymentTag {
        FullPaymentTag {
            payment_hash: PaymentHash([hash; 32]),
            payment_secret: PaymentSecret([0; 32]),
            kind: PaymentKind::TrampolineRouted,
        }
    }

    fn trampoline_htlc(
        amount: u64,
        outer_total_amount: u64,
        amount_to_forward: u64,
        cltv_expiry: u32,
        outgoing_cltv: u32,
    ) -> IncomingHtlc {
        IncomingHtlc {
            channel_id: ChannelId([2; 32]),
            htlc_id: HtlcId(1),
            amount: MsatAmount(amount),
            cltv_expiry: BlockHeight(cltv_expiry),
            payload: HtlcPayload::Trampoline {
                outer_total_amount: MsatAmount(outer_total_amount),
                inner: TrampolineInner {
                    amount_to_forward: MsatAmount(amount_to_forward),
                    outgoing_cltv: BlockHeight(outgoing_cltv),
                    outgoing_node_id: [9; 33],
                    payment_secret: None,
                    invoice_features_set: false,
                    invoice_routing_info: Vec::<RoutingHint>::new(),
                },
                next_packet: vec![1, 2, 3],
            },
        }
    }

    fn snapshot(
        tag: FullPaymentTag,
        ins: Vec<IncomingHtlc>,
        outs: Vec<OutgoingAttempt>,
    ) -> InFlightPayments {
        let mut incoming = std::collections::HashMap::new();
        incoming.insert(tag, ins);
        let mut outgoing = std::collections::HashMap::new();
        outgoing.insert(tag, outs);
        InFlightPayments { incoming, outgoing }
    }

    // Scenario D: happy path, full transition through Sending(Processing) ->
    // Sending(Revealed) -> Finalizing(Revealed) -> shutdown.
    #[tokio::test]
    async fn happy_path_relays_and_reveals() {
        let full_tag = tag(1);
        let services = TestServices::new(100);
        *services.sender.used_fee.lock().unwrap() = MsatAmount(200);

        let mut fsm = TrampolineRelayerFsm::new(full_tag, services.clone());
        let htlc = trampoline_htlc(100_000, 100_000, 95_000, 350, 200);
        let snap = snapshot(full_tag, vec![htlc], vec![]);

        assert!(!fsm.handle_snapshot(&snap).await);
        assert_eq!(services.sender.sent.lock().unwrap().len(), 1);
        assert!(services.bus.commands.lock().unwrap().is_empty());

        let preimage = Preimage([5; 32]);
        fsm.handle_outgoing_fulfill(preimage);
        assert!(!fsm.handle_snapshot(&snap).await);

        assert_eq!(
            services.bus.commands.lock().unwrap().as_slice(),
            &[Command::Fulfill {
                channel_id: ChannelId([2; 32]),
                htlc_id: HtlcId(1),
                preimage,
            }]
        );
        let relayed = services.store.relayed.lock().unwrap();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].2, MsatAmount(95_000));
        assert_eq!(relayed[0].3, MsatAmount(100_000 - 95_000 - 200));
        drop(relayed);

        let empty_snap = snapshot(full_tag, vec![], vec![]);
        assert!(fsm.handle_snapshot(&empty_snap).await);
        assert_eq!(services.sender.removed.lock().unwrap(), vec![full_tag]);
    }

    // Scenario E: relay fee insufficient, no send dispatched.
    #[tokio::test]
    async fn insufficient_fee_aborts_without_dispatch() {
        let full_tag = tag(2);
        let services = TestServices::new(100);
        let mut fsm = TrampolineRelayerFsm::new(full_tag, services.clone());

        let htlc = trampoline_htlc(10_000, 10_000, 9_500, 350, 200);
        let snap = snapshot(full_tag, vec![htlc], vec![]);

        assert!(!fsm.handle_snapshot(&snap).await);

        assert!(services.sender.sent.lock().unwrap().is_empty());
        assert_eq!(
            services.bus.commands.lock().unwrap().as_slice(),
            &[Command::Fail {
                channel_id: ChannelId([2; 32]),
                htlc_id: HtlcId(1),
                failure: FailureMessage::TrampolineFeeInsufficient,
            }]
        );
    }

    // Scenario F: restart mid-relay, outgoing parts survived a restart while
    // incoming was already covered; once they fail, retry from scratch.
    #[tokio::test]
    async fn restart_mid_relay_retries_once_outgoing_settles() {
        let full_tag = tag(3);
        let services = TestServices::new(100);
        let mut fsm = TrampolineRelayerFsm::new(full_tag, services.clone());

        let htlc = trampoline_htlc(100_000, 100_000, 95_000, 350, 200);
        let stale_snap = snapshot(
            full_tag,
            vec![htlc.clone()],
            vec![OutgoingAttempt {
                amount: MsatAmount(50_000),
            }],
        );
        assert!(!fsm.handle_snapshot(&stale_snap).await);
        assert!(services.sender.sent.lock().unwrap().is_empty());

        fsm.handle_outgoing_failed(vec![]);

        let fresh_snap = snapshot(full_tag, vec![htlc], vec![]);
        assert!(!fsm.handle_snapshot(&fresh_snap).await);
        assert_eq!(services.sender.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn aborted_with_error_prefers_final_node() {
        let final_node = [1u8; 33];
        let other_node = [2u8; 33];
        let failures = vec![
            OutgoingFailure {
                origin_node_id: Some(other_node),
                message: OutgoingFailureKind::Remote(FailureMessage::TemporaryNodeFailure),
            },
            OutgoingFailure {
                origin_node_id: Some(final_node),
                message: OutgoingFailureKind::Remote(FailureMessage::TrampolineExpiryTooSoon),
            },
        ];
        assert_eq!(
            aborted_with_error(&failures, Some(final_node)),
            FailureMessage::TrampolineExpiryTooSoon
        );
    }

    #[test]
    fn aborted_with_error_prefers_no_route_over_remote() {
        let failures = vec![
            OutgoingFailure {
                origin_node_id: Some([3u8; 33]),
                message: OutgoingFailureKind::Remote(FailureMessage::TemporaryNodeFailure),
            },
            OutgoingFailure {
                origin_node_id: None,
                message: OutgoingFailureKind::NoRouteFound,
            },
        ];
        assert_eq!(
            aborted_with_error(&failures, None),
            FailureMessage::TrampolineFeeInsufficient
        );
    }

    #[test]
    fn aborted_with_error_defaults_to_temporary_node_failure() {
        assert_eq!(
            aborted_with_error(&[], None),
            FailureMessage::TemporaryNodeFailure
        );
    }

    #[test]
    fn validate_relay_rejects_disagreeing_amounts() {
        let mut a = trampoline_htlc(60_000, 100_000, 95_000, 350, 200);
        let mut b = trampoline_htlc(40_000, 100_000, 90_000, 350, 200);
        a.htlc_id = HtlcId(1);
        b.htlc_id = HtlcId(2);
        let err = validate_relay(&[a.clone(), b], BlockHeight(100)).unwrap_err();
        assert_eq!(err, FailureMessage::incorrect_details(a.amount));
    }
}
