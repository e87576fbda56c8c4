//! C7: the Local Receiver. Decides whether a multi-part payment terminating
//! at this node should be fulfilled or failed.

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::constants::LOCAL_CLTV_SAFETY_BLOCKS;
use crate::htlc::{IncomingHtlc, InFlightPayments};
use crate::scheduler::DelayedCommandScheduler;
use crate::traits::Services;
use crate::types::{FailureMessage, FullPaymentTag, InvoiceStatus, MsatAmount, Preimage};

/// Data attached once the FSM has stopped accepting new parts.
#[derive(Clone, Debug)]
enum FinalizeData {
    /// We haven't yet decided fulfill vs. fail; re-evaluate on next snapshot.
    Null,
    Revealed(Preimage),
    Aborted(Option<FailureMessage>),
}

#[derive(Clone, Debug)]
enum LocalState {
    Receiving,
    Finalizing(FinalizeData),
}

pub struct LocalReceiverFsm<S: Services> {
    tag: FullPaymentTag,
    services: S,
    state: LocalState,
    scheduler: DelayedCommandScheduler<()>,
    timeout_rx: mpsc::UnboundedReceiver<()>,
}

impl<S: Services> LocalReceiverFsm<S> {
    pub fn new(tag: FullPaymentTag, services: S) -> Self {
        debug_assert!(matches!(
            tag.kind,
            crate::types::PaymentKind::FinalIncoming
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut scheduler = DelayedCommandScheduler::new(tx);
        scheduler.replace_work(());
        Self {
            tag,
            services,
            state: LocalState::Receiving,
            scheduler,
            timeout_rx: rx,
        }
    }

    /// Resets the receive-grace timeout; called on each fine-grained arrival
    /// notification while still collecting parts.
    pub fn handle_arrival(&mut self) {
        if matches!(self.state, LocalState::Receiving) {
            self.scheduler.replace_work(());
        }
    }

    /// Drains and applies at most one pending `CMDTimeout`, if the scheduler
    /// has fired since the last poll.
    pub fn poll_timeout(&mut self) {
        if self.timeout_rx.try_recv().is_ok() && matches!(self.state, LocalState::Receiving) {
            info!(tag = ?self.tag, "Local receive grace period expired");
            self.state = LocalState::Finalizing(FinalizeData::Null);
        }
    }

    /// Applies one `InFlightPayments` snapshot. Returns `true` if the FSM
    /// should now be torn down (no HTLCs remain for this tag).
    pub async fn handle_snapshot(&mut self, snapshot: &InFlightPayments) -> bool {
        self.poll_timeout();

        let adds = snapshot.incoming_for(&self.tag);
        if adds.is_empty() {
            return true;
        }

        match self.state.clone() {
            LocalState::Receiving => {
                if let Err(err) = self.resolve(adds).await {
                    warn!(tag = ?self.tag, %err, "Error resolving local payment");
                }
            }
            LocalState::Finalizing(FinalizeData::Null) => {
                if let Err(err) = self.finalize(adds).await {
                    warn!(tag = ?self.tag, %err, "Error finalizing local payment");
                }
            }
            LocalState::Finalizing(FinalizeData::Revealed(preimage)) => {
                for htlc in adds {
                    self.services.bus().fulfill(htlc.channel_id, htlc.htlc_id, preimage);
                }
            }
            LocalState::Finalizing(FinalizeData::Aborted(reason)) => {
                self.emit_fails(adds, reason);
            }
        }

        false
    }

    async fn resolve(&mut self, adds: &[IncomingHtlc]) -> anyhow::Result<()> {
        let hash = self.tag.payment_hash;
        let preimage_try = self.services.store().get_preimage(hash).await?;
        let info = self.services.store().get_payment_info(hash).await?;
        let current_height = self.services.clock().current_block_height();
        let sum_in: MsatAmount = adds.iter().map(|h| h.amount).sum();

        let Some(info) = info else {
            return match preimage_try {
                Some(preimage) => self.become_revealed(preimage, adds).await,
                None => {
                    self.become_aborted(None, adds);
                    Ok(())
                }
            };
        };

        if info.is_incoming && info.status == InvoiceStatus::Succeeded {
            let preimage = info
                .preimage
                .or(preimage_try)
                .context("Invoice marked succeeded but no preimage on file")?;
            return self.become_revealed(preimage, adds).await;
        }

        let unsafe_expiry = adds
            .iter()
            .any(|h| h.cltv_expiry.checked_sub(LOCAL_CLTV_SAFETY_BLOCKS).unwrap_or_default() < current_height);
        if unsafe_expiry {
            self.become_aborted(None, adds);
            return Ok(());
        }

        if info.is_incoming {
            if let Some(requested) = info.requested_amount {
                if sum_in >= requested {
                    let preimage = preimage_try.context("Invoice covered but no preimage on file")?;
                    return self.become_revealed(preimage, adds).await;
                }
            }
        }

        // Not enough parts yet; wait for more or for CMDTimeout.
        Ok(())
    }

    async fn finalize(&mut self, adds: &[IncomingHtlc]) -> anyhow::Result<()> {
        let hash = self.tag.payment_hash;
        let info = self.services.store().get_payment_info(hash).await?;
        let preimage_try = self.services.store().get_preimage(hash).await?;
        let sum_in: MsatAmount = adds.iter().map(|h| h.amount).sum();

        if let Some(info) = &info {
            if info.is_incoming && info.status == InvoiceStatus::Succeeded {
                let preimage =
                    info.preimage.or(preimage_try).context("Missing preimage for succeeded invoice")?;
                return self.become_revealed(preimage, adds).await;
            }
            if let Some(requested) = info.requested_amount {
                if sum_in >= requested {
                    let preimage = preimage_try.context("Missing preimage for covered invoice")?;
                    return self.become_revealed(preimage, adds).await;
                }
            } else if let Some(total) = adds.first().and_then(IncomingHtlc::local_total_amount) {
                if sum_in >= total {
                    let preimage = preimage_try.context("Missing preimage for covered invoice")?;
                    return self.become_revealed(preimage, adds).await;
                }
            }
        }

        if let Some(preimage) = preimage_try {
            return self.become_revealed(preimage, adds).await;
        }

        self.become_aborted(Some(FailureMessage::PaymentTimeout), adds);
        Ok(())
    }

    async fn become_revealed(
        &mut self,
        preimage: Preimage,
        adds: &[IncomingHtlc],
    ) -> anyhow::Result<()> {
        let hash = self.tag.payment_hash;
        let sum: MsatAmount = adds.iter().map(|h| h.amount).sum();

        // Persist before transitioning so a crash between persistence and
        // command emission is recoverable: the next snapshot will still see
        // us in `Finalizing(Revealed)` and simply re-emit the fulfills.
        self.services.store().update_incoming_succeeded(hash, sum).await?;
        self.services.store().store_preimage(hash, preimage).await?;
        self.services.store().invalidate(hash);

        self.state = LocalState::Finalizing(FinalizeData::Revealed(preimage));
        for htlc in adds {
            self.services.bus().fulfill(htlc.channel_id, htlc.htlc_id, preimage);
        }
        Ok(())
    }

    fn become_aborted(&mut self, reason: Option<FailureMessage>, adds: &[IncomingHtlc]) {
        self.state = LocalState::Finalizing(FinalizeData::Aborted(reason));
        self.emit_fails(adds, reason);
    }

    fn emit_fails(&self, adds: &[IncomingHtlc], reason: Option<FailureMessage>) {
        for htlc in adds {
            match reason {
                Some(failure) => self.services.bus().fail(htlc.channel_id, htlc.htlc_id, failure),
                None => self
                    .services
                    .bus()
                    .fail_incorrect_details(htlc.channel_id, htlc.htlc_id, htlc.amount),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::htlc::HtlcPayload;
    use crate::test_support::{Command, TestServices};
    use crate::types::{
        BlockHeight, ChannelId, HtlcId, InvoiceStatus, PaymentHash, PaymentKind, PaymentSecret,
    };

    fn tag(hash: u8) -> FullPaymentTag {
        FullPaymentTag {
            payment_hash: PaymentHash([hash; 32]),
            payment_secret: PaymentSecret([0; 32]),
            kind: PaymentKind::FinalIncoming,
        }
    }

    fn htlc(amount: u64, cltv_expiry: u32) -> IncomingHtlc {
        IncomingHtlc {
            channel_id: ChannelId([1; 32]),
            htlc_id: HtlcId(1),
            amount: MsatAmount(amount),
            cltv_expiry: BlockHeight(cltv_expiry),
            payload: HtlcPayload::Local {
                total_amount: MsatAmount(1000),
            },
        }
    }

    fn snapshot(tag: FullPaymentTag, htlcs: Vec<IncomingHtlc>) -> InFlightPayments {
        let mut incoming = std::collections::HashMap::new();
        incoming.insert(tag, htlcs);
        InFlightPayments {
            incoming,
            outgoing: std::collections::HashMap::new(),
        }
    }

    // Scenario A: single HTLC, known covered invoice, preimage already on
    // file -> immediate reveal.
    #[tokio::test]
    async fn amount_matched_invoice_reveals_immediately() {
        let full_tag = tag(1);
        let services = TestServices::new(100);
        let preimage = Preimage([7; 32]);
        services.store.infos.lock().unwrap().insert(
            full_tag.payment_hash,
            PaymentInfo {
                is_incoming: true,
                requested_amount: Some(MsatAmount(1000)),
                preimage: None,
                status: InvoiceStatus::Pending,
            },
        );
        services
            .store
            .preimages
            .lock()
            .unwrap()
            .insert(full_tag.payment_hash, preimage);

        let mut fsm = LocalReceiverFsm::new(full_tag, services.clone());
        let snap = snapshot(full_tag, vec![htlc(1000, 300)]);
        let shutdown = fsm.handle_snapshot(&snap).await;

        assert!(!shutdown);
        assert_eq!(
            services.bus.commands.lock().unwrap().as_slice(),
            &[Command::Fulfill {
                channel_id: ChannelId([1; 32]),
                htlc_id: HtlcId(1),
                preimage,
            }]
        );
        assert_eq!(
            services.store.preimages.lock().unwrap().get(&full_tag.payment_hash),
            Some(&preimage)
        );
    }

    // Scenario B: incomplete MPP set, no further arrivals, CMDTimeout fires.
    #[tokio::test(start_paused = true)]
    async fn incomplete_mpp_set_times_out() {
        let full_tag = tag(2);
        let services = TestServices::new(100);
        services.store.infos.lock().unwrap().insert(
            full_tag.payment_hash,
            PaymentInfo {
                is_incoming: true,
                requested_amount: Some(MsatAmount(1000)),
                preimage: None,
                status: InvoiceStatus::Pending,
            },
        );

        let mut fsm = LocalReceiverFsm::new(full_tag, services.clone());
        let snap = snapshot(full_tag, vec![htlc(700, 300)]);

        let shutdown = fsm.handle_snapshot(&snap).await;
        assert!(!shutdown);
        assert!(services.bus.commands.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;

        let shutdown = fsm.handle_snapshot(&snap).await;
        assert!(!shutdown);
        assert_eq!(
            services.bus.commands.lock().unwrap().as_slice(),
            &[Command::Fail {
                channel_id: ChannelId([1; 32]),
                htlc_id: HtlcId(1),
                failure: FailureMessage::PaymentTimeout,
            }]
        );
    }

    // Scenario C: HTLC's cltv_expiry is too close to the safety threshold.
    #[tokio::test]
    async fn cltv_too_close_aborts_with_incorrect_details() {
        let full_tag = tag(3);
        let services = TestServices::new(100);
        services.store.infos.lock().unwrap().insert(
            full_tag.payment_hash,
            PaymentInfo {
                is_incoming: true,
                requested_amount: Some(MsatAmount(1000)),
                preimage: None,
                status: InvoiceStatus::Pending,
            },
        );

        let mut fsm = LocalReceiverFsm::new(full_tag, services.clone());
        let snap = snapshot(full_tag, vec![htlc(1000, 103)]);
        let shutdown = fsm.handle_snapshot(&snap).await;

        assert!(!shutdown);
        assert_eq!(
            services.bus.commands.lock().unwrap().as_slice(),
            &[Command::Fail {
                channel_id: ChannelId([1; 32]),
                htlc_id: HtlcId(1),
                failure: FailureMessage::incorrect_details(MsatAmount(1000)),
            }]
        );
    }

    #[tokio::test]
    async fn empty_snapshot_shuts_down() {
        let full_tag = tag(4);
        let services = TestServices::new(100);
        let mut fsm = LocalReceiverFsm::new(full_tag, services.clone());
        let snap = snapshot(tag(99), vec![]);
        assert!(fsm.handle_snapshot(&snap).await);
    }
}
