//! In-memory collaborator mocks used by the FSM test modules. Records every
//! command/lookup in a `Mutex`-guarded `Vec`/`HashMap` so tests can assert on
//! exactly what was emitted, the same style the collaborator traits
//! themselves are written in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::traits::{
    ChainClock, ChannelCommandBus, OutgoingPaymentSender, PreimageInvoiceStore, SendMultiPartRequest,
    Services,
};
use crate::types::{
    BlockHeight, ChannelId, FailureMessage, FullPaymentTag, HtlcId, MsatAmount, PaymentHash,
    PaymentInfo, Preimage,
};

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Fulfill {
        channel_id: ChannelId,
        htlc_id: HtlcId,
        preimage: Preimage,
    },
    Fail {
        channel_id: ChannelId,
        htlc_id: HtlcId,
        failure: FailureMessage,
    },
}

pub struct MockClock(AtomicU32);

impl MockClock {
    pub fn new(height: u32) -> Self {
        Self(AtomicU32::new(height))
    }

    pub fn set(&self, height: u32) {
        self.0.store(height, Ordering::SeqCst);
    }
}

impl ChainClock for MockClock {
    fn current_block_height(&self) -> BlockHeight {
        BlockHeight(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct MockStore {
    pub infos: Mutex<HashMap<PaymentHash, PaymentInfo>>,
    pub preimages: Mutex<HashMap<PaymentHash, Preimage>>,
    pub relayed: Mutex<Vec<(PaymentHash, Preimage, MsatAmount, MsatAmount)>>,
}

#[async_trait]
impl PreimageInvoiceStore for MockStore {
    async fn get_payment_info(&self, hash: PaymentHash) -> anyhow::Result<Option<PaymentInfo>> {
        Ok(self.infos.lock().unwrap().get(&hash).cloned())
    }

    async fn get_preimage(&self, hash: PaymentHash) -> anyhow::Result<Option<Preimage>> {
        Ok(self.preimages.lock().unwrap().get(&hash).copied())
    }

    async fn update_incoming_succeeded(&self, hash: PaymentHash, amount: MsatAmount) -> anyhow::Result<()> {
        if let Some(info) = self.infos.lock().unwrap().get_mut(&hash) {
            info.requested_amount = info.requested_amount.or(Some(amount));
            info.status = crate::types::InvoiceStatus::Succeeded;
        }
        Ok(())
    }

    async fn store_preimage(&self, hash: PaymentHash, preimage: Preimage) -> anyhow::Result<()> {
        self.preimages.lock().unwrap().insert(hash, preimage);
        Ok(())
    }

    async fn add_relayed_preimage_info(
        &self,
        hash: PaymentHash,
        preimage: Preimage,
        amount_forwarded: MsatAmount,
        final_fee: MsatAmount,
    ) -> anyhow::Result<()> {
        self.relayed
            .lock()
            .unwrap()
            .push((hash, preimage, amount_forwarded, final_fee));
        Ok(())
    }

    fn invalidate(&self, _hash: PaymentHash) {}
}

#[derive(Default)]
pub struct MockBus {
    pub commands: Mutex<Vec<Command>>,
}

impl ChannelCommandBus for MockBus {
    fn fulfill(&self, channel_id: ChannelId, htlc_id: HtlcId, preimage: Preimage) {
        self.commands.lock().unwrap().push(Command::Fulfill {
            channel_id,
            htlc_id,
            preimage,
        });
    }

    fn fail(&self, channel_id: ChannelId, htlc_id: HtlcId, failure: FailureMessage) {
        self.commands.lock().unwrap().push(Command::Fail {
            channel_id,
            htlc_id,
            failure,
        });
    }
}

#[derive(Default)]
pub struct MockSender {
    pub created: Mutex<Vec<FullPaymentTag>>,
    pub removed: Mutex<Vec<FullPaymentTag>>,
    pub sent: Mutex<Vec<SendMultiPartRequest>>,
    /// `false` makes the next `send_multi_part` call return an error.
    pub dispatch_succeeds: Mutex<bool>,
    pub used_fee: Mutex<MsatAmount>,
}

impl MockSender {
    pub fn new() -> Self {
        Self {
            dispatch_succeeds: Mutex::new(true),
            ..Default::default()
        }
    }
}

#[async_trait]
impl OutgoingPaymentSender for MockSender {
    fn create_sender_fsm(&self, full_tag: FullPaymentTag) {
        self.created.lock().unwrap().push(full_tag);
    }

    fn remove_sender_fsm(&self, full_tag: FullPaymentTag) {
        self.removed.lock().unwrap().push(full_tag);
    }

    async fn send_multi_part(&self, request: SendMultiPartRequest) -> anyhow::Result<()> {
        let succeeds = *self.dispatch_succeeds.lock().unwrap();
        self.sent.lock().unwrap().push(request);
        if succeeds {
            Ok(())
        } else {
            Err(anyhow::anyhow!("mock dispatch failure"))
        }
    }

    fn used_fee(&self, _full_tag: FullPaymentTag) -> MsatAmount {
        *self.used_fee.lock().unwrap()
    }
}

#[derive(Clone)]
pub struct TestServices {
    pub clock: Arc<MockClock>,
    pub store: Arc<MockStore>,
    pub bus: Arc<MockBus>,
    pub sender: Arc<MockSender>,
}

impl TestServices {
    pub fn new(height: u32) -> Self {
        Self {
            clock: Arc::new(MockClock::new(height)),
            store: Arc::new(MockStore::default()),
            bus: Arc::new(MockBus::default()),
            sender: Arc::new(MockSender::new()),
        }
    }
}

impl Services for TestServices {
    type Clock = MockClock;
    type Store = MockStore;
    type Bus = MockBus;
    type Sender = MockSender;

    fn clock(&self) -> &Self::Clock {
        &self.clock
    }

    fn store(&self) -> &Self::Store {
        &self.store
    }

    fn bus(&self) -> &Self::Bus {
        &self.bus
    }

    fn sender(&self) -> &Self::Sender {
        &self.sender
    }
}
