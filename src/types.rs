//! Core identifiers and value types shared by both incoming-payment state
//! machines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A Lightning channel identifier, as assigned by the channel layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

/// A channel-local identifier for one HTLC.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct HtlcId(pub u64);

/// A 32-byte SHA256 payment hash.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PaymentHash(pub [u8; 32]);

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", hex_prefix(&self.0))
    }
}

/// A 32-byte payment preimage. Revealing this to a channel claims the HTLC,
/// so it is never logged in full.
#[derive(Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Preimage(pub [u8; 32]);

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Preimage(..)")
    }
}

/// An MPP payment_secret, shared by all HTLCs belonging to one payment.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PaymentSecret(pub [u8; 32]);

impl fmt::Debug for PaymentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentSecret(..)")
    }
}

fn hex_prefix(bytes: &[u8; 32]) -> String {
    bytes[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Distinguishes the two FSM variants sharing a payment hash namespace.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PaymentKind {
    /// This node is the final recipient.
    FinalIncoming,
    /// This node relays onward via trampoline.
    TrampolineRouted,
}

/// Uniquely identifies one logical incoming payment. Two payments that reuse
/// a hash (e.g. a probe followed by a real payment) are distinguished by
/// `kind`, never conflated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FullPaymentTag {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
    pub kind: PaymentKind,
}

/// A millisatoshi amount.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MsatAmount(pub u64);

impl MsatAmount {
    pub const ZERO: Self = Self(0);

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl std::iter::Sum for MsatAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|a| a.0).sum())
    }
}

impl std::ops::Add for MsatAmount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

/// An absolute block height.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlockHeight(pub u32);

impl BlockHeight {
    pub fn checked_sub(self, delta: u32) -> Option<Self> {
        self.0.checked_sub(delta).map(Self)
    }
}

impl std::ops::Add<u32> for BlockHeight {
    type Output = Self;
    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

/// Status of a known invoice, as tracked by the preimage/invoice store.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Pending,
    Succeeded,
    Failed,
    Aborted,
}

/// External, read-only view of a known invoice.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub is_incoming: bool,
    /// `None` means the invoice is amount-less.
    pub requested_amount: Option<MsatAmount>,
    pub preimage: Option<Preimage>,
    pub status: InvoiceStatus,
}

/// A single wire-compatible upstream failure, exactly one of which is
/// attached to every failed HTLC.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum FailureMessage {
    #[error("temporary node failure")]
    TemporaryNodeFailure,
    #[error("trampoline relay fee insufficient")]
    TrampolineFeeInsufficient,
    #[error("trampoline expiry too soon")]
    TrampolineExpiryTooSoon,
    /// Carries the amount we actually expected, per BOLT 4.
    #[error("incorrect or unknown payment details (expected {0:?})")]
    IncorrectOrUnknownPaymentDetails(MsatAmount),
    #[error("payment timeout")]
    PaymentTimeout,
}

impl FailureMessage {
    /// Shortcut for rejections that carry no otherwise-meaningful amount
    /// (e.g. a CLTV-too-close rejection).
    pub fn incorrect_details(amount: MsatAmount) -> Self {
        Self::IncorrectOrUnknownPaymentDetails(amount)
    }
}
