//! Tunable policy constants. None of these affect correctness of the state
//! machines, only how aggressively they wait, retry, or charge for relaying.

use crate::types::MsatAmount;

/// Local receiver: an HTLC whose `cltv_expiry` is closer than this many
/// blocks to the current height is rejected outright, even if its invoice is
/// otherwise satisfied, since there isn't enough time left to safely claim it
/// on-chain if the channel force-closes.
pub const LOCAL_CLTV_SAFETY_BLOCKS: u32 = 9;

/// Trampoline relay: minimum gap we require between the shortest incoming
/// CLTV delta and the outgoing CLTV we forward at.
pub const TRAMPOLINE_CLTV_DELTA: u32 = 40;

/// Trampoline relay: we refuse to forward HTLCs below this amount, mirroring
/// the minimum HTLC value most channels enforce.
pub const MINIMUM_HTLC: MsatAmount = MsatAmount(1_000);

/// Trampoline relay fee policy: `base_fee + proportional^exponent /
/// log_exponent_factor`, monotonic non-decreasing in the incoming sum.
#[derive(Copy, Clone, Debug)]
pub struct TrampolineFeeParams {
    pub base_fee: MsatAmount,
    /// Numerator of the proportional component, applied per 1_000_000 msat.
    pub proportional_millionths: u64,
    pub exponent: u32,
    pub log_exponent_factor: f64,
}

/// Default relay fee parameters: a flat base fee plus a mildly convex
/// proportional surcharge, so that larger relays cost more per msat, not
/// less.
pub const DEFAULT_TRAMPOLINE_FEE_PARAMS: TrampolineFeeParams = TrampolineFeeParams {
    base_fee: MsatAmount(1_000),
    proportional_millionths: 100,
    exponent: 2,
    log_exponent_factor: 2.0,
};

/// Computes the trampoline relay fee for forwarding `sum_in` total incoming
/// msat, using `params`. Monotonic non-decreasing in `sum_in` for any
/// `exponent >= 1` and `log_exponent_factor > 0`.
pub fn required_relay_fee(sum_in: MsatAmount, params: &TrampolineFeeParams) -> MsatAmount {
    let proportional = (sum_in.0 as f64) * (params.proportional_millionths as f64) / 1_000_000.0;
    let surcharge = proportional.powi(params.exponent as i32) / params.log_exponent_factor;
    MsatAmount(params.base_fee.0 + surcharge.round() as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relay_fee_is_monotonic_in_sum_in() {
        let params = DEFAULT_TRAMPOLINE_FEE_PARAMS;
        let mut prev = MsatAmount::ZERO;
        for sum_in in [0u64, 1_000, 10_000, 100_000, 1_000_000, 10_000_000] {
            let fee = required_relay_fee(MsatAmount(sum_in), &params);
            assert!(fee >= prev, "fee regressed at sum_in={sum_in}");
            prev = fee;
        }
    }
}
