use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use super::GatewayError;

/// Per-user prepaid quota ledger, in abstract units derived from
/// tokens x model-ratio x group-ratio.
///
/// Users without an entry are unlimited. Pre-consume reserves an upper
/// bound before dispatch; the reservation is reconciled after the response
/// and refunded in full when the request fails. The refund is a hard
/// invariant, enforced by the relay's stream finalizer.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    balances: Mutex<HashMap<i64, i64>>,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct QuotaView {
    pub user_id: i64,
    pub remaining: i64,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, i64>> {
        match self.balances.lock() {
            Ok(balances) => balances,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_balance(&self, user_id: i64, amount: i64) {
        self.lock().insert(user_id, amount);
    }

    pub fn balance(&self, user_id: i64) -> Option<i64> {
        self.lock().get(&user_id).copied()
    }

    /// Reserves `amount` up front. Returns the reserved amount (zero for
    /// unlimited users) or `QuotaExhausted`.
    pub fn pre_consume(&self, user_id: i64, amount: i64) -> Result<i64, GatewayError> {
        if amount <= 0 {
            return Ok(0);
        }
        let mut balances = self.lock();
        let Some(balance) = balances.get_mut(&user_id) else {
            return Ok(0);
        };
        if *balance < amount {
            return Err(GatewayError::QuotaExhausted { user_id });
        }
        *balance -= amount;
        Ok(amount)
    }

    /// Settles a reservation against actual usage. Charging more than the
    /// reservation draws down the balance further; charging less returns
    /// the difference.
    pub fn post_consume(&self, user_id: i64, pre_consumed: i64, actual: i64) {
        let delta = pre_consumed - actual;
        if delta == 0 {
            return;
        }
        let mut balances = self.lock();
        if let Some(balance) = balances.get_mut(&user_id) {
            *balance = balance.saturating_add(delta);
        }
    }

    /// Returns the full reservation after a failed request.
    pub fn refund(&self, user_id: i64, pre_consumed: i64) {
        if pre_consumed <= 0 {
            return;
        }
        let mut balances = self.lock();
        if let Some(balance) = balances.get_mut(&user_id) {
            *balance = balance.saturating_add(pre_consumed);
        }
    }

    pub fn views(&self) -> Vec<QuotaView> {
        let balances = self.lock();
        let mut out: Vec<QuotaView> = balances
            .iter()
            .map(|(user_id, remaining)| QuotaView {
                user_id: *user_id,
                remaining: *remaining,
            })
            .collect();
        out.sort_by_key(|view| view.user_id);
        out
    }
}
