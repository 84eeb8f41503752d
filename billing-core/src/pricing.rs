//! The pricing/quote boundary: resolves an estimated cost for a request
//! before the admission gate is consulted. Out of scope beyond this
//! interface — a real pricing engine (volume discounts, per-tenant
//! contracts, spot-priced tokens) lives behind this trait.

use async_trait::async_trait;

use crate::amount::MicroDollars;
use crate::ids::TenantId;

/// What a `Quote` needs to know about the request it's pricing.
#[derive(Clone, Debug)]
pub struct QuoteRequest {
    pub tenant: TenantId,
    pub model_id: String,
    pub max_tokens: u64,
}

/// Resolves an estimated cost for a request, in microdollars, before any
/// budget is reserved.
#[async_trait]
pub trait Quote: Send + Sync {
    async fn estimate(&self, request: &QuoteRequest) -> MicroDollars;
}

/// A trivial flat per-token rate, sufficient to drive the admission gate and
/// this crate's test suite. Every tenant and model is priced identically;
/// a real deployment would look up a per-model or per-tenant rate table
/// behind the same trait.
pub struct FlatRateQuote {
    micros_per_token: u64,
}

impl FlatRateQuote {
    pub fn new(micros_per_token: u64) -> Self {
        Self { micros_per_token }
    }
}

#[async_trait]
impl Quote for FlatRateQuote {
    async fn estimate(&self, request: &QuoteRequest) -> MicroDollars {
        MicroDollars::from_micros(u128::from(request.max_tokens) * u128::from(self.micros_per_token))
    }
}
