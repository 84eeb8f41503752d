//! The finalize client: propagates a committed charge to the external
//! billing authority, classifying every response and routing failures to an
//! instance-owned DLQ.

pub mod client;
pub mod token;

pub use client::{
    FinalizeClient, FinalizeHttpRequest, FinalizeResult, FinalizeTransport, FinalizeTransportError,
    TokenSubject, DEFAULT_FINALIZE_TIMEOUT,
};
pub use token::{HmacServiceTokenSigner, ServiceTokenClaims, ServiceTokenSigner, TokenError};
