//! The billing substrate's process entrypoint.
//!
//! Wires a [`Config`], initializes logging, replays the write-ahead log to
//! completion, then starts the reserve-TTL scheduler, the DLQ retry loop,
//! and the reconciliation poll loop as supervised tasks sharing one shutdown
//! signal. Mirrors the "replay before accepting traffic" ordering: nothing
//! below is spawned until [`wal::replay`] has returned.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use argh::FromArgs;
use tracing::info;

use billing_core::amount::MicroDollars;
use billing_core::config::Config;
use billing_core::dlq::{DlqProcessor, FinalizeCallback, InMemoryDlqStream};
use billing_core::finalize::{
    FinalizeClient, FinalizeHttpRequest, FinalizeTransport, FinalizeTransportError,
    HmacServiceTokenSigner, TokenSubject, DEFAULT_FINALIZE_TIMEOUT,
};
use billing_core::ids::TenantId;
use billing_core::reconciliation::{AuthorityClient, AuthorityError, ReconciliationClient};
use billing_core::state_machine::manager::BillingManager;
use billing_core::wal::{self, WalWriter};
use common::shutdown::ShutdownChannel;

/// Runs the billing substrate: replays the WAL, then serves the DLQ retry
/// loop and reconciliation poll loop until interrupted.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the TOML configuration file
    #[argh(option, default = "PathBuf::from(\"billing.toml\")")]
    config: PathBuf,

    /// the single tenant this process instance reconciles against the
    /// billing authority; a deployment running many tenants runs one
    /// process (or one reconciliation client) per tenant
    #[argh(option, default = "String::from(\"default\")")]
    tenant: String,
}

/// Stand-in for the external authority's finalize endpoint: every real
/// deployment substitutes this with a client implementing its actual wire
/// format, which this crate deliberately keeps out of scope (see the
/// finalize module's non-goal). Until substituted, every finalize attempt is
/// routed to the DLQ and retried on the usual backoff schedule, which is the
/// correct conservative behavior for an unconfigured transport.
struct UnconfiguredFinalizeTransport;

#[async_trait]
impl FinalizeTransport for UnconfiguredFinalizeTransport {
    async fn send(&self, _request: &FinalizeHttpRequest) -> Result<u16, FinalizeTransportError> {
        Err(FinalizeTransportError::Network(
            "no finalize transport configured".to_owned(),
        ))
    }
}

/// Stand-in for the external authority's reconciliation endpoint, same
/// rationale as [`UnconfiguredFinalizeTransport`]. An unreachable authority
/// drives the reconciliation client into FAIL_OPEN and then FAIL_CLOSED on
/// its own schedule, exactly as it would for a real authority outage.
struct UnconfiguredAuthority;

#[async_trait]
impl AuthorityClient for UnconfiguredAuthority {
    async fn fetch_committed_spend(
        &self,
        _tenant: &TenantId,
    ) -> Result<(MicroDollars, MicroDollars), AuthorityError> {
        Err(AuthorityError::Unreachable(
            "no authority transport configured".to_owned(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let args: Args = argh::from_env();
    let config_toml = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read config file {}", args.config.display()))?;
    let config = Config::from_toml_str(&config_toml)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    let wal = Arc::new(
        WalWriter::open(&config.wal_dir, config.wal_segment_max_bytes, 0)
            .context("failed to open WAL for writing")?,
    );

    let mut manager = BillingManager::new(wal.clone());
    let outcome =
        wal::replay(&config.wal_dir, &mut manager).context("failed to replay WAL at startup")?;
    wal.fast_forward_sequence(outcome.last_sequence.saturating_add(1));
    info!(
        processed = outcome.entries_processed,
        skipped = outcome.entries_skipped,
        corrupted = outcome.entries_corrupted,
        last_sequence = outcome.last_sequence,
        "WAL replay complete, accepting traffic"
    );
    let manager = Arc::new(manager);

    let dlq_stream = Arc::new(InMemoryDlqStream::new());
    let dlq = Arc::new(DlqProcessor::new(dlq_stream, Arc::new(config.clone())));

    let signer = Arc::new(HmacServiceTokenSigner::new(config.service_token_secret.clone()));
    let finalize_client = Arc::new(FinalizeClient::new(
        Arc::new(UnconfiguredFinalizeTransport),
        signer,
        dlq.clone(),
        TokenSubject::Tenant,
        DEFAULT_FINALIZE_TIMEOUT,
    ));

    let reconciliation = Arc::new(ReconciliationClient::new(
        TenantId::new(args.tenant.clone()),
        Arc::new(UnconfiguredAuthority),
        None,
        MicroDollars::from_micros(config.drift_threshold_micro),
        config.fail_open_headroom_percent,
        MicroDollars::from_micros(config.fail_open_absolute_cap_micro),
        config.fail_open_max_duration(),
        config.reconciliation_poll_interval(),
    ));

    let shutdown = ShutdownChannel::new();

    let reserve_ttl_task = manager.clone().start_reserve_ttl_scheduler(config.reserve_ttl(), shutdown.clone());
    let dlq_task = dlq
        .clone()
        .start(finalize_client.clone() as Arc<dyn FinalizeCallback>, None, None, shutdown.clone());
    let (reconciliation_task, _reconciliation_trigger) = reconciliation.clone().start();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    shutdown.send();
    reconciliation.stop();

    reserve_ttl_task.await.context("reserve TTL scheduler task panicked")?;
    dlq_task.await.context("dlq processing task panicked")?;
    reconciliation_task.await.context("reconciliation task panicked")?;

    Ok(())
}
