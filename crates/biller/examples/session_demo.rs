//! Example: run a purchase session against the simulated backend.
//!
//! Scripts a few failed connects, then buys the premium unlock and a handful of gem packs
//! through the flow launcher. Prints one-line JSON per connection status change and per
//! consumed gem pack, then the final acknowledged set.
//!
//! Usage:
//!
//!   cargo run -p biller --example session_demo
//!
//! Options:
//!   --failures <N>    Failed connect attempts before the connection comes up. Default: 2.
//!   --retry-ms <MS>   Delay between connect attempts. Default: 3000.
//!   --gems <N>        Gem packs to buy. Default: 3.
//!   --owned           Seed an already-owned, unacknowledged subscription (picked up by the sweep).

use biller::{
    BillerSession, Offer, OfferType, PurchaseRecord, ResponseCode, SessionConfig,
    SimulatedBackend, SimulatedHost,
};
use std::sync::Arc;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args: Vec<String> = std::env::args().collect();
    let mut failures: usize = 2;
    let mut retry_ms: u64 = 3000;
    let mut gems: usize = 3;
    let mut owned = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--failures" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    failures = s.parse().unwrap_or(2);
                }
            }
            "--retry-ms" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    retry_ms = s.parse().unwrap_or(3000);
                }
            }
            "--gems" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    gems = s.parse().unwrap_or(3);
                }
            }
            "--owned" => owned = true,
            "--help" | "-h" => {
                eprintln!(
                    "Usage: session_demo [--failures N] [--retry-ms MS] [--gems N] [--owned]\n\
                     Runs a purchase session against the simulated backend, printing one-line JSON\n\
                     per status change and consumed gem pack.\n\
                     --failures N   Failed connects before success. Default: 2.\n\
                     --retry-ms MS  Delay between connect attempts. Default: 3000.\n\
                     --gems N       Gem packs to buy. Default: 3.\n\
                     --owned        Seed an owned, unacknowledged subscription."
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    let backend = Arc::new(SimulatedBackend::new());
    backend.script_connect(std::iter::repeat(ResponseCode::ServiceUnavailable).take(failures));
    backend.set_price("premium", OfferType::OneTime, "$9.99", None);
    backend.set_price("pro_monthly", OfferType::Recurring, "$2.99", Some("P1M"));
    backend.set_price("gem_pack_10", OfferType::OneTime, "$0.99", None);
    backend.complete_launched_flows(true);
    if owned {
        backend.put_purchase(
            OfferType::Recurring,
            PurchaseRecord::purchased("pro_monthly", biller::simulated::new_token()),
        );
    }

    let mut config = SessionConfig::from_env()?;
    config.reconnection.retry_delay = Duration::from_millis(retry_ms);
    let session = BillerSession::new(
        Arc::clone(&backend),
        [
            Offer::acknowledgeable("premium", OfferType::OneTime),
            Offer::acknowledgeable("pro_monthly", OfferType::Recurring),
            Offer::consumable("gem_pack_10"),
        ],
        config,
    )?;
    backend.attach_listener(session.purchase_update_sink());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut status = session.connection_status();
        let mut consumed = session.subscribe_consumed();
        session.start()?;

        tokio::spawn(async move {
            while let Some(s) = status.next().await {
                println!("{}", serde_json::json!({ "event": "status", "value": s }));
            }
        });
        let printer = tokio::spawn(async move {
            let mut n = 0;
            while n < gems {
                let Some(ev) = consumed.recv().await else {
                    break;
                };
                println!("{}", serde_json::json!({ "event": "consumed", "value": ev }));
                n += 1;
            }
        });

        let mut ready = session.connection_status();
        ready.wait_ready().await;
        session.refresh_catalog().await;
        for offer in session.catalog().offers() {
            let pricing = offer.pricing();
            println!(
                "{}",
                serde_json::json!({ "event": "offer", "id": offer.id(), "kind": offer.kind(), "pricing": pricing })
            );
        }

        let host = SimulatedHost {
            account: "demo".into(),
        };
        if let Err(e) = session.try_launch_flow("premium", &host).await {
            tracing::warn!(reason = %e, "premium purchase not launched");
        }
        for _ in 0..gems {
            session.launch_flow("gem_pack_10", &host).await;
        }

        tokio::select! {
            _ = printer => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                tracing::warn!("timed out waiting for consumed events");
            }
        }
        let report = session.reconcile_all().await;
        tracing::debug!(?report, "final sweep");
        session.stop().await;

        let acknowledged: Vec<String> = session.acknowledged().into_iter().collect();
        println!("{}", serde_json::json!({ "event": "acknowledged", "value": acknowledged }));
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}
