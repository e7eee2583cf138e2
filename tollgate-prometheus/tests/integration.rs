use prometheus::{Encoder, Registry, TextEncoder};
use std::time::Duration;
use tollgate::telemetry::{AdmissionEvent, Outcome};
use tollgate::{ClientKey, Tier};
use tollgate_prometheus::PrometheusSink;
use tower_service::Service;

fn scrape(registry: &Registry) -> String {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf).expect("encode metrics");
    String::from_utf8(buf).expect("utf8 exposition")
}

fn client() -> ClientKey {
    ClientKey::new("203.0.113.5")
}

#[tokio::test]
async fn counts_each_outcome_per_tier() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let cases = [
        AdmissionEvent::Allowed { client: client(), tier: Tier::Baseline, remaining: 9.0 },
        AdmissionEvent::Allowed { client: client(), tier: Tier::Baseline, remaining: 8.0 },
        AdmissionEvent::Denied {
            client: client(),
            tier: Tier::Elevated,
            retry_after: Duration::from_secs(2),
        },
        AdmissionEvent::Degraded {
            client: client(),
            tier: Tier::Baseline,
            reason: "store unavailable: refused".into(),
        },
    ];
    for event in cases {
        sink.call(event).await.expect("Failed to call sink");
    }

    assert_eq!(sink.count(Tier::Baseline, Outcome::Allowed), 2);
    assert_eq!(sink.count(Tier::Elevated, Outcome::Denied), 1);
    assert_eq!(sink.count(Tier::Baseline, Outcome::Degraded), 1);
    assert_eq!(sink.count(Tier::Elevated, Outcome::Allowed), 0);

    let text = scrape(&registry);
    assert!(text.contains("tollgate_decisions_total"));
    assert!(text.contains(r#"outcome="degraded""#));
}

#[test]
fn duplicate_registration_fails() {
    let registry = Registry::new();
    let _first = PrometheusSink::new(registry.clone()).expect("first registration");
    assert!(PrometheusSink::new(registry).is_err());
}

#[tokio::test]
async fn works_as_limiter_sink() {
    use tollgate::{InMemoryBucketStore, Limiter, ManualClock, PolicySelector, RateLimitPolicy};

    let sink = PrometheusSink::new(Registry::new()).expect("sink");
    let limiter = Limiter::new(
        InMemoryBucketStore::new(),
        PolicySelector::new(RateLimitPolicy::BASELINE, RateLimitPolicy::ELEVATED),
    )
    .with_clock(ManualClock::new(0))
    .with_sink(sink.clone());

    let key = client();
    for _ in 0..11 {
        limiter.check(&key, false).await;
    }
    assert_eq!(sink.count(Tier::Baseline, Outcome::Allowed), 10);
    assert_eq!(sink.count(Tier::Baseline, Outcome::Denied), 1);
}
