mod common;

use common::{base_config, config_with_router, dev_conversation, output, params};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokenshield::bus::EventKind;
use tokenshield::{GenerateParams, Shield};

#[tokio::test]
async fn duplicate_prompt_hits_cache() {
    let mut config = base_config();
    config.cache.similarity_threshold = 1.0;
    let shield = Shield::new(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&calls);
    let p = shield.prepare(params("Hello", "gpt-4o-mini")).await.unwrap();
    let first = shield
        .execute(p, move |_| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(output("Hi", 50, 20))
        })
        .await
        .unwrap();
    assert_eq!(first.text, "Hi");

    let c = Arc::clone(&calls);
    let p = shield.prepare(params("Hello", "gpt-4o-mini")).await.unwrap();
    assert!(p.cache_hit());
    let second = shield
        .execute(p, move |_| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(output("fresh", 50, 20))
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "second call must not reach the provider");
    assert_eq!(second.text, "Hi");
    assert!(second.cached);

    let entries = shield.ledger().unwrap().entries();
    assert_eq!(entries.len(), 2);
    assert!(entries[1].cache_hit);
    assert!(entries[1].savings.cache > 0.0);
}

#[tokio::test]
async fn fuzzy_match_above_threshold() {
    let shield = Shield::new(base_config()).unwrap(); // default threshold 0.85
    let p = shield
        .prepare(params("What is Promise.all?", "gpt-4o-mini"))
        .await
        .unwrap();
    shield
        .execute(p, |_| async { Ok(output("It aggregates promises.", 30, 15)) })
        .await
        .unwrap();

    let p = shield
        .prepare(params("what's promise.all", "gpt-4o-mini"))
        .await
        .unwrap();
    assert!(p.cache_hit(), "near-duplicate prompt should fuzzy-hit");
    let result = shield
        .execute(p, |_| async { panic!("must not generate on a fuzzy hit") })
        .await
        .unwrap();
    assert_eq!(result.text, "It aggregates promises.");
}

#[tokio::test]
async fn context_trim_and_routing_attribution() {
    // Budget of 800 input tokens with 200 reserved for output
    let mut config = config_with_router();
    config.context.max_context_tokens = 1000;
    config.context.reserved_for_output = 200;
    let shield = Shield::new(config).unwrap();

    let trimmed = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&trimmed);
    shield.events().on(EventKind::ContextTrimmed, move |_| {
        t.fetch_add(1, Ordering::SeqCst);
    });

    let request = GenerateParams {
        messages: dev_conversation(),
        ..params("quick follow-up: which flag enables it?", "gpt-4o")
    };
    let prepared = shield.prepare(request).await.unwrap();
    // Simple follow-up routes down from gpt-4o
    assert_eq!(prepared.params.model_id, "gpt-4o-mini");
    assert!(prepared.params.messages.len() < 20, "history must be trimmed");
    assert_eq!(trimmed.load(Ordering::SeqCst), 1);

    shield
        .execute(prepared, |_| async { Ok(output("use --flag", 450, 200)) })
        .await
        .unwrap();

    let entry = shield.ledger().unwrap().entries().pop().unwrap();
    assert!(entry.savings.context > 0.0, "trimming must be attributed");
    assert!(entry.savings.router > 0.0, "downgrade must be attributed");
    assert!(
        (entry.total_saved - (entry.savings.context + entry.savings.router)).abs() < 1e-9,
        "module savings must sum to the total"
    );
    assert_eq!(entry.original_model.as_deref(), Some("gpt-4o"));
}

#[tokio::test]
async fn events_fire_along_the_pipeline() {
    let mut config = config_with_router();
    config.cache.similarity_threshold = 1.0;
    let shield = Shield::new(config).unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    shield.events().on_any(move |event| {
        s.lock().unwrap().push(event.kind());
    });

    // First request: the probe model is the requested one ("gpt-4o"), the
    // router then downgrades, and the response is stored under the probe
    // model. The identical second request therefore hits.
    let p = shield.prepare(params("hello there", "gpt-4o")).await.unwrap();
    shield
        .execute(p, |_| async { Ok(output("hi", 10, 5)) })
        .await
        .unwrap();
    let p = shield.prepare(params("hello there", "gpt-4o")).await.unwrap();
    shield
        .execute(p, |_| async { panic!("cached") })
        .await
        .unwrap();

    let kinds = seen.lock().unwrap().clone();
    assert!(kinds.contains(&EventKind::CacheMiss));
    assert!(kinds.contains(&EventKind::RouterDowngraded));
    assert!(kinds.contains(&EventKind::LedgerEntry));
    assert!(kinds.contains(&EventKind::CacheHit));
}

#[tokio::test]
async fn per_instance_isolation() {
    // Two pipelines in one process share nothing: a store in one is
    // invisible to the other
    let a = Shield::new(base_config()).unwrap();
    let b = Shield::new(base_config()).unwrap();

    let p = a.prepare(params("isolated prompt", "gpt-4o")).await.unwrap();
    a.execute(p, |_| async { Ok(output("from a", 10, 5)) })
        .await
        .unwrap();

    let p = b.prepare(params("isolated prompt", "gpt-4o")).await.unwrap();
    assert!(!p.cache_hit(), "pipelines must not leak cache entries");
    assert_eq!(b.ledger().unwrap().entries().len(), 0);
}

#[tokio::test]
async fn min_length_guard_blocks_empty_prompt() {
    let shield = Shield::new(base_config()).unwrap();
    let err = shield.prepare(params("", "gpt-4o")).await.unwrap_err();
    assert_eq!(err.code(), "blocked/guard");
}

#[tokio::test]
async fn cache_stats_reflect_traffic() {
    let mut config = base_config();
    config.cache.similarity_threshold = 1.0;
    let shield = Shield::new(config).unwrap();

    let p = shield.prepare(params("stats prompt", "gpt-4o")).await.unwrap();
    shield
        .execute(p, |_| async { Ok(output("r", 40, 10)) })
        .await
        .unwrap();
    let p = shield.prepare(params("stats prompt", "gpt-4o")).await.unwrap();
    shield.execute(p, |_| async { panic!("cached") }).await.unwrap();

    let stats = shield.cache_stats().unwrap();
    assert_eq!(stats.entries, 1);
    assert!(stats.total_hits >= 1);
}
