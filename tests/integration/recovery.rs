use crate::*;
use sluice_core::{CacheConfig, CachedHint, FlushHint, Retryable, SluiceConfig, SubmissionResult};
use sluice_transport::{
    AlwaysConnected, DiskEnvelopeCache, EnvelopeCache, Transport, TransportError,
};

// ══════════════════════════════════════════════════════════════════════════════
//  Disk Cache & Restart Recovery
// ══════════════════════════════════════════════════════════════════════════════

fn disk_config(tag: &str) -> SluiceConfig {
    SluiceConfig {
        cache: CacheConfig {
            dir: temp_dir(tag),
            max_items: 30,
        },
        ..SluiceConfig::default()
    }
}

fn disk_transport(config: &SluiceConfig, connection: Arc<ScriptedConnection>) -> AsyncTransport {
    init_tracing();
    AsyncTransport::from_config(
        config,
        Arc::new(Unlimited),
        Arc::new(AlwaysConnected),
        connection,
    )
    .expect("transport should start")
}

/// Envelopes that failed to send survive on disk, and a later process
/// re-submits them as cached: delivered without the transport touching
/// the disk copy, which the recovery pass removes once delivery succeeded.
#[test]
fn test_failed_envelopes_are_recovered_after_restart() {
    let config = disk_config("restart");

    // First run: the network is down.
    {
        let transport = disk_transport(&config, ScriptedConnection::new(Reply::IoError));
        for i in 0..3 {
            let hint = Arc::new(FlushHint::new());
            transport.send(envelope(&format!("lost-{i}")), Some(hint.clone()));
            assert_eq!(hint.wait_result(WAIT), Some(false));
            assert_eq!(hint.retry(), Some(true));
        }
        transport.close().unwrap();
    }

    let cache = DiskEnvelopeCache::from_config(&config.cache).unwrap();
    let persisted = cache.load_all();
    assert_eq!(persisted.len(), 3);

    // Second run: recovery pass.
    let connection = ScriptedConnection::ok();
    let transport = disk_transport(&config, connection.clone());
    let resent: Vec<(Envelope, Arc<CachedHint>)> = persisted
        .into_iter()
        .map(|env| {
            let hint = Arc::new(CachedHint::new());
            transport.send(env.clone(), Some(hint.clone()));
            (env, hint)
        })
        .collect();

    assert!(transport.flush(WAIT));
    assert_eq!(connection.calls(), 3);
    assert_eq!(cache.count(), 3, "cached envelopes are never re-stored or discarded by the transport");

    for (env, hint) in &resent {
        assert!(hint.is_success());
        assert!(!hint.is_retry());
        cache.discard(env);
    }
    assert_eq!(cache.count(), 0);

    let _ = std::fs::remove_dir_all(&config.cache.dir);
}

/// Rejected envelopes land on disk even though they never reached the
/// worker.
#[test]
fn test_rejected_envelope_is_written_to_disk() {
    let mut config = disk_config("reject");
    config.transport.max_queue_size = 1;

    let latch = Latch::new();
    let _release = OpenOnDrop(latch.clone());
    let transport = disk_transport(&config, ScriptedConnection::new(Reply::Hold(latch.clone())));

    let running = Arc::new(FlushHint::new());
    transport.send(envelope("running"), Some(running.clone()));
    assert!(running.wait_flushed(WAIT));

    let overflow = envelope("overflow");
    transport.send(overflow.clone(), None);

    let cache = DiskEnvelopeCache::from_config(&config.cache).unwrap();
    assert!(cache.contains(&overflow));
    assert_eq!(cache.count(), 2);

    latch.open();
    assert!(transport.flush(WAIT));
    assert_eq!(cache.load_all(), vec![overflow]);

    let _ = std::fs::remove_dir_all(&config.cache.dir);
}

/// An envelope rejected while an identical one is in flight keeps its own
/// disk copy after the in-flight one is delivered and discarded.
#[test]
fn test_rejected_twin_survives_delivery_of_in_flight_twin() {
    let mut config = disk_config("twin");
    config.transport.max_queue_size = 1;

    let latch = Latch::new();
    let _release = OpenOnDrop(latch.clone());
    let transport = disk_transport(&config, ScriptedConnection::new(Reply::Hold(latch.clone())));

    let first = envelope("twin");
    let second = envelope("twin");
    assert_eq!(first.digest(), second.digest());

    let first_hint = Arc::new(FlushHint::new());
    transport.send(first, Some(first_hint.clone()));
    assert!(first_hint.wait_flushed(WAIT));

    let second_hint = Arc::new(FlushHint::new());
    transport.send(second.clone(), Some(second_hint.clone()));
    assert_eq!(second_hint.result(), Some(false));
    assert_eq!(second_hint.retry(), Some(true));

    latch.open();
    assert_eq!(first_hint.wait_result(WAIT), Some(true));
    assert!(transport.flush(WAIT));

    let cache = DiskEnvelopeCache::from_config(&config.cache).unwrap();
    assert_eq!(cache.count(), 1);
    assert_eq!(cache.load_all(), vec![second]);

    let _ = std::fs::remove_dir_all(&config.cache.dir);
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = disk_config("invalid");
    config.cache.max_items = 0;

    let result = AsyncTransport::from_config(
        &config,
        Arc::new(Unlimited),
        Arc::new(AlwaysConnected),
        ScriptedConnection::ok(),
    );
    assert!(matches!(result, Err(TransportError::Config(_))));
}
