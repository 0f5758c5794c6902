use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use m2m::config::ReconnectConfig;
use m2m::crypto::cipher::{
    decrypt_payload, encrypt_payload, open_credentials, open_security_code, seal_credentials,
};
use m2m::crypto::TransientKeys;
use m2m::e2e_common::{test_credentials, FakeRelay};
use m2m::session::backoff::CLOSE_ABNORMAL;
use m2m::session::{ReconnectPolicy, TokenStore};
use m2m::{Config, Credentials, Error, HandshakeError, KeySource, RelayKeySource, SessionDescriptor};

fn keys() -> TransientKeys {
    TransientKeys::derive(&[5u8; 66], &"1f".repeat(12), &"2e".repeat(12)).unwrap()
}

#[test]
fn credentials_are_validated_on_construction() {
    assert!(Credentials::new("a@b.com", "Abcdef1!", Some("1234")).is_ok());
    assert!(Credentials::new("a@b.com", "Abcdef1!", None).is_ok());

    for (userid, password, code) in [
        ("bad-email", "Abcdef1!", None),
        ("a@b.com", "short1!", None),
        ("a@b.com", "Abcdef1!", Some("123")),
    ] {
        let err = Credentials::new(userid, password, code).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{userid} {password} {code:?}");
    }
}

#[test]
fn sealed_credentials_open_only_with_matching_keys() {
    let credentials = test_credentials().unwrap();
    let sealed = seal_credentials(&keys(), &credentials).unwrap();
    let (userid, password) = open_credentials(&keys(), &sealed).unwrap();
    assert_eq!(userid, "a@b.com");
    assert_eq!(password.as_str(), "Abcdef1!");
    let esc = sealed.esc.clone().unwrap();
    assert_eq!(open_security_code(&keys(), &esc).unwrap(), "1234");

    let other = TransientKeys::derive(&[6u8; 66], &"1f".repeat(12), &"2e".repeat(12)).unwrap();
    assert!(open_credentials(&other, &sealed).is_err());

    let mut tampered = sealed.clone();
    let flipped = if tampered.euc.starts_with('0') { "1" } else { "0" };
    tampered.euc.replace_range(0..1, flipped);
    assert!(open_credentials(&keys(), &tampered).is_err());
}

#[test]
fn encrypted_payload_rejects_tampering() {
    let payload = encrypt_payload(&keys(), b"event log body").unwrap();
    assert_eq!(payload.idn, keys().salt2());
    assert_eq!(decrypt_payload(&keys(), &payload).unwrap().as_slice(), b"event log body");

    let mut tag = payload.clone();
    let flipped = if tag.tg.ends_with('0') { "1" } else { "0" };
    let last = tag.tg.len() - 1;
    tag.tg.replace_range(last.., flipped);
    assert!(decrypt_payload(&keys(), &tag).is_err());

    let mut length = payload;
    length.cl += 2;
    assert!(decrypt_payload(&keys(), &length).is_err());
}

#[test]
fn reconnect_delays_follow_seeded_jitter_and_reset_on_open() {
    let config = ReconnectConfig::default();
    let mut policy = ReconnectPolicy::with_rng(config, StdRng::seed_from_u64(42));
    let mut replay = ReconnectPolicy::with_rng(config, StdRng::seed_from_u64(42));

    let plans: Vec<_> = (0..4).map(|_| policy.next_plan(CLOSE_ABNORMAL)).collect();
    for (i, plan) in plans.iter().enumerate() {
        assert_eq!(plan.attempt, i as u32 + 1);
        let extension = if plan.attempt >= 3 { 5_000 } else { 0 };
        assert!(plan.delay >= Duration::from_millis(1_000 + extension));
        assert!(plan.delay < Duration::from_millis(21_000 + extension));
        assert_eq!(plan, &replay.next_plan(CLOSE_ABNORMAL));
    }
    assert!(plans[2].background);
    assert!(!plans[3].background);

    policy.reset();
    let fresh = policy.next_plan(1000);
    assert_eq!(fresh.attempt, 1);
    assert!(!fresh.warn);
    assert!(fresh.delay < Duration::from_millis(21_000));
}

#[tokio::test]
async fn key_exchange_succeeds_only_against_the_pinned_relay() {
    let relay = FakeRelay::start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let config = relay.config(dir.path());

    let keys = RelayKeySource::from_config(&config).exchange().await.unwrap();
    assert_eq!(keys.salt1().len(), 24);
    assert!(!keys.salt2().is_empty());

    let mut wrong_key = config.clone();
    let other = ed25519_dalek::SigningKey::from_bytes(&[1u8; 32]);
    wrong_key.server_key = Some(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        other.verifying_key().as_bytes(),
    ));
    let err = RelayKeySource::from_config(&wrong_key).exchange().await.unwrap_err();
    assert!(matches!(err, HandshakeError::Authentication(_)));

    let mut wrong_string = config;
    wrong_string.verification_string = "https://elsewhere.example".into();
    let err = RelayKeySource::from_config(&wrong_string).exchange().await.unwrap_err();
    assert!(matches!(err, HandshakeError::Authentication(_)));
}

#[tokio::test]
async fn token_store_persists_registered_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("m2m_log/tk"));
    assert!(store.load().await.unwrap().is_none());

    let mut descriptor = SessionDescriptor::device(100);
    descriptor.aid = Some("aid-1".into());
    descriptor.ak = Some("ak-1".into());
    descriptor.uid = Some("user-1".into());
    store.save(&descriptor).await.unwrap();

    let loaded = store.load().await.unwrap().unwrap();
    assert_eq!(loaded, descriptor);
    assert!(loaded.has_token());
    assert!(loaded.matches_identity(&SessionDescriptor::device(100)));
    assert!(!loaded.matches_identity(&SessionDescriptor::device(200)));
    assert!(!loaded.matches_identity(&SessionDescriptor::client("c1")));

    store.clear().await.unwrap();
    assert!(store.load().await.unwrap().is_none());
}

#[test]
fn config_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m2m.json");
    std::fs::write(
        &path,
        r#"{"server":"https://relay.example:8443","watchIntervalMs":2000,"reconnect":{"baseMs":10}}"#,
    )
    .unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.endpoint("/m2m").unwrap(), "wss://relay.example:8443/m2m");
    assert_eq!(config.watch_interval(), Duration::from_secs(2));
    assert_eq!(config.reconnect.base_ms, 10);
    assert_eq!(config.reconnect.spread_ms, 20_000);

    std::fs::write(&path, r#"{"server":"ftp://relay.example"}"#).unwrap();
    assert!(matches!(Config::load(Some(&path)), Err(Error::Config(_))));
}
