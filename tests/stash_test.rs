use stash::test_utils::RecordingStorageFactory;
use stash::{
    BytesCodec, Codec, SecretSpec, Stash, StashError, StringCodec, Result as StashResult,
};
use zeroize::Zeroize;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn string_spec() -> SecretSpec<String> {
    SecretSpec::builder(StringCodec).build()
}

#[test]
fn test_put_acquire_set_release_clear() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    let secret = stash.put(&string_spec(), "foo".to_string()).unwrap();

    let mut lock = secret.acquire().unwrap();
    assert_eq!(lock.get().as_deref().map(String::as_str), Some("foo"));
    lock.set("bar".to_string()).unwrap();
    lock.release().unwrap();

    let mut lock = secret.acquire().unwrap();
    assert_eq!(lock.get().as_deref().map(String::as_str), Some("bar"));
    lock.release().unwrap();

    stash.clear().unwrap();

    match secret.acquire() {
        Err(StashError::Disposed) => {}
        other => panic!("Expected Disposed error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_lock_acquire_after_clear() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    let secret = stash.put(&string_spec(), "foo".to_string()).unwrap();

    stash.clear().unwrap();

    assert!(matches!(secret.acquire(), Err(StashError::Disposed)));
}

#[test]
fn test_lock_use_after_clear() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    let secret = stash.put(&string_spec(), "foo".to_string()).unwrap();

    let mut lock = secret.acquire().unwrap();
    stash.clear().unwrap();

    assert!(matches!(lock.set("bar".to_string()), Err(StashError::Disposed)));
    assert!(!lock.set_if_acquired(|| "bar".to_string()));
    assert!(lock.get().is_none());

    // Releasing after disposal is a no-op
    lock.release().unwrap();
}

#[test]
fn test_dispose_through_lock_removes_from_stash() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    let secret = stash.put(&string_spec(), "foo".to_string()).unwrap();
    let _other = stash.put(&string_spec(), "other".to_string()).unwrap();

    let lock = secret.acquire().unwrap();
    lock.dispose().unwrap();

    assert!(secret.is_disposed());
    assert_eq!(stash.len(), 1);
    assert!(matches!(secret.acquire(), Err(StashError::Disposed)));
}

#[test]
fn test_release_writes_single_generation() {
    init_logging();
    let factory = RecordingStorageFactory::new();
    let stash = Stash::builder()
        .with_storage_factory(factory.clone())
        .build()
        .unwrap();

    let secret = stash.put(&string_spec(), "v".to_string()).unwrap();
    assert_eq!(factory.writes(), 1);
    assert_eq!(factory.last_written(), b"v");

    for round in 0..3 {
        let mut lock = secret.acquire().unwrap();
        lock.set(format!("v{}", round)).unwrap();
        lock.release().unwrap();
    }

    assert_eq!(factory.reads(), 3);
    assert_eq!(factory.writes(), 4);
    assert_eq!(factory.last_written(), b"v2");
}

#[test]
fn test_nested_locks_share_value() {
    init_logging();
    let factory = RecordingStorageFactory::new();
    let stash = Stash::builder()
        .with_storage_factory(factory.clone())
        .build()
        .unwrap();
    let secret = stash.put(&string_spec(), "shared".to_string()).unwrap();

    let mut outer = secret.acquire().unwrap();
    let mut inner = secret.acquire().unwrap();
    assert_eq!(secret.holds(), 2);

    inner.set("changed".to_string()).unwrap();
    assert_eq!(outer.get().as_deref().map(String::as_str), Some("changed"));

    inner.release().unwrap();
    assert_eq!(factory.writes(), 1);

    outer.release().unwrap();
    assert_eq!(factory.writes(), 2);
    assert_eq!(factory.last_written(), b"changed");
}

#[test]
fn test_dropped_lock_with_failed_store_keeps_value() {
    init_logging();
    let factory = RecordingStorageFactory::new();
    let stash = Stash::builder()
        .with_storage_factory(factory.clone())
        .build()
        .unwrap();
    let secret = stash.put(&string_spec(), "foo".to_string()).unwrap();

    {
        let mut lock = secret.acquire().unwrap();
        lock.set("bar".to_string()).unwrap();
        factory.fail_writes(true);
    }
    factory.fail_writes(false);

    assert_eq!(secret.holds(), 0);
    assert_eq!(factory.writes(), 1);

    let mut lock = secret.acquire().unwrap();
    assert_eq!(lock.get().as_deref().map(String::as_str), Some("bar"));
    lock.set("baz".to_string()).unwrap();
    lock.release().unwrap();

    assert_eq!(secret.holds(), 0);
    assert_eq!(factory.writes(), 2);
    assert_eq!(factory.last_written(), b"baz");

    let lock = secret.acquire().unwrap();
    assert_eq!(lock.get().as_deref().map(String::as_str), Some("baz"));
}

#[test]
fn test_scoped_lock_releases_on_drop() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    let secret = stash.put(&string_spec(), "foo".to_string()).unwrap();

    {
        let mut lock = secret.acquire().unwrap();
        lock.set("scoped".to_string()).unwrap();
        assert_eq!(secret.holds(), 1);
    }

    assert_eq!(secret.holds(), 0);
    let lock = secret.acquire().unwrap();
    assert_eq!(lock.get().as_deref().map(String::as_str), Some("scoped"));
}

#[test]
fn test_bytes_secret() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    let spec = SecretSpec::builder(BytesCodec).build();
    let key = vec![0x42u8; 32];

    let secret = stash.put(&spec, key.clone()).unwrap();
    let lock = secret.acquire().unwrap();
    let len = lock.with_value(|value| value.map(Vec::len));
    assert_eq!(len, Some(32));
    assert_eq!(lock.get().as_deref(), Some(&key));
}

#[derive(Clone, Debug, PartialEq)]
struct Credentials {
    user: String,
    password: String,
}

impl Zeroize for Credentials {
    fn zeroize(&mut self) {
        self.user.zeroize();
        self.password.zeroize();
    }
}

struct CredentialsCodec;

impl Codec<Credentials> for CredentialsCodec {
    fn serialize(&self, value: &Credentials) -> StashResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(value.user.len() + value.password.len() + 1);
        bytes.extend_from_slice(value.user.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(value.password.as_bytes());
        Ok(bytes)
    }

    fn deserialize(&self, bytes: &[u8]) -> StashResult<Credentials> {
        let split = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| StashError::Codec("missing separator".into()))?;
        let user = StringCodec.deserialize(&bytes[..split])?;
        let password = StringCodec.deserialize(&bytes[split + 1..])?;
        Ok(Credentials { user, password })
    }
}

#[test]
fn test_custom_codec() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    let spec = SecretSpec::builder(CredentialsCodec).build();

    let secret = stash
        .put(
            &spec,
            Credentials {
                user: "admin".to_string(),
                password: "hunter2".to_string(),
            },
        )
        .unwrap();

    let mut lock = secret.acquire().unwrap();
    assert_eq!(
        lock.get().as_deref(),
        Some(&Credentials {
            user: "admin".to_string(),
            password: "hunter2".to_string(),
        })
    );

    let updated = lock.set_if_acquired(|| Credentials {
        user: "admin".to_string(),
        password: "correct horse".to_string(),
    });
    assert!(updated);
    lock.release().unwrap();

    let lock = secret.acquire().unwrap();
    let password = lock.with_value(|value| value.map(|c| c.password.clone()));
    assert_eq!(password.as_deref(), Some("correct horse"));
}

#[test]
fn test_put_after_clear() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    for i in 0..3 {
        stash.put(&string_spec(), format!("value-{}", i)).unwrap();
    }

    stash.clear().unwrap();
    assert!(stash.is_empty());

    let secret = stash.put(&string_spec(), "fresh".to_string()).unwrap();
    assert_eq!(stash.len(), 1);
    let lock = secret.acquire().unwrap();
    assert_eq!(lock.get().as_deref().map(String::as_str), Some("fresh"));
}

#[test]
fn test_clear_is_idempotent() {
    init_logging();
    let stash = Stash::builder().build().unwrap();
    stash.clear().unwrap();
    stash.put(&string_spec(), "foo".to_string()).unwrap();
    stash.clear().unwrap();
    stash.clear().unwrap();
    assert!(stash.is_empty());
}
