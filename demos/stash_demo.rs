// Walks through the lifecycle of a secret: put, acquire, modify, release,
// and bulk disposal through the stash.
use stash::{SecretSpec, Stash, StashError, StringCodec};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let stash = Stash::builder().build()?;
    println!("Stash created with '{}' storage", stash.storage_name());

    let spec = SecretSpec::builder(StringCodec).build();
    let secret = stash.put(&spec, "initial-token".to_string())?;
    println!("Secret {} stored encrypted", secret.id());

    {
        let mut lock = secret.acquire()?;
        let length = lock.with_value(|token| token.map(String::len));
        println!("Token resident while locked, length: {:?}", length);

        lock.set("rotated-token".to_string())?;
        // Dropping the lock re-encrypts the rotated token
    }
    println!("Lock released, holds: {}", secret.holds());

    let lock = secret.acquire()?;
    assert_eq!(lock.get().as_deref().map(String::as_str), Some("rotated-token"));
    drop(lock);

    stash.clear()?;
    match secret.acquire() {
        Err(StashError::Disposed) => println!("Secret disposed by clear"),
        Err(e) => return Err(e.into()),
        Ok(_) => return Err("secret survived clear".into()),
    }

    Ok(())
}
