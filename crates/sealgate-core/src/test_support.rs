//! Shared fixtures for unit tests.

use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::sync::OnceLock;

const TEST_KEY_BITS: usize = 1024;

static TEST_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
static OTHER_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

fn generate() -> RsaPrivateKey {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, TEST_KEY_BITS).expect("failed to generate key")
}

pub(crate) fn test_key() -> &'static RsaPrivateKey {
    TEST_KEY.get_or_init(generate)
}

pub(crate) fn test_key_pem() -> String {
    test_key()
        .to_pkcs8_pem(LineEnding::LF)
        .expect("pem encode")
        .to_string()
}

pub(crate) fn other_key_pem() -> String {
    OTHER_KEY
        .get_or_init(generate)
        .to_pkcs8_pem(LineEnding::LF)
        .expect("pem encode")
        .to_string()
}
