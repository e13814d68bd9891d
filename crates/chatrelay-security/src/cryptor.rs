use std::num::NonZeroU32;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chatrelay_common::{Error, MessageVersion, Result, StoredMessage, User};
use dashmap::DashMap;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::digest::{SHA256, digest};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;

const KEY_LEN: usize = 32; // 256 bits
const OBSCURE_PAD: &[u8] = b"chatrelay/obscure";

/// An encrypted message body together with the format it was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBody {
    pub body: String,
    pub version: MessageVersion,
}

/// Encrypts and decrypts message bodies with per-user keys.
///
/// Keys are derived from the shared secret and the user's salt, so the salt
/// alone never yields a key. Encryption always writes
/// [`MessageVersion::CURRENT`]; decryption understands every historical format
/// so old rows stay readable without a migration pass.
pub struct Cryptor {
    secret: String,
    iterations: NonZeroU32,
    keys: DashMap<String, [u8; KEY_LEN]>,
    rng: SystemRandom,
}

impl Cryptor {
    /// Fails for an empty secret: keys are never derived from the salt alone.
    pub fn new(secret: impl Into<String>, iterations: u32) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(Error::Config("encryption secret must not be empty".into()));
        }
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| Error::Config("key derivation iterations must be positive".into()))?;
        Ok(Self {
            secret,
            iterations,
            keys: DashMap::new(),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, user: &User, plaintext: &str) -> Result<SealedBody> {
        let body = self.seal(&user.salt, MessageVersion::CURRENT, plaintext)?;
        Ok(SealedBody {
            body,
            version: MessageVersion::CURRENT,
        })
    }

    pub fn decrypt(&self, user: &User, message: &StoredMessage) -> Result<String> {
        let version = MessageVersion::try_from(message.version)?;
        self.open(&user.salt, version, &message.body)
    }

    /// Decode `body` written in `version` under `salt`.
    pub fn open(&self, salt: &str, version: MessageVersion, body: &str) -> Result<String> {
        let plaintext = match version {
            MessageVersion::Obscured => reveal(body)?,
            MessageVersion::LegacyAes => open_aes(&self.legacy_key(salt), body)?,
            MessageVersion::Aes => open_aes(&self.current_key(salt), body)?,
        };
        String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("decrypted message is not valid UTF-8".into()))
    }

    fn seal(&self, salt: &str, version: MessageVersion, plaintext: &str) -> Result<String> {
        match version {
            MessageVersion::Obscured => Ok(obscure(plaintext.as_bytes())),
            MessageVersion::LegacyAes => {
                seal_aes(&self.rng, &self.legacy_key(salt), plaintext.as_bytes())
            }
            MessageVersion::Aes => seal_aes(&self.rng, &self.current_key(salt), plaintext.as_bytes()),
        }
    }

    fn current_key(&self, salt: &str) -> [u8; KEY_LEN] {
        if let Some(key) = self.keys.get(salt) {
            return *key;
        }

        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.iterations,
            salt.as_bytes(),
            self.secret.as_bytes(),
            &mut key,
        );
        debug!("derived transcript key ({} cached)", self.keys.len() + 1);
        self.keys.insert(salt.to_string(), key);
        key
    }

    fn legacy_key(&self, salt: &str) -> [u8; KEY_LEN] {
        let mut input = Vec::with_capacity(self.secret.len() + salt.len());
        input.extend_from_slice(self.secret.as_bytes());
        input.extend_from_slice(salt.as_bytes());
        let hash = digest(&SHA256, &input);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(hash.as_ref());
        key
    }
}

fn make_aead_key(key: &[u8; KEY_LEN]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Crypto("failed to create AES key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Layout: base64(nonce ‖ ciphertext ‖ tag).
fn seal_aes(rng: &SystemRandom, key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| Error::Crypto("failed to generate nonce".into()))?;

    let key = make_aead_key(key)?;
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| Error::Crypto("encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(BASE64.encode(sealed))
}

fn open_aes(key: &[u8; KEY_LEN], body: &str) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(body)
        .map_err(|e| Error::Crypto(format!("invalid ciphertext encoding: {e}")))?;
    if raw.len() < NONCE_LEN {
        return Err(Error::Crypto("ciphertext is shorter than its nonce".into()));
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| Error::Crypto("invalid nonce length".into()))?;

    let key = make_aead_key(key)?;
    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::Crypto("wrong key or corrupted message".into()))?;
    Ok(plaintext.to_vec())
}

fn xor_pad(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .zip(OBSCURE_PAD.iter().cycle())
        .map(|(b, p)| b ^ p)
        .collect()
}

fn obscure(plaintext: &[u8]) -> String {
    BASE64.encode(xor_pad(plaintext))
}

fn reveal(body: &str) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(body)
        .map_err(|e| Error::Crypto(format!("invalid obscured encoding: {e}")))?;
    Ok(xor_pad(&raw))
}
