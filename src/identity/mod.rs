//! Long-term identity keys, pre-keys and the X3DH key agreement.

mod bundle;
pub use bundle::{HandshakeInit, PublicKeyBundle};

mod state;

mod x3dh;
pub use x3dh::{X3dhInitiation, session_fingerprint};

use crate::crypto::{CryptoProvider, SharedProvider, random_u32};
use crate::keys::{
    Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, OneTimePreKeyStore, SignedPreKey,
    X25519KeyPair, X25519PublicKey, verify_signature,
};
use crate::Error;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

/// Id given to the first signed pre-key of a new identity.
pub const INITIAL_SIGNED_PRE_KEY_ID: u32 = 1;

const MIN_MASTER_KEY_LEN: usize = 32;

const LABEL_ED25519: &[u8] = b"vigil-identity-ed25519";
const LABEL_X25519: &[u8] = b"vigil-identity-x25519";
const LABEL_SIGNED_PRE_KEY: &[u8] = b"vigil-signed-pre-key";
const LABEL_ONE_TIME_PRE_KEY: &str = "vigil-one-time-pre-key";

/// A party's long-term key material.
///
/// Holds the Ed25519 signing key, the X25519 identity key, the current signed
/// pre-key, the unused one-time pre-keys and, while a handshake is being
/// prepared, an ephemeral X25519 key. All private halves live in
/// [`SecureBuffer`](crate::SecureBuffer)s and are wiped on [`dispose`](Self::dispose)
/// or drop.
pub struct IdentityKeys {
    provider: SharedProvider,
    signing: Ed25519KeyPair,
    agreement: X25519KeyPair,
    signed_pre_key: SignedPreKey,
    one_time_pre_keys: OneTimePreKeyStore,
    ephemeral: Option<X25519KeyPair>,
    disposed: bool,
}

impl IdentityKeys {
    /// Generates a new identity with `one_time_key_count` one-time pre-keys.
    pub fn generate(one_time_key_count: usize, provider: SharedProvider) -> Result<Self, Error> {
        let signing = Ed25519KeyPair::generate(provider.as_ref())?;
        let agreement = X25519KeyPair::generate(provider.as_ref())?;
        let signed_pre_key =
            SignedPreKey::generate(INITIAL_SIGNED_PRE_KEY_ID, &signing, provider.as_ref())?;

        let mut one_time_pre_keys = OneTimePreKeyStore::new();
        one_time_pre_keys.generate_initial(
            one_time_key_count,
            &BTreeSet::from([INITIAL_SIGNED_PRE_KEY_ID]),
            provider.as_ref(),
        )?;

        debug!(one_time_key_count, "generated identity keys");

        Ok(Self::assemble(
            provider,
            signing,
            agreement,
            signed_pre_key,
            one_time_pre_keys,
        ))
    }

    /// Derives an identity deterministically from a master key.
    ///
    /// Every seed is HKDF-SHA256 over the master key, salted with the
    /// membership id and separated by a per-key label, so two derivations
    /// with the same inputs produce identical keys and ids.
    pub fn derive_from_master_key(
        master_key: &[u8],
        membership_id: &[u8],
        one_time_key_count: usize,
        provider: SharedProvider,
    ) -> Result<Self, Error> {
        if master_key.len() < MIN_MASTER_KEY_LEN {
            return Err(Error::InvalidInput(format!(
                "master key must be at least {MIN_MASTER_KEY_LEN} bytes"
            )));
        }
        if membership_id.is_empty() {
            return Err(Error::InvalidInput("membership id must not be empty".to_string()));
        }

        let seed = |label: &[u8]| -> Result<Zeroizing<[u8; 32]>, Error> {
            let mut out = Zeroizing::new([0u8; 32]);
            provider.hkdf_sha256(Some(membership_id), master_key, label, out.as_mut_slice())?;
            Ok(out)
        };

        let signing = Ed25519KeyPair::from_seed(&*seed(LABEL_ED25519)?, provider.as_ref())?;
        let agreement = X25519KeyPair::from_seed(&*seed(LABEL_X25519)?, provider.as_ref())?;
        let signed_pre_key = SignedPreKey::sign(
            INITIAL_SIGNED_PRE_KEY_ID,
            X25519KeyPair::from_seed(&*seed(LABEL_SIGNED_PRE_KEY)?, provider.as_ref())?,
            &signing,
            provider.as_ref(),
        )?;

        let mut one_time_pre_keys = OneTimePreKeyStore::new();
        let first = crate::keys::FIRST_ONE_TIME_PRE_KEY_ID;
        for offset in 0..one_time_key_count {
            let id = u32::try_from(offset)
                .ok()
                .and_then(|offset| first.checked_add(offset))
                .ok_or_else(|| Error::InvalidInput("too many one-time pre-keys".to_string()))?;
            let label = format!("{LABEL_ONE_TIME_PRE_KEY}/{id}");
            let key_pair = X25519KeyPair::from_seed(&*seed(label.as_bytes())?, provider.as_ref())?;
            one_time_pre_keys.insert(crate::keys::OneTimePreKeyRecord::new(id, key_pair));
        }

        debug!(one_time_key_count, "derived identity keys from master key");

        Ok(Self::assemble(
            provider,
            signing,
            agreement,
            signed_pre_key,
            one_time_pre_keys,
        ))
    }

    pub(crate) fn assemble(
        provider: SharedProvider,
        signing: Ed25519KeyPair,
        agreement: X25519KeyPair,
        signed_pre_key: SignedPreKey,
        one_time_pre_keys: OneTimePreKeyStore,
    ) -> Self {
        Self {
            provider,
            signing,
            agreement,
            signed_pre_key,
            one_time_pre_keys,
            ephemeral: None,
            disposed: false,
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<(), Error> {
        if self.disposed {
            return Err(Error::ObjectDisposed("IdentityKeys"));
        }
        Ok(())
    }

    pub(crate) fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    /// The public bundle others use to start a session with this identity.
    pub fn create_public_bundle(&self) -> Result<PublicKeyBundle, Error> {
        self.ensure_live()?;

        Ok(PublicKeyBundle {
            identity_ed25519: self.signing.public_key(),
            identity_x25519: self.agreement.public_key(),
            signed_pre_key_id: self.signed_pre_key.id(),
            signed_pre_key_public: self.signed_pre_key.public_key(),
            signed_pre_key_signature: self.signed_pre_key.signature(),
            one_time_pre_keys: self.one_time_pre_keys.public_keys(),
            ephemeral_x25519: self.ephemeral.as_ref().map(X25519KeyPair::public_key),
        })
    }

    /// Generates a fresh ephemeral key for the next initiated handshake.
    ///
    /// Any previous ephemeral key is wiped.
    pub fn generate_ephemeral_key_pair(&mut self) -> Result<X25519PublicKey, Error> {
        self.ensure_live()?;

        let key_pair = X25519KeyPair::generate(self.provider())?;
        let public = key_pair.public_key();
        self.ephemeral = Some(key_pair);
        Ok(public)
    }

    /// Checks a remote signed pre-key signature from raw bytes.
    ///
    /// Lengths are checked before any verification is attempted.
    pub fn verify_remote_signed_pre_key(
        &self,
        identity_ed25519: &[u8],
        signed_pre_key_public: &[u8],
        signature: &[u8],
    ) -> Result<bool, Error> {
        let identity = Ed25519PublicKey::try_from(identity_ed25519)?;
        let signed_pre_key = X25519PublicKey::try_from(signed_pre_key_public)?;
        let signature = Ed25519Signature::try_from(signature)?;

        verify_signature(
            &identity,
            signed_pre_key.as_bytes(),
            &signature,
            self.provider(),
        )
    }

    /// Tops the one-time pre-keys up to `target` with fresh random ids.
    ///
    /// Returns the ids that were added.
    pub fn replenish_one_time_pre_keys(&mut self, target: usize) -> Result<Vec<u32>, Error> {
        self.ensure_live()?;

        let missing = target.saturating_sub(self.one_time_pre_keys.len());
        if missing == 0 {
            return Ok(Vec::new());
        }

        let reserved = BTreeSet::from([self.signed_pre_key.id()]);
        let added = self
            .one_time_pre_keys
            .generate_random(missing, &reserved, self.provider.as_ref())?;
        debug!(added = added.len(), "replenished one-time pre-keys");
        Ok(added)
    }

    /// Replaces the signed pre-key with a freshly generated and signed one.
    ///
    /// Handshakes still in flight against the old pre-key fail afterwards.
    pub fn rotate_signed_pre_key(&mut self) -> Result<u32, Error> {
        self.ensure_live()?;

        let current = self.signed_pre_key.id();
        let id = loop {
            let candidate = random_u32(self.provider())?;
            if candidate != 0 && candidate != current {
                break candidate;
            }
        };

        self.signed_pre_key = SignedPreKey::generate(id, &self.signing, self.provider.as_ref())?;
        debug!(signed_pre_key_id = id, "rotated signed pre-key");
        Ok(id)
    }

    pub fn identity_ed25519_public(&self) -> Ed25519PublicKey {
        self.signing.public_key()
    }

    pub fn identity_x25519_public(&self) -> X25519PublicKey {
        self.agreement.public_key()
    }

    pub fn signed_pre_key_id(&self) -> u32 {
        self.signed_pre_key.id()
    }

    pub fn one_time_pre_key_count(&self) -> usize {
        self.one_time_pre_keys.len()
    }

    pub fn has_one_time_pre_key(&self, id: u32) -> bool {
        self.one_time_pre_keys.contains(id)
    }

    /// Copy of the signed pre-key pair with `id`, used as the responder's
    /// first ratchet key.
    pub fn signed_pre_key_pair(&self, id: u32) -> Result<X25519KeyPair, Error> {
        self.ensure_live()?;
        if id != self.signed_pre_key.id() {
            return Err(Error::Handshake(format!("unknown signed pre-key {id}")));
        }
        self.signed_pre_key.key_pair().try_clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Wipes every private key. All later operations fail with
    /// [`Error::ObjectDisposed`].
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.signing.dispose();
        self.agreement.dispose();
        self.signed_pre_key.dispose();
        self.one_time_pre_keys.dispose();
        self.ephemeral = None;
        self.disposed = true;
    }
}

impl Drop for IdentityKeys {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("identity_ed25519", &self.signing.public_key())
            .field("signed_pre_key_id", &self.signed_pre_key.id())
            .field("one_time_pre_keys", &self.one_time_pre_keys.len())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}
