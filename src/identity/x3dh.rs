use crate::crypto::{CryptoProvider, X25519_KEY_LEN};
use crate::identity::{HandshakeInit, IdentityKeys, PublicKeyBundle};
use crate::keys::X25519PublicKey;
use crate::{Error, SecureBuffer};
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

/// Domain-separation prefix placed ahead of the DH outputs.
const IKM_PREFIX: [u8; 32] = [0xFF; 32];

/// Result of the initiator side of X3DH.
#[derive(Debug)]
pub struct X3dhInitiation {
    pub shared_secret: SecureBuffer,
    pub ephemeral_public: X25519PublicKey,
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
}

impl IdentityKeys {
    /// Initiator side of X3DH against a remote bundle.
    ///
    /// Requires an ephemeral key from
    /// [`generate_ephemeral_key_pair`](Self::generate_ephemeral_key_pair).
    /// When the bundle lists one-time pre-keys the first one is used. The
    /// ephemeral private key is wiped once the secret has been derived.
    pub fn x3dh_derive_shared_secret(
        &mut self,
        remote: &PublicKeyBundle,
        info: &[u8],
    ) -> Result<X3dhInitiation, Error> {
        self.ensure_live()?;
        if info.is_empty() {
            return Err(Error::InvalidInput("X3DH info must not be empty".to_string()));
        }
        if !remote.verify(self.provider())? {
            return Err(Error::PeerPubKey(
                "signed pre-key signature does not verify".to_string(),
            ));
        }
        let Some(ephemeral) = self.ephemeral.as_ref() else {
            return Err(Error::PrepareLocal("no ephemeral key prepared".to_string()));
        };

        let provider = self.provider.as_ref();
        let one_time = remote.first_one_time_pre_key();

        // DH1 = DH(IKa, SPKb), DH2 = DH(EKa, IKb), DH3 = DH(EKa, SPKb), DH4 = DH(EKa, OPKb)
        let mut outputs = vec![
            self.agreement.dh(&remote.signed_pre_key_public, provider)?,
            ephemeral.dh(&remote.identity_x25519, provider)?,
            ephemeral.dh(&remote.signed_pre_key_public, provider)?,
        ];
        if let Some(one_time) = one_time {
            outputs.push(ephemeral.dh(&one_time.public_key, provider)?);
        }

        let shared_secret = derive_shared_secret(&outputs, info, provider)?;
        let ephemeral_public = ephemeral.public_key();
        self.ephemeral = None;

        debug!(
            signed_pre_key_id = remote.signed_pre_key_id,
            one_time_pre_key_id = ?one_time.map(|key| key.id),
            "derived initiator shared secret"
        );

        Ok(X3dhInitiation {
            shared_secret,
            ephemeral_public,
            signed_pre_key_id: remote.signed_pre_key_id,
            one_time_pre_key_id: one_time.map(|key| key.id),
        })
    }

    /// Responder side of X3DH.
    ///
    /// The one-time pre-key named by the hello is removed only after the
    /// whole derivation has succeeded.
    pub fn x3dh_respond(&mut self, hello: &HandshakeInit, info: &[u8]) -> Result<SecureBuffer, Error> {
        let shared_secret = self.x3dh_respond_secret(hello, info)?;
        if let Some(id) = hello.one_time_pre_key_id {
            self.consume_one_time_pre_key(id);
        }
        Ok(shared_secret)
    }

    /// Responder derivation without consuming the one-time pre-key.
    pub(crate) fn x3dh_respond_secret(
        &self,
        hello: &HandshakeInit,
        info: &[u8],
    ) -> Result<SecureBuffer, Error> {
        self.ensure_live()?;
        if info.is_empty() {
            return Err(Error::InvalidInput("X3DH info must not be empty".to_string()));
        }
        if hello.signed_pre_key_id != self.signed_pre_key.id() {
            return Err(Error::Handshake(format!(
                "unknown signed pre-key {}",
                hello.signed_pre_key_id
            )));
        }
        let one_time = match hello.one_time_pre_key_id {
            Some(id) => Some(self.one_time_pre_keys.get(id).ok_or_else(|| {
                Error::Handshake(format!("unknown one-time pre-key {id}"))
            })?),
            None => None,
        };

        let provider = self.provider.as_ref();
        let signed_pre_key = self.signed_pre_key.key_pair();

        // DH1 = DH(SPKb, IKa), DH2 = DH(IKb, EKa), DH3 = DH(SPKb, EKa), DH4 = DH(OPKb, EKa)
        let mut outputs = vec![
            signed_pre_key.dh(&hello.identity_x25519, provider)?,
            self.agreement.dh(&hello.ephemeral_x25519, provider)?,
            signed_pre_key.dh(&hello.ephemeral_x25519, provider)?,
        ];
        if let Some(one_time) = one_time {
            outputs.push(one_time.key_pair().dh(&hello.ephemeral_x25519, provider)?);
        }

        let shared_secret = derive_shared_secret(&outputs, info, provider)?;
        debug!(
            signed_pre_key_id = hello.signed_pre_key_id,
            one_time_pre_key_id = ?hello.one_time_pre_key_id,
            "derived responder shared secret"
        );
        Ok(shared_secret)
    }

    pub(crate) fn consume_one_time_pre_key(&mut self, id: u32) {
        if let Some(mut record) = self.one_time_pre_keys.take(id) {
            record.dispose();
            debug!(one_time_pre_key_id = id, "consumed one-time pre-key");
        }
    }
}

/// HKDF over `0xFF * 32 || DH1 || DH2 || DH3 [|| DH4]`.
fn derive_shared_secret(
    outputs: &[Zeroizing<[u8; X25519_KEY_LEN]>],
    info: &[u8],
    provider: &dyn CryptoProvider,
) -> Result<SecureBuffer, Error> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(X25519_KEY_LEN * (outputs.len() + 1)));
    ikm.extend_from_slice(&IKM_PREFIX);
    for output in outputs {
        ikm.extend_from_slice(output.as_slice());
    }

    let mut secret = Zeroizing::new([0u8; 32]);
    provider.hkdf_sha256(None, &ikm, info, secret.as_mut_slice())?;
    SecureBuffer::from_slice(secret.as_slice())
}

/// Stable, non-secret identifier for a session, used in logs.
///
/// Both sides compute the same value from the initiator's identity key, the
/// responder's identity key and the initiator's ephemeral key.
pub fn session_fingerprint(
    initiator_identity: &X25519PublicKey,
    responder_identity: &X25519PublicKey,
    ephemeral: &X25519PublicKey,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(initiator_identity.as_bytes());
    hasher.update(responder_identity.as_bytes());
    hasher.update(ephemeral.as_bytes());

    let engine = base64::engine::general_purpose::STANDARD;
    engine.encode(hasher.finalize())
}
