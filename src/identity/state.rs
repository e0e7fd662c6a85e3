use crate::crypto::SharedProvider;
use crate::identity::IdentityKeys;
use crate::keys::{
    Ed25519KeyPair, Ed25519Signature, OneTimePreKeyRecord, OneTimePreKeyStore, SignedPreKey,
    X25519KeyPair,
};
use crate::proto::{IdentityKeysState, OneTimePreKeyState, fixed_field};
use crate::Error;
use zeroize::Zeroizing;

impl IdentityKeys {
    /// Snapshot of every long-term key, for persistence.
    ///
    /// The pending ephemeral key is not part of the snapshot.
    pub fn export_state(&self) -> Result<Zeroizing<IdentityKeysState>, Error> {
        self.ensure_live()?;

        let mut one_time_pre_keys = Vec::with_capacity(self.one_time_pre_keys.len());
        for record in self.one_time_pre_keys.iter() {
            one_time_pre_keys.push(OneTimePreKeyState {
                id: record.id(),
                public: record.public_key().to_bytes().to_vec(),
                secret: record.key_pair().secret_bytes()?.to_vec(),
            });
        }

        Ok(Zeroizing::new(IdentityKeysState {
            ed25519_public: self.signing.public_key().to_bytes().to_vec(),
            ed25519_secret: self.signing.keypair_bytes()?.to_vec(),
            identity_x25519_public: self.agreement.public_key().to_bytes().to_vec(),
            identity_x25519_secret: self.agreement.secret_bytes()?.to_vec(),
            signed_pre_key_id: self.signed_pre_key.id(),
            signed_pre_key_public: self.signed_pre_key.public_key().to_bytes().to_vec(),
            signed_pre_key_secret: self.signed_pre_key.key_pair().secret_bytes()?.to_vec(),
            signed_pre_key_signature: self.signed_pre_key.signature().to_bytes().to_vec(),
            one_time_pre_keys,
        }))
    }

    /// Independent copy used to stage changes that must be saved before they
    /// take effect. The pending ephemeral key is not copied.
    pub(crate) fn try_clone(&self) -> Result<Self, Error> {
        Self::from_state(&*self.export_state()?, self.provider.clone())
    }

    /// Rebuilds an identity from a snapshot.
    ///
    /// Every fixed-size field is length-checked, public halves are recomputed
    /// and compared, and the signed pre-key signature is verified.
    pub fn from_state(state: &IdentityKeysState, provider: SharedProvider) -> Result<Self, Error> {
        let signing = Ed25519KeyPair::from_parts(
            &state.ed25519_secret,
            &state.ed25519_public,
            provider.as_ref(),
        )?;
        let agreement = X25519KeyPair::from_parts(
            &state.identity_x25519_secret,
            &state.identity_x25519_public,
            provider.as_ref(),
        )?;

        let signature = Ed25519Signature::from(fixed_field::<64>(
            &state.signed_pre_key_signature,
            "signed pre-key signature",
        )?);
        let signed_pre_key = SignedPreKey::from_parts(
            state.signed_pre_key_id,
            X25519KeyPair::from_parts(
                &state.signed_pre_key_secret,
                &state.signed_pre_key_public,
                provider.as_ref(),
            )?,
            signature,
            &signing.public_key(),
            provider.as_ref(),
        )?;

        let mut one_time_pre_keys = OneTimePreKeyStore::new();
        for record in &state.one_time_pre_keys {
            if one_time_pre_keys.contains(record.id) {
                return Err(Error::Decode(format!(
                    "duplicate one-time pre-key id {}",
                    record.id
                )));
            }
            let key_pair = X25519KeyPair::from_parts(&record.secret, &record.public, provider.as_ref())?;
            one_time_pre_keys.insert(OneTimePreKeyRecord::new(record.id, key_pair));
        }

        Ok(Self::assemble(
            provider,
            signing,
            agreement,
            signed_pre_key,
            one_time_pre_keys,
        ))
    }
}
