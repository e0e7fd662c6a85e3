use crate::crypto::CryptoProvider;
use crate::keys::{
    Ed25519PublicKey, Ed25519Signature, OneTimePreKeyPublic, X25519PublicKey, verify_signature,
};
use crate::proto::{HandshakeInitProto, OneTimePreKeyPublicProto, PublicKeyBundleProto};
use crate::Error;
use prost::Message;

/// Public keys a party publishes so others can start sessions with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyBundle {
    pub identity_ed25519: Ed25519PublicKey,
    pub identity_x25519: X25519PublicKey,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: X25519PublicKey,
    pub signed_pre_key_signature: Ed25519Signature,
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
    pub ephemeral_x25519: Option<X25519PublicKey>,
}

impl PublicKeyBundle {
    /// Checks the signed pre-key signature against the bundle's identity key.
    pub fn verify(&self, provider: &dyn CryptoProvider) -> Result<bool, Error> {
        verify_signature(
            &self.identity_ed25519,
            self.signed_pre_key_public.as_bytes(),
            &self.signed_pre_key_signature,
            provider,
        )
    }

    /// The one-time pre-key an initiator will use, if any.
    pub fn first_one_time_pre_key(&self) -> Option<&OneTimePreKeyPublic> {
        self.one_time_pre_keys.first()
    }

    pub fn to_proto(&self) -> PublicKeyBundleProto {
        PublicKeyBundleProto {
            identity_ed25519: self.identity_ed25519.to_bytes().to_vec(),
            identity_x25519: self.identity_x25519.to_bytes().to_vec(),
            signed_pre_key_id: self.signed_pre_key_id,
            signed_pre_key_public: self.signed_pre_key_public.to_bytes().to_vec(),
            signed_pre_key_signature: self.signed_pre_key_signature.to_bytes().to_vec(),
            one_time_pre_keys: self
                .one_time_pre_keys
                .iter()
                .map(|key| OneTimePreKeyPublicProto {
                    id: key.id,
                    public: key.public_key.to_bytes().to_vec(),
                })
                .collect(),
            ephemeral_x25519: self
                .ephemeral_x25519
                .map(|key| key.to_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn from_proto(proto: &PublicKeyBundleProto) -> Result<Self, Error> {
        let one_time_pre_keys = proto
            .one_time_pre_keys
            .iter()
            .map(|key| {
                Ok(OneTimePreKeyPublic {
                    id: key.id,
                    public_key: X25519PublicKey::try_from(key.public.as_slice())?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self {
            identity_ed25519: Ed25519PublicKey::try_from(proto.identity_ed25519.as_slice())?,
            identity_x25519: X25519PublicKey::try_from(proto.identity_x25519.as_slice())?,
            signed_pre_key_id: proto.signed_pre_key_id,
            signed_pre_key_public: X25519PublicKey::try_from(
                proto.signed_pre_key_public.as_slice(),
            )?,
            signed_pre_key_signature: Ed25519Signature::try_from(
                proto.signed_pre_key_signature.as_slice(),
            )?,
            one_time_pre_keys,
            ephemeral_x25519: optional_key(&proto.ephemeral_x25519)?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_proto(&PublicKeyBundleProto::decode(bytes)?)
    }
}

/// What an initiator sends so the responder can complete the key agreement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeInit {
    pub identity_ed25519: Ed25519PublicKey,
    pub identity_x25519: X25519PublicKey,
    pub ephemeral_x25519: X25519PublicKey,
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
    /// The initiator's first ratchet public key. Lets the responder send
    /// before it has received anything.
    pub ratchet_public: Option<X25519PublicKey>,
}

impl HandshakeInit {
    pub fn to_proto(&self) -> HandshakeInitProto {
        HandshakeInitProto {
            identity_ed25519: self.identity_ed25519.to_bytes().to_vec(),
            identity_x25519: self.identity_x25519.to_bytes().to_vec(),
            ephemeral_x25519: self.ephemeral_x25519.to_bytes().to_vec(),
            signed_pre_key_id: self.signed_pre_key_id,
            one_time_pre_key_id: self.one_time_pre_key_id,
            ratchet_public: self
                .ratchet_public
                .map(|key| key.to_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn from_proto(proto: &HandshakeInitProto) -> Result<Self, Error> {
        Ok(Self {
            identity_ed25519: Ed25519PublicKey::try_from(proto.identity_ed25519.as_slice())?,
            identity_x25519: X25519PublicKey::try_from(proto.identity_x25519.as_slice())?,
            ephemeral_x25519: X25519PublicKey::try_from(proto.ephemeral_x25519.as_slice())?,
            signed_pre_key_id: proto.signed_pre_key_id,
            one_time_pre_key_id: proto.one_time_pre_key_id,
            ratchet_public: optional_key(&proto.ratchet_public)?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_proto(&HandshakeInitProto::decode(bytes)?)
    }
}

fn optional_key(bytes: &[u8]) -> Result<Option<X25519PublicKey>, Error> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(X25519PublicKey::try_from(bytes)?))
}
