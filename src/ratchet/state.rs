use crate::config::RatchetLimits;
use crate::crypto::{CryptoProvider, X25519_KEY_LEN};
use crate::keys::{X25519KeyPair, X25519PublicKey};
use crate::proto::{
    ChainStateProto, ConnectionStateProto, PreviousRemoteKeyProto, STATE_VERSION, fixed_field,
};
use crate::ratchet::chain::{CHAIN_KEY_LEN, ChainKind, ChainStep, MessageKey};
use crate::ratchet::message::MessageHeader;
use crate::ratchet::replay::ReplayWindow;
use crate::ratchet::skipped::SkippedKeyCache;
use crate::{Error, SecureBuffer};
use std::collections::VecDeque;
use tracing::{debug, trace};
use zeroize::Zeroizing;

const ROOT_STEP_INFO: &[u8] = b"vigil-ratchet";
pub(crate) const ROOT_INFO: &[u8] = b"vigil-root";
pub(crate) const INITIAL_CHAIN_INFO: &[u8] = b"init-send";

/// Remote ratchet keys remembered after their chain was forgotten.
pub(crate) const MAX_RETIRED_REMOTE_KEYS: usize = 128;

/// Where an incoming header's ratchet key places the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HeaderTarget {
    /// The current receiving chain.
    Current(u32),
    /// A superseded chain; only the skipped-key cache can serve it.
    Previous(u32),
    /// The responder learns the initiator's first ratchet key.
    Adopt(u32),
    /// A new remote key: a receiving ratchet is needed.
    Ratchet,
    /// A remote key whose chain was already forgotten.
    Retired,
    /// The remote key is known but there is no chain to receive on.
    Unexpected,
}

impl HeaderTarget {
    pub(crate) fn known_generation(self) -> Option<u32> {
        match self {
            Self::Current(generation) | Self::Previous(generation) | Self::Adopt(generation) => {
                Some(generation)
            }
            Self::Ratchet | Self::Retired | Self::Unexpected => None,
        }
    }
}

/// Complete double-ratchet state of one connection.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) is_initiator: bool,
    pub(crate) root_key: SecureBuffer,
    pub(crate) sending_chain: Option<ChainStep>,
    pub(crate) receiving_chain: Option<ChainStep>,
    pub(crate) dh_pair: X25519KeyPair,
    pub(crate) remote_dh_public: Option<X25519PublicKey>,
    pub(crate) receiving_generation: u32,
    /// Superseded remote keys and their generations, oldest first.
    pub(crate) previous_remote_keys: VecDeque<(X25519PublicKey, u32)>,
    /// Keys evicted from `previous_remote_keys`, oldest first.
    pub(crate) retired_remote_keys: VecDeque<X25519PublicKey>,
    pub(crate) previous_sending_chain_length: u32,
    pub(crate) sending_ratchet_pending: bool,
    pub(crate) skipped: SkippedKeyCache,
    pub(crate) replay: ReplayWindow,
    pub(crate) associated_data: Vec<u8>,
    pub(crate) fingerprint: String,
    pub(crate) ratchet_steps: u64,
}

impl ConnectionState {
    pub(crate) fn try_clone(&self) -> Result<Self, Error> {
        Ok(Self {
            is_initiator: self.is_initiator,
            root_key: self.root_key.try_clone()?,
            sending_chain: self
                .sending_chain
                .as_ref()
                .map(ChainStep::try_clone)
                .transpose()?,
            receiving_chain: self
                .receiving_chain
                .as_ref()
                .map(ChainStep::try_clone)
                .transpose()?,
            dh_pair: self.dh_pair.try_clone()?,
            remote_dh_public: self.remote_dh_public,
            receiving_generation: self.receiving_generation,
            previous_remote_keys: self.previous_remote_keys.clone(),
            retired_remote_keys: self.retired_remote_keys.clone(),
            previous_sending_chain_length: self.previous_sending_chain_length,
            sending_ratchet_pending: self.sending_ratchet_pending,
            skipped: self.skipped.try_clone()?,
            replay: self.replay.clone(),
            associated_data: self.associated_data.clone(),
            fingerprint: self.fingerprint.clone(),
            ratchet_steps: self.ratchet_steps,
        })
    }

    pub(crate) fn resolve(&self, dh_public: &X25519PublicKey) -> HeaderTarget {
        if self.remote_dh_public.as_ref() == Some(dh_public) {
            return match self.receiving_chain {
                Some(_) => HeaderTarget::Current(self.receiving_generation),
                None => HeaderTarget::Unexpected,
            };
        }
        if let Some((_, generation)) = self
            .previous_remote_keys
            .iter()
            .find(|(key, _)| key == dh_public)
        {
            return HeaderTarget::Previous(*generation);
        }
        if self.retired_remote_keys.contains(dh_public) {
            return HeaderTarget::Retired;
        }
        if self.remote_dh_public.is_none() && self.receiving_chain.is_some() {
            return HeaderTarget::Adopt(self.receiving_generation);
        }
        HeaderTarget::Ratchet
    }

    /// One root-chain step: HKDF salted with the root key over the DH output.
    ///
    /// Replaces the root key and returns the new chain key.
    fn kdf_root(
        &mut self,
        dh_output: &[u8; X25519_KEY_LEN],
        provider: &dyn CryptoProvider,
    ) -> Result<SecureBuffer, Error> {
        let root_key = self.root_key.read_array::<32>()?;
        let mut okm = Zeroizing::new([0u8; 64]);
        provider.hkdf_sha256(
            Some(root_key.as_slice()),
            dh_output,
            ROOT_STEP_INFO,
            okm.as_mut_slice(),
        )?;

        let chain_key = SecureBuffer::from_slice(&okm[32..])?;
        self.root_key.write(&okm[..32])?;
        Ok(chain_key)
    }

    /// New local ratchet key, new root key and a fresh sending chain.
    pub(crate) fn sending_ratchet(&mut self, provider: &dyn CryptoProvider) -> Result<(), Error> {
        let Some(remote) = self.remote_dh_public else {
            return Err(Error::PrepareLocal(
                "remote ratchet key not yet known".to_string(),
            ));
        };

        let dh_pair = X25519KeyPair::generate(provider)?;
        let dh_output = dh_pair.dh(&remote, provider)?;
        let chain_key = self.kdf_root(&dh_output, provider)?;

        self.previous_sending_chain_length = self.sending_chain.as_ref().map_or(0, ChainStep::index);
        self.sending_chain = Some(ChainStep::new(ChainKind::Sending, chain_key)?);
        self.dh_pair = dh_pair;
        self.sending_ratchet_pending = false;
        self.ratchet_steps += 1;

        debug!(
            previous_chain_length = self.previous_sending_chain_length,
            "performed sending ratchet"
        );
        Ok(())
    }

    /// Caches the rest of the current receiving chain up to `until` (exclusive).
    fn skip_receiving_until(
        &mut self,
        until: u32,
        limits: &RatchetLimits,
        provider: &dyn CryptoProvider,
    ) -> Result<(), Error> {
        let generation = self.receiving_generation;
        let Some(chain) = self.receiving_chain.as_mut() else {
            return Ok(());
        };
        if until <= chain.index() {
            return Ok(());
        }

        let gap = until - chain.index();
        if gap > limits.max_skip {
            return Err(Error::TooManySkipped(gap));
        }

        while chain.index() < until {
            let message_key = chain.advance(provider)?;
            self.skipped.insert(generation, message_key.index, message_key.key);
        }
        trace!(generation, gap, "cached skipped message keys");
        Ok(())
    }

    /// Mirror of the peer's sending ratchet, triggered by an unknown header key.
    pub(crate) fn receiving_ratchet(
        &mut self,
        header: &MessageHeader,
        limits: &RatchetLimits,
        provider: &dyn CryptoProvider,
    ) -> Result<(), Error> {
        self.skip_receiving_until(header.previous_chain_length, limits, provider)?;

        let next_generation = self
            .receiving_generation
            .checked_add(1)
            .ok_or_else(|| Error::DeriveKey("receiving generations exhausted".to_string()))?;

        let dh_output = self.dh_pair.dh(&header.dh_public, provider)?;
        let chain_key = self.kdf_root(&dh_output, provider)?;

        if let Some(previous) = self.remote_dh_public {
            self.previous_remote_keys
                .push_back((previous, self.receiving_generation));
            while self.previous_remote_keys.len() > limits.max_tracked_generations {
                if let Some((key, generation)) = self.previous_remote_keys.pop_front() {
                    let dropped = self.skipped.remove_generation(generation);
                    trace!(generation, dropped, "forgot superseded receiving chain");
                    self.retired_remote_keys.push_back(key);
                    if self.retired_remote_keys.len() > MAX_RETIRED_REMOTE_KEYS {
                        self.retired_remote_keys.pop_front();
                    }
                }
            }
        }

        self.receiving_chain = Some(ChainStep::new(ChainKind::Receiving, chain_key)?);
        self.receiving_generation = next_generation;
        self.remote_dh_public = Some(header.dh_public);
        self.sending_ratchet_pending = true;
        self.ratchet_steps += 1;

        debug!(generation = next_generation, "performed receiving ratchet");
        Ok(())
    }

    /// Message key for `index` on the current receiving chain.
    ///
    /// Indices behind the chain come from the skipped cache. Indices ahead of
    /// it advance the chain and cache every intermediate key.
    pub(crate) fn receive_on_current(
        &mut self,
        index: u32,
        limits: &RatchetLimits,
        provider: &dyn CryptoProvider,
    ) -> Result<SecureBuffer, Error> {
        let generation = self.receiving_generation;
        let chain_index = match self.receiving_chain.as_ref() {
            Some(chain) => chain.index(),
            None => return Err(Error::PrepareLocal("no receiving chain".to_string())),
        };

        if index < chain_index {
            return self
                .skipped
                .take(generation, index)
                .ok_or(Error::ReplayDetected);
        }

        self.skip_receiving_until(index, limits, provider)?;
        let chain = self
            .receiving_chain
            .as_mut()
            .ok_or_else(|| Error::PrepareLocal("no receiving chain".to_string()))?;
        Ok(chain.advance(provider)?.key)
    }

    /// Like [`receive_on_current`](Self::receive_on_current) but leaves `self`
    /// untouched; the changes are returned as a [`ReceiveStep`].
    pub(crate) fn stage_receive(
        &self,
        index: u32,
        limits: &RatchetLimits,
        provider: &dyn CryptoProvider,
    ) -> Result<(SecureBuffer, ReceiveStep), Error> {
        let generation = self.receiving_generation;
        let Some(chain) = self.receiving_chain.as_ref() else {
            return Err(Error::PrepareLocal("no receiving chain".to_string()));
        };

        if index < chain.index() {
            let key = self
                .skipped
                .get(generation, index)
                .ok_or(Error::ReplayDetected)?
                .try_clone()?;
            return Ok((key, ReceiveStep::from_cache(generation, index)));
        }

        let gap = index - chain.index();
        if gap > limits.max_skip {
            return Err(Error::TooManySkipped(gap));
        }

        let mut chain = chain.try_clone()?;
        let mut skipped = Vec::with_capacity(gap as usize);
        while chain.index() < index {
            skipped.push(chain.advance(provider)?);
        }
        let key = chain.advance(provider)?.key;
        Ok((
            key,
            ReceiveStep {
                generation,
                index,
                chain: Some(chain),
                skipped,
                from_cache: false,
                adopted: None,
            },
        ))
    }

    pub(crate) fn to_proto(&self, connection_id: u32) -> Result<Zeroizing<ConnectionStateProto>, Error> {
        let chain_proto = |chain: &ChainStep| -> Result<ChainStateProto, Error> {
            Ok(ChainStateProto {
                key: chain.key_bytes()?.to_vec(),
                index: chain.index(),
            })
        };

        Ok(Zeroizing::new(ConnectionStateProto {
            version: STATE_VERSION,
            connection_id,
            is_initiator: self.is_initiator,
            root_key: self.root_key.read_bytes(32)?.to_vec(),
            sending_chain: self.sending_chain.as_ref().map(chain_proto).transpose()?,
            receiving_chain: self.receiving_chain.as_ref().map(chain_proto).transpose()?,
            dh_secret: self.dh_pair.secret_bytes()?.to_vec(),
            dh_public: self.dh_pair.public_key().to_bytes().to_vec(),
            remote_dh_public: self
                .remote_dh_public
                .map(|key| key.to_bytes().to_vec())
                .unwrap_or_default(),
            receiving_generation: self.receiving_generation,
            previous_remote_keys: self
                .previous_remote_keys
                .iter()
                .map(|(key, generation)| PreviousRemoteKeyProto {
                    public: key.to_bytes().to_vec(),
                    generation: *generation,
                })
                .collect(),
            previous_sending_chain_length: self.previous_sending_chain_length,
            sending_ratchet_pending: self.sending_ratchet_pending,
            skipped_keys: self.skipped.to_proto()?,
            replay: Some(self.replay.to_proto()),
            associated_data: self.associated_data.clone(),
            fingerprint: self.fingerprint.clone(),
            ratchet_steps: self.ratchet_steps,
            retired_remote_keys: self
                .retired_remote_keys
                .iter()
                .map(|key| key.to_bytes().to_vec())
                .collect(),
        }))
    }

    pub(crate) fn from_proto(
        proto: &ConnectionStateProto,
        limits: &RatchetLimits,
        provider: &dyn CryptoProvider,
    ) -> Result<Self, Error> {
        if proto.version != STATE_VERSION {
            return Err(Error::Decode(format!(
                "Unsupported schema version: {}",
                proto.version
            )));
        }

        let chain = |kind: ChainKind, chain: &ChainStateProto| -> Result<ChainStep, Error> {
            if chain.key.len() != CHAIN_KEY_LEN {
                return Err(Error::Decode(format!("chain key has {} bytes", chain.key.len())));
            }
            ChainStep::with_index(kind, SecureBuffer::from_slice(&chain.key)?, chain.index)
        };

        if proto.root_key.len() != 32 {
            return Err(Error::Decode(format!(
                "root key has {} bytes",
                proto.root_key.len()
            )));
        }

        let remote_dh_public = if proto.remote_dh_public.is_empty() {
            None
        } else {
            Some(X25519PublicKey::from(fixed_field::<32>(
                &proto.remote_dh_public,
                "remote ratchet key",
            )?))
        };

        let previous_remote_keys = proto
            .previous_remote_keys
            .iter()
            .map(|entry| {
                Ok((
                    X25519PublicKey::from(fixed_field::<32>(&entry.public, "superseded ratchet key")?),
                    entry.generation,
                ))
            })
            .collect::<Result<VecDeque<_>, Error>>()?;

        let mut retired_remote_keys = proto
            .retired_remote_keys
            .iter()
            .map(|key| Ok(X25519PublicKey::from(fixed_field::<32>(key, "retired ratchet key")?)))
            .collect::<Result<VecDeque<_>, Error>>()?;
        while retired_remote_keys.len() > MAX_RETIRED_REMOTE_KEYS {
            retired_remote_keys.pop_front();
        }

        let replay = match proto.replay.as_ref() {
            Some(replay) => {
                ReplayWindow::from_proto(replay, limits.replay_window, limits.max_tracked_generations)
            }
            None => ReplayWindow::new(limits.replay_window, limits.max_tracked_generations),
        };

        Ok(Self {
            is_initiator: proto.is_initiator,
            root_key: SecureBuffer::from_slice(&proto.root_key)?,
            sending_chain: proto
                .sending_chain
                .as_ref()
                .map(|c| chain(ChainKind::Sending, c))
                .transpose()?,
            receiving_chain: proto
                .receiving_chain
                .as_ref()
                .map(|c| chain(ChainKind::Receiving, c))
                .transpose()?,
            dh_pair: X25519KeyPair::from_parts(&proto.dh_secret, &proto.dh_public, provider)?,
            remote_dh_public,
            receiving_generation: proto.receiving_generation,
            previous_remote_keys,
            retired_remote_keys,
            previous_sending_chain_length: proto.previous_sending_chain_length,
            sending_ratchet_pending: proto.sending_ratchet_pending,
            skipped: SkippedKeyCache::from_proto(&proto.skipped_keys, limits.max_skipped_message_keys)?,
            replay,
            associated_data: proto.associated_data.clone(),
            fingerprint: proto.fingerprint.clone(),
            ratchet_steps: proto.ratchet_steps,
        })
    }
}

/// Changes made by receiving on a chain that is already known.
///
/// Applying it cannot fail, so it is built first and applied only once the
/// message authenticated.
pub(crate) struct ReceiveStep {
    generation: u32,
    index: u32,
    /// Replacement receiving chain, when it moved forward.
    chain: Option<ChainStep>,
    /// Keys derived while catching up to `index`.
    skipped: Vec<MessageKey>,
    /// The key came out of the skipped cache and must be removed from it.
    from_cache: bool,
    adopted: Option<X25519PublicKey>,
}

impl ReceiveStep {
    pub(crate) fn from_cache(generation: u32, index: u32) -> Self {
        Self {
            generation,
            index,
            chain: None,
            skipped: Vec::new(),
            from_cache: true,
            adopted: None,
        }
    }

    /// Records the remote ratchet key learned from the header.
    pub(crate) fn adopting(mut self, remote: X25519PublicKey) -> Self {
        self.adopted = Some(remote);
        self
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn apply(self, state: &mut ConnectionState) {
        if let Some(remote) = self.adopted {
            state.remote_dh_public = Some(remote);
        }
        if let Some(chain) = self.chain {
            state.receiving_chain = Some(chain);
        }
        for message_key in self.skipped {
            state
                .skipped
                .insert(self.generation, message_key.index, message_key.key);
        }
        if self.from_cache {
            drop(state.skipped.take(self.generation, self.index));
        }
    }
}
