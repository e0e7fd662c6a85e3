//! Double-ratchet session state machine.
//!
//! A [`RatchetConnection`] is created uninitialized, seeded once from an X3DH
//! shared secret, then advanced by every message sent or received. Every
//! operation stages its changes and applies them only when the whole
//! operation succeeded, so failures never leave a half-advanced connection
//! behind. A DH ratchet step stages a full copy of the state; every other
//! message stages only the chain position and keys it touches.

mod chain;
pub use chain::{ChainKind, ChainStep, MessageKey};

mod message;
pub use message::{HEADER_LEN, MessageHeader, RatchetMessage};

mod replay;
pub use replay::ReplayWindow;

mod skipped;
pub use skipped::SkippedKeyCache;

mod state;
use state::{ConnectionState, HeaderTarget, INITIAL_CHAIN_INFO, ROOT_INFO, ReceiveStep};

use crate::config::RatchetLimits;
use crate::crypto::{AEAD_KEY_LEN, AEAD_NONCE_LEN, CryptoProvider, SharedProvider};
use crate::keys::{X25519KeyPair, X25519PublicKey};
use crate::proto::ConnectionStateProto;
use crate::{Error, SecureBuffer};
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

const MESSAGE_KEYS_INFO: &[u8] = b"vigil-message-keys";

/// Inputs for [`RatchetConnection::establish`].
pub struct SessionSeed {
    /// Output of the X3DH key agreement.
    pub shared_secret: SecureBuffer,
    /// True on the side that sent the handshake hello.
    pub is_initiator: bool,
    /// Initiator: the responder's signed pre-key. Responder: the initiator's
    /// announced ratchet key, or `None` to learn it from the first header.
    pub remote_ratchet_key: Option<X25519PublicKey>,
    /// Responder only: its signed pre-key pair, used as its first ratchet key.
    pub local_ratchet_key: Option<X25519KeyPair>,
    /// Bound into every message as associated data.
    pub associated_data: Vec<u8>,
    /// Session fingerprint shown to users; identical on both sides.
    pub fingerprint: String,
}

enum Change {
    /// A DH ratchet step replaces the whole state.
    Replace(Box<ConnectionState>),
    /// The sending chain moved one position.
    Send(ChainStep),
    Receive(ReceiveStep),
}

/// Changes produced by an operation but not yet committed.
pub(crate) struct StagedState {
    change: Change,
    /// `(generation, index)` to record in the replay window.
    accepted: Option<(u32, u32)>,
}

impl StagedState {
    /// Whether the operation performed a DH ratchet step.
    pub(crate) fn ratcheted(&self) -> bool {
        matches!(self.change, Change::Replace(_))
    }

    /// The complete state after a DH ratchet step, for saving before commit.
    ///
    /// `None` for every other operation.
    pub(crate) fn ratchet_state(
        &self,
        connection_id: u32,
    ) -> Result<Option<Zeroizing<ConnectionStateProto>>, Error> {
        let Change::Replace(state) = &self.change else {
            return Ok(None);
        };
        let mut exported = state.to_proto(connection_id)?;
        if let Some((generation, index)) = self.accepted {
            let mut replay = state.replay.clone();
            replay.accept(generation, index);
            exported.replay = Some(replay.to_proto());
        }
        Ok(Some(exported))
    }
}

enum Phase {
    Uninitialized,
    Established(Box<ConnectionState>),
    Closed,
}

/// One end of a double-ratchet session.
pub struct RatchetConnection {
    connection_id: u32,
    limits: RatchetLimits,
    provider: SharedProvider,
    phase: Phase,
}

impl RatchetConnection {
    pub fn new(connection_id: u32, limits: RatchetLimits, provider: SharedProvider) -> Self {
        Self {
            connection_id,
            limits,
            provider,
            phase: Phase::Uninitialized,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    fn state(&self) -> Result<&ConnectionState, Error> {
        match &self.phase {
            Phase::Established(state) => Ok(&**state),
            Phase::Uninitialized => Err(Error::PrepareLocal(
                "connection not established".to_string(),
            )),
            Phase::Closed => Err(Error::ObjectDisposed("RatchetConnection")),
        }
    }

    fn state_mut(&mut self) -> Result<&mut ConnectionState, Error> {
        match &mut self.phase {
            Phase::Established(state) => Ok(&mut **state),
            Phase::Uninitialized => Err(Error::PrepareLocal(
                "connection not established".to_string(),
            )),
            Phase::Closed => Err(Error::ObjectDisposed("RatchetConnection")),
        }
    }

    /// Seeds the ratchet from an X3DH shared secret.
    ///
    /// The root key is HKDF(secret, "vigil-root") and the first chain key is
    /// HKDF(root, "init-send"). The initiator sends on that chain; the
    /// responder receives on it and performs a sending ratchet before its
    /// first message.
    pub fn establish(&mut self, seed: SessionSeed) -> Result<(), Error> {
        match self.phase {
            Phase::Uninitialized => {}
            Phase::Established(_) => {
                return Err(Error::Handshake("connection already established".to_string()));
            }
            Phase::Closed => return Err(Error::ObjectDisposed("RatchetConnection")),
        }
        let state = Self::initial_state(seed, &self.limits, self.provider.as_ref())?;
        debug!(
            connection_id = self.connection_id,
            fingerprint = %state.fingerprint,
            is_initiator = state.is_initiator,
            "established ratchet connection"
        );
        self.phase = Phase::Established(Box::new(state));
        Ok(())
    }

    fn initial_state(
        seed: SessionSeed,
        limits: &RatchetLimits,
        provider: &dyn CryptoProvider,
    ) -> Result<ConnectionState, Error> {
        let SessionSeed {
            shared_secret,
            is_initiator,
            remote_ratchet_key,
            local_ratchet_key,
            associated_data,
            fingerprint,
        } = seed;

        let secret = shared_secret.read_array::<32>()?;
        let mut root = Zeroizing::new([0u8; 32]);
        provider.hkdf_sha256(None, secret.as_slice(), ROOT_INFO, root.as_mut_slice())?;
        let mut initial_chain = Zeroizing::new([0u8; 32]);
        provider.hkdf_sha256(None, root.as_slice(), INITIAL_CHAIN_INFO, initial_chain.as_mut_slice())?;
        let initial_chain = SecureBuffer::from_slice(initial_chain.as_slice())?;

        let (dh_pair, sending_chain, receiving_chain, pending) = if is_initiator {
            if remote_ratchet_key.is_none() {
                return Err(Error::InvalidInput(
                    "initiator needs the responder's signed pre-key".to_string(),
                ));
            }
            (
                X25519KeyPair::generate(provider)?,
                Some(ChainStep::new(ChainKind::Sending, initial_chain)?),
                None,
                false,
            )
        } else {
            let Some(local) = local_ratchet_key else {
                return Err(Error::PrepareLocal(
                    "responder needs its signed pre-key pair".to_string(),
                ));
            };
            (
                local,
                None,
                Some(ChainStep::new(ChainKind::Receiving, initial_chain)?),
                true,
            )
        };

        Ok(ConnectionState {
            is_initiator,
            root_key: SecureBuffer::from_slice(root.as_slice())?,
            sending_chain,
            receiving_chain,
            dh_pair,
            remote_dh_public: remote_ratchet_key,
            receiving_generation: 0,
            previous_remote_keys: VecDeque::new(),
            retired_remote_keys: VecDeque::new(),
            previous_sending_chain_length: 0,
            sending_ratchet_pending: pending,
            skipped: SkippedKeyCache::new(limits.max_skipped_message_keys),
            replay: ReplayWindow::new(limits.replay_window, limits.max_tracked_generations),
            associated_data,
            fingerprint,
            ratchet_steps: 0,
        })
    }

    /// Encrypts the next outgoing message.
    pub fn encrypt_next(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<RatchetMessage, Error> {
        let (message, staged) = self.stage_encrypt(plaintext, associated_data)?;
        self.commit(staged);
        Ok(message)
    }

    /// Decrypts an incoming message.
    pub fn decrypt_next(
        &mut self,
        message: &RatchetMessage,
        associated_data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let (plaintext, staged) = self.stage_decrypt(message, associated_data)?;
        self.commit(staged);
        Ok(plaintext)
    }

    pub(crate) fn stage_encrypt(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(RatchetMessage, StagedState), Error> {
        let provider = self.provider.as_ref();
        let state = self.state()?;
        let no_sending_chain = || Error::PrepareLocal("no sending chain".to_string());

        let needs_ratchet = state.sending_ratchet_pending
            || state
                .sending_chain
                .as_ref()
                .is_none_or(|chain| chain.needs_ratchet(self.limits.chain_ratchet_threshold));

        let (change, message_key, dh_public, previous_chain_length) = if needs_ratchet {
            let mut staged = Box::new(state.try_clone()?);
            staged.sending_ratchet(provider)?;
            let message_key = staged
                .sending_chain
                .as_mut()
                .ok_or_else(no_sending_chain)?
                .advance(provider)?;
            let dh_public = staged.dh_pair.public_key();
            let previous_chain_length = staged.previous_sending_chain_length;
            (Change::Replace(staged), message_key, dh_public, previous_chain_length)
        } else {
            let mut chain = state
                .sending_chain
                .as_ref()
                .ok_or_else(no_sending_chain)?
                .try_clone()?;
            let message_key = chain.advance(provider)?;
            (
                Change::Send(chain),
                message_key,
                state.dh_pair.public_key(),
                state.previous_sending_chain_length,
            )
        };

        let header = MessageHeader {
            dh_public,
            previous_chain_length,
            chain_index: message_key.index,
        };
        let aad = message_aad(&state.associated_data, associated_data, &header);
        let ciphertext = seal_message(&message_key.key, plaintext, &aad, provider)?;

        debug!(
            connection_id = self.connection_id,
            index = header.chain_index,
            ratcheted = needs_ratchet,
            "encrypted message"
        );

        Ok((
            RatchetMessage { header, ciphertext },
            StagedState {
                change,
                accepted: None,
            },
        ))
    }

    pub(crate) fn stage_decrypt(
        &self,
        message: &RatchetMessage,
        associated_data: &[u8],
    ) -> Result<(Vec<u8>, StagedState), Error> {
        let provider = self.provider.as_ref();
        let state = self.state()?;
        let header = &message.header;
        let index = header.chain_index;

        let target = state.resolve(&header.dh_public);
        if let Some(generation) = target.known_generation() {
            if state.replay.is_replay(generation, index) {
                debug!(
                    connection_id = self.connection_id,
                    generation,
                    index,
                    "rejected replayed message"
                );
                return Err(Error::ReplayDetected);
            }
        }

        let (message_key, generation, change) = match target {
            HeaderTarget::Current(generation) => {
                let (key, step) = state.stage_receive(index, &self.limits, provider)?;
                (key, generation, Change::Receive(step))
            }
            HeaderTarget::Adopt(generation) => {
                let (key, step) = state.stage_receive(index, &self.limits, provider)?;
                (key, generation, Change::Receive(step.adopting(header.dh_public)))
            }
            HeaderTarget::Previous(generation) => {
                let key = state
                    .skipped
                    .get(generation, index)
                    .ok_or(Error::ReplayDetected)?
                    .try_clone()?;
                let step = ReceiveStep::from_cache(generation, index);
                (key, step.generation(), Change::Receive(step))
            }
            HeaderTarget::Ratchet => {
                let mut staged = Box::new(state.try_clone()?);
                staged.receiving_ratchet(header, &self.limits, provider)?;
                let key = staged.receive_on_current(index, &self.limits, provider)?;
                (key, staged.receiving_generation, Change::Replace(staged))
            }
            HeaderTarget::Retired => {
                debug!(
                    connection_id = self.connection_id,
                    index,
                    "rejected message on a forgotten chain"
                );
                return Err(Error::ReplayDetected);
            }
            HeaderTarget::Unexpected => {
                return Err(Error::PeerPubKey(
                    "message uses a ratchet key with no receiving chain".to_string(),
                ));
            }
        };

        let aad = message_aad(&state.associated_data, associated_data, header);
        let plaintext = open_message(&message_key, &message.ciphertext, &aad, provider)?;

        let staged = StagedState {
            change,
            accepted: Some((generation, index)),
        };
        debug!(
            connection_id = self.connection_id,
            generation,
            index,
            ratcheted = staged.ratcheted(),
            "decrypted message"
        );
        Ok((plaintext, staged))
    }

    /// Applies staged changes to the live state.
    pub(crate) fn commit(&mut self, staged: StagedState) {
        let Phase::Established(state) = &mut self.phase else {
            return;
        };
        match staged.change {
            Change::Replace(replacement) => *state = replacement,
            Change::Send(chain) => state.sending_chain = Some(chain),
            Change::Receive(step) => step.apply(state),
        }
        if let Some((generation, index)) = staged.accepted {
            state.replay.accept(generation, index);
        }
    }

    /// Makes the next [`encrypt_next`](Self::encrypt_next) perform a DH ratchet.
    ///
    /// Only safe while the peer has no ratchet of its own in flight: if both
    /// sides ratchet concurrently their root chains diverge.
    pub fn force_ratchet(&mut self) -> Result<(), Error> {
        let connection_id = self.connection_id;
        let state = self.state_mut()?;
        if state.remote_dh_public.is_none() {
            return Err(Error::PrepareLocal(
                "remote ratchet key not yet known".to_string(),
            ));
        }
        state.sending_ratchet_pending = true;
        debug!(connection_id, "forced sending ratchet");
        Ok(())
    }

    /// Wipes the state. Every later operation fails with [`Error::ObjectDisposed`].
    pub fn close(&mut self) {
        if !self.is_closed() {
            debug!(connection_id = self.connection_id, "closed ratchet connection");
        }
        self.phase = Phase::Closed;
    }

    pub fn export_state(&self) -> Result<Zeroizing<ConnectionStateProto>, Error> {
        self.state()?.to_proto(self.connection_id)
    }

    /// Rebuilds an established connection from persisted state.
    pub fn from_state(
        proto: &ConnectionStateProto,
        limits: RatchetLimits,
        provider: SharedProvider,
    ) -> Result<Self, Error> {
        let state = ConnectionState::from_proto(proto, &limits, provider.as_ref())?;
        Ok(Self {
            connection_id: proto.connection_id,
            limits,
            provider,
            phase: Phase::Established(Box::new(state)),
        })
    }

    pub fn local_ratchet_public(&self) -> Result<X25519PublicKey, Error> {
        Ok(self.state()?.dh_pair.public_key())
    }

    pub fn remote_ratchet_public(&self) -> Result<Option<X25519PublicKey>, Error> {
        Ok(self.state()?.remote_dh_public)
    }

    pub fn receiving_generation(&self) -> Result<u32, Error> {
        Ok(self.state()?.receiving_generation)
    }

    /// Index of the next outgoing message, if a sending chain exists.
    pub fn sending_index(&self) -> Result<Option<u32>, Error> {
        Ok(self.state()?.sending_chain.as_ref().map(ChainStep::index))
    }

    /// Index of the next expected incoming message, if a receiving chain exists.
    pub fn receiving_index(&self) -> Result<Option<u32>, Error> {
        Ok(self.state()?.receiving_chain.as_ref().map(ChainStep::index))
    }

    pub fn skipped_key_count(&self) -> Result<usize, Error> {
        Ok(self.state()?.skipped.len())
    }

    /// Number of DH ratchet steps taken, sending and receiving.
    pub fn ratchet_steps(&self) -> Result<u64, Error> {
        Ok(self.state()?.ratchet_steps)
    }

    pub fn fingerprint(&self) -> Result<&str, Error> {
        Ok(self.state()?.fingerprint.as_str())
    }
}

impl fmt::Debug for RatchetConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            Phase::Uninitialized => "uninitialized",
            Phase::Established(_) => "established",
            Phase::Closed => "closed",
        };
        f.debug_struct("RatchetConnection")
            .field("connection_id", &self.connection_id)
            .field("phase", &phase)
            .finish_non_exhaustive()
    }
}

fn message_aad(session: &[u8], caller: &[u8], header: &MessageHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(session.len() + caller.len() + HEADER_LEN);
    aad.extend_from_slice(session);
    aad.extend_from_slice(caller);
    aad.extend_from_slice(&header.to_bytes());
    aad
}

/// AEAD key and nonce are both expanded from the single-use message key.
fn message_cipher_material(
    message_key: &SecureBuffer,
    provider: &dyn CryptoProvider,
) -> Result<(Zeroizing<[u8; AEAD_KEY_LEN]>, [u8; AEAD_NONCE_LEN]), Error> {
    let message_key = message_key.read_array::<32>()?;
    let mut derived = Zeroizing::new([0u8; AEAD_KEY_LEN + AEAD_NONCE_LEN]);
    provider.hkdf_sha256(None, message_key.as_slice(), MESSAGE_KEYS_INFO, derived.as_mut_slice())?;

    let mut key = Zeroizing::new([0u8; AEAD_KEY_LEN]);
    key.copy_from_slice(&derived[..AEAD_KEY_LEN]);
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce.copy_from_slice(&derived[AEAD_KEY_LEN..]);
    Ok((key, nonce))
}

fn seal_message(
    message_key: &SecureBuffer,
    plaintext: &[u8],
    aad: &[u8],
    provider: &dyn CryptoProvider,
) -> Result<Vec<u8>, Error> {
    let (key, nonce) = message_cipher_material(message_key, provider)?;
    provider.aead_seal(&key, &nonce, plaintext, aad)
}

fn open_message(
    message_key: &SecureBuffer,
    ciphertext: &[u8],
    aad: &[u8],
    provider: &dyn CryptoProvider,
) -> Result<Vec<u8>, Error> {
    let (key, nonce) = message_cipher_material(message_key, provider)?;
    provider.aead_open(&key, &nonce, ciphertext, aad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftwareCrypto;
    use std::sync::Arc;

    struct Pair {
        alice: RatchetConnection,
        bob: RatchetConnection,
    }

    fn provider() -> SharedProvider {
        Arc::new(SoftwareCrypto::new())
    }

    fn limits() -> RatchetLimits {
        RatchetLimits {
            max_skip: 50,
            max_skipped_message_keys: 100,
            replay_window: 64,
            max_tracked_generations: 4,
            chain_ratchet_threshold: 10_000,
        }
    }

    fn pair_with(limits: RatchetLimits, announce: bool) -> Pair {
        let provider = provider();
        let secret = [0x42u8; 32];
        let bob_spk = X25519KeyPair::generate(provider.as_ref()).unwrap();

        let mut alice = RatchetConnection::new(1, limits, provider.clone());
        alice
            .establish(SessionSeed {
                shared_secret: SecureBuffer::from_slice(&secret).unwrap(),
                is_initiator: true,
                remote_ratchet_key: Some(bob_spk.public_key()),
                local_ratchet_key: None,
                associated_data: b"alice|bob".to_vec(),
                fingerprint: "fp".to_string(),
            })
            .unwrap();

        let announced = alice.local_ratchet_public().unwrap();
        let mut bob = RatchetConnection::new(2, limits, provider);
        bob.establish(SessionSeed {
            shared_secret: SecureBuffer::from_slice(&secret).unwrap(),
            is_initiator: false,
            remote_ratchet_key: announce.then_some(announced),
            local_ratchet_key: Some(bob_spk),
            associated_data: b"alice|bob".to_vec(),
            fingerprint: "fp".to_string(),
        })
        .unwrap();

        Pair { alice, bob }
    }

    fn pair() -> Pair {
        pair_with(limits(), true)
    }

    #[test]
    fn test_alternating_conversation() {
        let Pair { mut alice, mut bob } = pair();

        for round in 0..5u8 {
            let m = alice.encrypt_next(&[round; 10], b"").unwrap();
            assert_eq!(bob.decrypt_next(&m, b"").unwrap(), vec![round; 10]);

            let r = bob.encrypt_next(&[round + 100; 3], b"").unwrap();
            assert_eq!(alice.decrypt_next(&r, b"").unwrap(), vec![round + 100; 3]);
        }

        assert_eq!(alice.receiving_generation().unwrap(), 5);
        assert_eq!(bob.receiving_generation().unwrap(), 4);
    }

    #[test]
    fn test_responder_can_send_first_with_announced_key() {
        let Pair { mut alice, mut bob } = pair();

        let m = bob.encrypt_next(b"hello first", b"").unwrap();
        assert_eq!(alice.decrypt_next(&m, b"").unwrap(), b"hello first");
    }

    #[test]
    fn test_responder_without_announced_key_learns_it() {
        let Pair { mut alice, mut bob } = pair_with(limits(), false);

        assert!(matches!(
            bob.encrypt_next(b"too early", b""),
            Err(Error::PrepareLocal(_))
        ));

        let m = alice.encrypt_next(b"hi", b"").unwrap();
        assert_eq!(bob.decrypt_next(&m, b"").unwrap(), b"hi");
        let r = bob.encrypt_next(b"hi back", b"").unwrap();
        assert_eq!(alice.decrypt_next(&r, b"").unwrap(), b"hi back");
    }

    #[test]
    fn test_replay_is_rejected_without_state_change() {
        let Pair { mut alice, mut bob } = pair();

        let m = alice.encrypt_next(b"once", b"").unwrap();
        bob.decrypt_next(&m, b"").unwrap();
        let before = bob.export_state().unwrap();

        assert_eq!(bob.decrypt_next(&m, b"").unwrap_err(), Error::ReplayDetected);
        assert_eq!(*bob.export_state().unwrap(), *before);
    }

    #[test]
    fn test_out_of_order_within_chain() {
        let Pair { mut alice, mut bob } = pair();

        let messages: Vec<_> = (0..5u8)
            .map(|i| alice.encrypt_next(&[i], b"").unwrap())
            .collect();

        assert_eq!(bob.decrypt_next(&messages[3], b"").unwrap(), vec![3]);
        assert_eq!(bob.skipped_key_count().unwrap(), 3);
        assert_eq!(bob.decrypt_next(&messages[0], b"").unwrap(), vec![0]);
        assert_eq!(bob.decrypt_next(&messages[4], b"").unwrap(), vec![4]);
        assert_eq!(bob.decrypt_next(&messages[2], b"").unwrap(), vec![2]);
        assert_eq!(bob.decrypt_next(&messages[1], b"").unwrap(), vec![1]);
        assert_eq!(bob.skipped_key_count().unwrap(), 0);
    }

    #[test]
    fn test_late_message_from_previous_chain() {
        let Pair { mut alice, mut bob } = pair();

        let early = alice.encrypt_next(b"early", b"").unwrap();
        let late = alice.encrypt_next(b"late", b"").unwrap();
        bob.decrypt_next(&early, b"").unwrap();

        let reply = bob.encrypt_next(b"reply", b"").unwrap();
        alice.decrypt_next(&reply, b"").unwrap();
        let next = alice.encrypt_next(b"next chain", b"").unwrap();
        assert_eq!(next.header.previous_chain_length, 2);

        assert_eq!(bob.decrypt_next(&next, b"").unwrap(), b"next chain");
        assert_eq!(bob.decrypt_next(&late, b"").unwrap(), b"late");
        assert_eq!(bob.decrypt_next(&late, b"").unwrap_err(), Error::ReplayDetected);
    }

    #[test]
    fn test_tampered_ciphertext_leaves_state_untouched() {
        let Pair { mut alice, mut bob } = pair();

        let reply = bob.encrypt_next(b"ratchet me", b"").unwrap();
        let mut forged = reply.clone();
        forged.ciphertext[0] ^= 0x80;
        let before = alice.export_state().unwrap();

        assert_eq!(alice.decrypt_next(&forged, b"").unwrap_err(), Error::Decrypt);
        assert_eq!(*alice.export_state().unwrap(), *before);
        assert_eq!(alice.decrypt_next(&reply, b"").unwrap(), b"ratchet me");
    }

    #[test]
    fn test_associated_data_must_match() {
        let Pair { mut alice, mut bob } = pair();

        let m = alice.encrypt_next(b"bound", b"channel-1").unwrap();
        assert_eq!(bob.decrypt_next(&m, b"channel-2").unwrap_err(), Error::Decrypt);
        assert_eq!(bob.decrypt_next(&m, b"channel-1").unwrap(), b"bound");
    }

    #[test]
    fn test_gap_beyond_max_skip_is_rejected() {
        let Pair { mut alice, mut bob } = pair();

        let mut last = None;
        for _ in 0..=limits().max_skip + 1 {
            last = Some(alice.encrypt_next(b"x", b"").unwrap());
        }
        let last = last.unwrap();

        assert!(matches!(
            bob.decrypt_next(&last, b""),
            Err(Error::TooManySkipped(_))
        ));
        assert_eq!(bob.skipped_key_count().unwrap(), 0);
    }

    #[test]
    fn test_forced_ratchet_changes_key_and_resets_index() {
        let Pair { mut alice, mut bob } = pair();

        let first = alice.encrypt_next(b"a", b"").unwrap();
        bob.decrypt_next(&first, b"").unwrap();

        alice.force_ratchet().unwrap();
        let forced = alice.encrypt_next(b"b", b"").unwrap();
        assert_ne!(forced.header.dh_public, first.header.dh_public);
        assert_eq!(forced.header.chain_index, 0);
        assert_eq!(forced.header.previous_chain_length, 1);

        assert_eq!(bob.decrypt_next(&forced, b"").unwrap(), b"b");
        assert_eq!(bob.receiving_generation().unwrap(), 1);
    }

    #[test]
    fn test_threshold_forces_ratchet() {
        let mut limits = limits();
        limits.chain_ratchet_threshold = 3;
        let Pair { mut alice, mut bob } = pair_with(limits, true);

        let messages: Vec<_> = (0..4u8)
            .map(|i| alice.encrypt_next(&[i], b"").unwrap())
            .collect();
        assert_eq!(messages[3].header.chain_index, 0);
        assert_ne!(messages[3].header.dh_public, messages[2].header.dh_public);

        for (i, message) in messages.iter().enumerate() {
            assert_eq!(bob.decrypt_next(message, b"").unwrap(), vec![i as u8]);
        }
    }

    #[test]
    fn test_export_and_restore_mid_conversation() {
        let Pair { mut alice, mut bob } = pair();

        for _ in 0..3 {
            let m = alice.encrypt_next(b"ping", b"").unwrap();
            bob.decrypt_next(&m, b"").unwrap();
            let r = bob.encrypt_next(b"pong", b"").unwrap();
            alice.decrypt_next(&r, b"").unwrap();
        }
        let pending = alice.encrypt_next(b"in flight", b"").unwrap();

        let exported = bob.export_state().unwrap();
        let mut restored = RatchetConnection::from_state(&exported, limits(), provider()).unwrap();
        assert_eq!(*restored.export_state().unwrap(), *exported);
        assert_eq!(restored.decrypt_next(&pending, b"").unwrap(), b"in flight");
    }

    #[test]
    fn test_replay_from_forgotten_chain_is_detected() {
        let mut limits = limits();
        limits.max_tracked_generations = 2;
        let Pair { mut alice, mut bob } = pair_with(limits, true);

        let first = alice.encrypt_next(b"first", b"").unwrap();
        bob.decrypt_next(&first, b"").unwrap();
        for _ in 0..6 {
            let r = bob.encrypt_next(b"pong", b"").unwrap();
            alice.decrypt_next(&r, b"").unwrap();
            let m = alice.encrypt_next(b"ping", b"").unwrap();
            bob.decrypt_next(&m, b"").unwrap();
        }
        let steps = bob.ratchet_steps().unwrap();
        let before = bob.export_state().unwrap();

        assert_eq!(bob.decrypt_next(&first, b"").unwrap_err(), Error::ReplayDetected);
        assert_eq!(bob.ratchet_steps().unwrap(), steps);
        assert_eq!(*bob.export_state().unwrap(), *before);

        let mut restored = RatchetConnection::from_state(&before, limits, provider()).unwrap();
        assert_eq!(restored.decrypt_next(&first, b"").unwrap_err(), Error::ReplayDetected);
    }

    #[test]
    fn test_plain_messages_stage_only_chain_changes() {
        let Pair { mut alice, mut bob } = pair();

        let (message, staged) = alice.stage_encrypt(b"plain", b"").unwrap();
        assert!(!staged.ratcheted());
        assert!(staged.ratchet_state(1).unwrap().is_none());
        assert_eq!(alice.sending_index().unwrap(), Some(0));
        alice.commit(staged);
        assert_eq!(alice.sending_index().unwrap(), Some(1));

        let (_, staged) = bob.stage_decrypt(&message, b"").unwrap();
        assert!(!staged.ratcheted());
        assert_eq!(bob.receiving_index().unwrap(), Some(0));
        bob.commit(staged);
        assert_eq!(bob.receiving_index().unwrap(), Some(1));
        assert_eq!(bob.decrypt_next(&message, b"").unwrap_err(), Error::ReplayDetected);

        let (reply, staged) = bob.stage_encrypt(b"ratchet", b"").unwrap();
        assert!(staged.ratcheted());
        let saved = staged.ratchet_state(2).unwrap().unwrap();
        assert_eq!(saved.dh_public, reply.header.dh_public.to_bytes().to_vec());
        bob.commit(staged);
        assert_eq!(*bob.export_state().unwrap(), *saved);
    }

    #[test]
    fn test_closed_connection_refuses_work() {
        let Pair { mut alice, .. } = pair();
        alice.close();

        assert_eq!(
            alice.encrypt_next(b"x", b"").unwrap_err(),
            Error::ObjectDisposed("RatchetConnection")
        );
        assert!(alice.export_state().is_err());
        assert!(alice.force_ratchet().is_err());
    }

    #[test]
    fn test_uninitialized_connection_refuses_work() {
        let mut connection = RatchetConnection::new(9, limits(), provider());
        assert!(matches!(
            connection.encrypt_next(b"x", b""),
            Err(Error::PrepareLocal(_))
        ));
    }
}
