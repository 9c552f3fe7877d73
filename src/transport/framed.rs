//! Default framed TCP transport.
//!
//! Frames are length-prefixed: `[len:4 BE][code:1][payload]`, where `len`
//! covers the code byte and payload. The connection starts with a
//! three-message identity handshake (challenge-response over schnorr
//! signatures), followed by the hello exchange. Payloads are not
//! encrypted; deployments that need a confidential wire install their own
//! [`Transport`] through the server's transport factory.

use super::{
    Msg, SocketStream, Transport, TransportError, DISCONNECT_WRITE_TIMEOUT, FRAME_READ_TIMEOUT,
    FRAME_WRITE_TIMEOUT, MAX_FRAME_SIZE, MSG_DISCONNECT, MSG_HELLO,
};
use crate::discovery::NodeRecord;
use crate::identity::{Identity, NodeId};
use crate::protocol::{DisconnectReason, ProtoHandshake};
use async_trait::async_trait;
use secp256k1::{schnorr::Signature, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

/// Domain separation string for handshake challenge digests.
const AUTH_DOMAIN: &[u8] = b"wharf-auth-v1";

// Identity handshake frame codes, outside the message code space.
const AUTH_INIT: u8 = 0xf0;
const AUTH_ACK: u8 = 0xf1;
const AUTH_CONFIRM: u8 = 0xf2;

const PUBKEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 32;
const SIG_SIZE: usize = 64;

/// Payload sizes for the three handshake frames.
const AUTH_INIT_SIZE: usize = PUBKEY_SIZE + NONCE_SIZE;
const AUTH_ACK_SIZE: usize = PUBKEY_SIZE + NONCE_SIZE + SIG_SIZE;
const AUTH_CONFIRM_SIZE: usize = SIG_SIZE;

/// Framed transport over any byte stream.
pub struct FramedTransport {
    stream: Box<dyn SocketStream>,
}

impl FramedTransport {
    pub fn new(stream: Box<dyn SocketStream>) -> Self {
        Self { stream }
    }

    async fn write_frame(&mut self, code: u8, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let write = async {
            self.stream.write_all(&len.to_be_bytes()).await?;
            self.stream.write_all(&[code]).await?;
            self.stream.write_all(payload).await?;
            self.stream.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        match timeout(FRAME_WRITE_TIMEOUT, write).await {
            Ok(result) => result.map_err(TransportError::Io),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }

    async fn read_frame(&mut self) -> Result<(u8, Vec<u8>), TransportError> {
        let read = async {
            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 {
                return Err(TransportError::InvalidFrame("zero-length frame"));
            }
            if len - 1 > MAX_FRAME_SIZE {
                return Err(TransportError::FrameTooLarge {
                    size: len - 1,
                    max: MAX_FRAME_SIZE,
                });
            }
            let mut code = [0u8; 1];
            self.stream.read_exact(&mut code).await?;
            let mut payload = vec![0u8; len - 1];
            self.stream.read_exact(&mut payload).await?;
            Ok((code[0], payload))
        };
        match timeout(FRAME_READ_TIMEOUT, read).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ReadTimeout),
        }
    }

    /// Read a handshake frame, checking code and exact payload size.
    async fn read_auth_frame(
        &mut self,
        expected_code: u8,
        expected_size: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let (code, payload) = self.read_frame().await?;
        if code == MSG_DISCONNECT {
            let msg = Msg::new(code, payload);
            return Err(TransportError::RemoteDisconnected(msg.disconnect_reason()));
        }
        if code != expected_code {
            return Err(TransportError::UnexpectedMessage {
                expected: expected_code,
                got: code,
            });
        }
        if payload.len() != expected_size {
            return Err(TransportError::MalformedHandshake(format!(
                "auth frame 0x{:02x}: expected {} bytes, got {}",
                code,
                expected_size,
                payload.len()
            )));
        }
        Ok(payload)
    }
}

/// Digest signed to prove possession of a key: the signer binds the
/// challenger's nonce to its own public key.
fn auth_digest(nonce: &[u8; NONCE_SIZE], signer_pubkey: &XOnlyPublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(AUTH_DOMAIN);
    hasher.update(nonce);
    hasher.update(signer_pubkey.serialize());
    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result);
    digest
}

fn parse_pubkey(bytes: &[u8]) -> Result<XOnlyPublicKey, TransportError> {
    XOnlyPublicKey::from_slice(bytes)
        .map_err(|_| TransportError::MalformedHandshake("invalid public key".to_string()))
}

fn parse_signature(bytes: &[u8]) -> Result<Signature, TransportError> {
    Signature::from_slice(bytes)
        .map_err(|_| TransportError::MalformedHandshake("invalid signature".to_string()))
}

fn verify_auth(
    nonce: &[u8; NONCE_SIZE],
    signer_pubkey: &XOnlyPublicKey,
    sig: &Signature,
) -> Result<(), TransportError> {
    let digest = auth_digest(nonce, signer_pubkey);
    let secp = Secp256k1::new();
    secp.verify_schnorr(sig, &digest, signer_pubkey)
        .map_err(|_| TransportError::SignatureVerificationFailed)
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);
    nonce
}

#[async_trait]
impl Transport for FramedTransport {
    async fn do_enc_handshake(
        &mut self,
        identity: &Identity,
        dial_dest: Option<&NodeRecord>,
    ) -> Result<NodeId, TransportError> {
        let our_pubkey = identity.pubkey();

        let remote_pubkey = if dial_dest.is_some() {
            // Initiator: challenge, verify their response, answer their
            // challenge.
            let our_nonce = random_nonce();
            let mut init = Vec::with_capacity(AUTH_INIT_SIZE);
            init.extend_from_slice(&our_pubkey.serialize());
            init.extend_from_slice(&our_nonce);
            self.write_frame(AUTH_INIT, &init).await?;

            let ack = self.read_auth_frame(AUTH_ACK, AUTH_ACK_SIZE).await?;
            let remote_pubkey = parse_pubkey(&ack[..PUBKEY_SIZE])?;
            let mut their_nonce = [0u8; NONCE_SIZE];
            their_nonce.copy_from_slice(&ack[PUBKEY_SIZE..PUBKEY_SIZE + NONCE_SIZE]);
            let sig = parse_signature(&ack[PUBKEY_SIZE + NONCE_SIZE..])?;
            verify_auth(&our_nonce, &remote_pubkey, &sig)?;

            let our_sig = identity.sign_digest(&auth_digest(&their_nonce, &our_pubkey));
            self.write_frame(AUTH_CONFIRM, our_sig.as_ref()).await?;
            remote_pubkey
        } else {
            // Responder: answer their challenge, then verify ours.
            let init = self.read_auth_frame(AUTH_INIT, AUTH_INIT_SIZE).await?;
            let remote_pubkey = parse_pubkey(&init[..PUBKEY_SIZE])?;
            let mut their_nonce = [0u8; NONCE_SIZE];
            their_nonce.copy_from_slice(&init[PUBKEY_SIZE..]);

            let our_nonce = random_nonce();
            let our_sig = identity.sign_digest(&auth_digest(&their_nonce, &our_pubkey));
            let mut ack = Vec::with_capacity(AUTH_ACK_SIZE);
            ack.extend_from_slice(&our_pubkey.serialize());
            ack.extend_from_slice(&our_nonce);
            ack.extend_from_slice(our_sig.as_ref());
            self.write_frame(AUTH_ACK, &ack).await?;

            let confirm = self.read_auth_frame(AUTH_CONFIRM, AUTH_CONFIRM_SIZE).await?;
            let sig = parse_signature(&confirm)?;
            verify_auth(&our_nonce, &remote_pubkey, &sig)?;
            remote_pubkey
        };

        let remote_id = NodeId::from_pubkey(&remote_pubkey);
        trace!(remote = %remote_id.short(), "identity handshake complete");
        Ok(remote_id)
    }

    async fn do_proto_handshake(
        &mut self,
        our: &ProtoHandshake,
    ) -> Result<ProtoHandshake, TransportError> {
        self.write_frame(MSG_HELLO, &our.encode()).await?;

        let (code, payload) = self.read_frame().await?;
        if code == MSG_DISCONNECT {
            let msg = Msg::new(code, payload);
            return Err(TransportError::RemoteDisconnected(msg.disconnect_reason()));
        }
        if code != MSG_HELLO {
            return Err(TransportError::UnexpectedMessage {
                expected: MSG_HELLO,
                got: code,
            });
        }
        Ok(ProtoHandshake::decode(&payload)?)
    }

    async fn read_msg(&mut self) -> Result<Msg, TransportError> {
        let (code, payload) = self.read_frame().await?;
        Ok(Msg::new(code, payload))
    }

    async fn write_msg(&mut self, msg: Msg) -> Result<(), TransportError> {
        self.write_frame(msg.code, &msg.payload).await
    }

    async fn close(&mut self, reason: Option<DisconnectReason>) {
        if let Some(reason) = reason {
            // Best effort: the remote may already be gone.
            let msg = Msg::disconnect(reason);
            let _ = timeout(DISCONNECT_WRITE_TIMEOUT, async {
                let len = (msg.payload.len() + 1) as u32;
                self.stream.write_all(&len.to_be_bytes()).await?;
                self.stream.write_all(&[msg.code]).await?;
                self.stream.write_all(&msg.payload).await?;
                self.stream.flush().await
            })
            .await;
        }
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Cap, BASE_PROTOCOL_VERSION};
    use tokio::io::duplex;

    fn pair() -> (FramedTransport, FramedTransport) {
        let (a, b) = duplex(64 * 1024);
        (
            FramedTransport::new(Box::new(a)),
            FramedTransport::new(Box::new(b)),
        )
    }

    fn hello_for(identity: &Identity, caps: Vec<Cap>) -> ProtoHandshake {
        ProtoHandshake {
            version: BASE_PROTOCOL_VERSION,
            name: "wharf-test".to_string(),
            caps,
            id: *identity.node_id(),
        }
    }

    fn dest_for(identity: &Identity) -> NodeRecord {
        NodeRecord::new(*identity.node_id(), "127.0.0.1".parse().unwrap(), 0)
    }

    #[tokio::test]
    async fn test_enc_handshake_learns_identities() {
        let dialer_id = Identity::generate();
        let listener_id = Identity::generate();
        let (mut dialer, mut listener) = pair();

        let dest = dest_for(&listener_id);
        let listener_identity = listener_id.clone();
        let responder = tokio::spawn(async move {
            listener.do_enc_handshake(&listener_identity, None).await
        });

        let learned_by_dialer = dialer
            .do_enc_handshake(&dialer_id, Some(&dest))
            .await
            .unwrap();
        let learned_by_listener = responder.await.unwrap().unwrap();

        assert_eq!(learned_by_dialer, *listener_id.node_id());
        assert_eq!(learned_by_listener, *dialer_id.node_id());
    }

    #[tokio::test]
    async fn test_proto_handshake_exchange() {
        let dialer_id = Identity::generate();
        let listener_id = Identity::generate();
        let (mut dialer, mut listener) = pair();

        let our = hello_for(&dialer_id, vec![Cap::new("ledger", 1)]);
        let theirs = hello_for(&listener_id, vec![Cap::new("ledger", 1), Cap::new("sync", 2)]);

        let theirs_clone = theirs.clone();
        let side = tokio::spawn(async move {
            listener.do_proto_handshake(&theirs_clone).await
        });

        let got = dialer.do_proto_handshake(&our).await.unwrap();
        assert_eq!(got, theirs);
        let got_by_listener = side.await.unwrap().unwrap();
        assert_eq!(got_by_listener, our);
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut a, mut b) = pair();

        a.write_msg(Msg::new(0x10, b"block data".to_vec()))
            .await
            .unwrap();
        let msg = b.read_msg().await.unwrap();
        assert_eq!(msg.code, 0x10);
        assert_eq!(msg.payload, b"block data");
    }

    #[tokio::test]
    async fn test_close_sends_reason() {
        let (mut a, mut b) = pair();

        a.close(Some(DisconnectReason::TooManyPeers)).await;

        let msg = b.read_msg().await.unwrap();
        assert_eq!(msg.code, MSG_DISCONNECT);
        assert_eq!(msg.disconnect_reason(), DisconnectReason::TooManyPeers);
    }

    #[tokio::test]
    async fn test_oversize_write_rejected() {
        let (mut a, _b) = pair();
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        let result = a.write_msg(Msg::new(0x10, huge)).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversize_frame_header_rejected() {
        let (a, b) = duplex(1024);
        let mut transport = FramedTransport::new(Box::new(a));
        let mut raw = b;

        // Claim a frame far beyond the limit.
        let len = (MAX_FRAME_SIZE as u32) + 100;
        raw.write_all(&len.to_be_bytes()).await.unwrap();

        let result = transport.read_msg().await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_bad_ack_signature_rejected() {
        let dialer_id = Identity::generate();
        let honest = Identity::generate();
        let forger = Identity::generate();

        let (a, b) = duplex(4096);
        let mut dialer = FramedTransport::new(Box::new(a));
        // A hand-rolled responder claiming `honest`'s key but signing with
        // `forger`'s.
        let mut raw = FramedTransport::new(Box::new(b));

        let dest = dest_for(&honest);
        let side = tokio::spawn(async move {
            let init = raw.read_auth_frame(AUTH_INIT, AUTH_INIT_SIZE).await.unwrap();
            let mut their_nonce = [0u8; NONCE_SIZE];
            their_nonce.copy_from_slice(&init[PUBKEY_SIZE..]);

            let claimed_pubkey = honest.pubkey();
            let sig = forger.sign_digest(&auth_digest(&their_nonce, &claimed_pubkey));
            let mut ack = Vec::with_capacity(AUTH_ACK_SIZE);
            ack.extend_from_slice(&claimed_pubkey.serialize());
            ack.extend_from_slice(&random_nonce());
            ack.extend_from_slice(sig.as_ref());
            raw.write_frame(AUTH_ACK, &ack).await.unwrap();
        });

        let result = dialer.do_enc_handshake(&dialer_id, Some(&dest)).await;
        assert!(matches!(
            result,
            Err(TransportError::SignatureVerificationFailed)
        ));
        side.await.unwrap();
    }
}
