//! Established secure session between two nodes.

use byteorder::{LittleEndian, WriteBytesExt};
use tokio_util::sync::CancellationToken;

use crate::{messages, util::cryptoutil};
use anyhow::Result;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};

/// Session keys and identifiers as produced by session establishment.
///
/// Messages are AES-128-CCM protected when keys are present, plaintext otherwise.
/// The revocation token is observed by the exchange layer, which force-closes all
/// exchanges of a revoked session.
pub struct Session {
    /// Session id the peer expects on messages we send.
    pub session_id: u16,
    /// Session id we expect on received messages.
    pub my_session_id: u16,
    counter: AtomicU32,
    pub local_node: Option<Vec<u8>>,
    pub remote_node: Option<Vec<u8>>,
    pub encrypt_key: Option<cryptoutil::SessionKey>,
    pub decrypt_key: Option<cryptoutil::SessionKey>,
    revoked: CancellationToken,
}

impl Session {
    pub fn new(my_session_id: u16, peer_session_id: u16) -> Self {
        Self {
            session_id: peer_session_id,
            my_session_id,
            counter: AtomicU32::new(rand::random::<u32>() >> 4),
            local_node: Some([0, 0, 0, 0, 0, 0, 0, 0].to_vec()),
            remote_node: None,
            encrypt_key: None,
            decrypt_key: None,
            revoked: CancellationToken::new(),
        }
    }
    pub fn set_encrypt_key(&mut self, k: &[u8]) -> Result<()> {
        self.encrypt_key = Some(cryptoutil::session_key(k)?);
        Ok(())
    }
    pub fn set_decrypt_key(&mut self, k: &[u8]) -> Result<()> {
        self.decrypt_key = Some(cryptoutil::session_key(k)?);
        Ok(())
    }
    pub fn set_nodes(&mut self, local: u64, remote: u64) {
        self.local_node = Some(local.to_le_bytes().to_vec());
        self.remote_node = Some(remote.to_le_bytes().to_vec());
    }

    /// Token cancelled when the session is revoked or closed.
    pub fn revocation(&self) -> CancellationToken {
        self.revoked.clone()
    }
    pub fn revoke(&self) {
        self.revoked.cancel()
    }
    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }

    /// Wraps protocol header and payload into a complete datagram.
    /// Returns the message counter used.
    pub fn encode_message(&self, data: &[u8]) -> Result<(u32, Vec<u8>)> {
        if self.is_revoked() {
            anyhow::bail!("session {} revoked", self.my_session_id);
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mg = messages::MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: self.session_id,
            message_counter: counter,
            source_node_id: self.local_node.clone(),
            destination_node_id: self.remote_node.clone(),
        };
        let mut b = mg.encode()?;
        match self.encrypt_key {
            Some(key) => {
                let nonce = self.make_nonce3(counter)?;
                let enc = cryptoutil::aes128_ccm_encrypt(&key, &nonce, &b, data)?;
                b.extend_from_slice(&enc);
            }
            None => b.extend_from_slice(data),
        };
        Ok((counter, b))
    }

    /// Verifies the session id and decrypts. Output is the plaintext datagram.
    pub fn decode_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let (header, rest) = messages::MessageHeader::decode(data)?;
        if header.session_id != self.my_session_id {
            anyhow::bail!(
                "session id mismatch. expected:{} got:{}",
                self.my_session_id,
                header.session_id
            );
        }
        let Some(key) = self.decrypt_key else {
            return Ok(data.to_vec());
        };
        log::trace!("decode msg header:{:?} session:{}", header, self.session_id);
        let nonce = Self::make_nonce3_extern(header.message_counter, header.source_node_id.as_deref().or(self.remote_node.as_deref()))?;
        let add = &data[..data.len() - rest.len()];
        let decoded = cryptoutil::aes128_ccm_decrypt(&key, &nonce, add, &rest)?;
        let mut out = Vec::with_capacity(add.len() + decoded.len());
        out.extend_from_slice(add);
        out.extend_from_slice(&decoded);
        Ok(out)
    }

    fn make_nonce3(&self, counter: u32) -> Result<Vec<u8>> {
        Self::make_nonce3_extern(counter, self.local_node.as_deref())
    }

    fn make_nonce3_extern(counter: u32, node: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(13);
        out.write_u8(0)?;
        out.write_u32::<LittleEndian>(counter)?;
        match node {
            Some(s) => out.write_all(s)?,
            None => out.write_all(&[0, 0, 0, 0, 0, 0, 0, 0])?,
        };
        Ok(out)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("my_session_id", &self.my_session_id)
            .field("secured", &self.encrypt_key.is_some())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
