use aes::cipher::crypto_common;
use anyhow::Result;

pub type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;
pub type SessionKey = crypto_common::Key<Aes128Ccm>;

pub fn aes128_ccm_encrypt(key: &SessionKey, nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    match ccm::aead::Aead::encrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(anyhow::anyhow!("encrypt error {:?}", e)),
    }
}

pub fn aes128_ccm_decrypt(key: &SessionKey, nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    match ccm::aead::Aead::decrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(anyhow::anyhow!(format!("decrypt error {:?}", e))),
    }
}

/// Builds a session key, rejecting anything but 16 bytes.
pub fn session_key(k: &[u8]) -> Result<SessionKey> {
    if k.len() != 16 {
        anyhow::bail!("session key must be 16 bytes, got {}", k.len());
    }
    Ok(*SessionKey::from_slice(k))
}

#[cfg(test)]
mod tests {
    #[test]
    fn ccm_tamper_detected() {
        let key = super::session_key(&[7u8; 16]).unwrap();
        let nonce = [1u8; 13];
        let mut enc = super::aes128_ccm_encrypt(&key, &nonce, b"hdr", b"payload").unwrap();
        assert_eq!(enc.len(), 7 + 16);
        assert_eq!(super::aes128_ccm_decrypt(&key, &nonce, b"hdr", &enc).unwrap(), b"payload");
        enc[0] ^= 1;
        assert!(super::aes128_ccm_decrypt(&key, &nonce, b"hdr", &enc).is_err());
        assert!(super::session_key(&[0u8; 15]).is_err());
    }
}
