//! Cryptographic primitives for the secure channel protocols
//!
//! This module provides the operations shared by the SCP01/02 (DES3) and
//! SCP03 (AES) engines: the retail MAC, ICV encryption, CBC/ECB block
//! encryption, AES-CMAC and the SP 800-108 counter-mode KDF.

use aes::{Aes128, Aes192, Aes256};
use cbc_mac::{CbcMac, Mac};
use cipher::{BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit, generic_array::GenericArray};
use cmac::Cmac;
use des::{Des, TdesEde3};

use crate::keys::KeyCipher;
use crate::{Error, Result};

/// Key derivation purpose constant for SCP02 session keys
pub type DerivationPurpose = [u8; 2];

/// SCP02 derivation purpose for the session ENC key
pub const DERIVATION_PURPOSE_ENC: DerivationPurpose = [0x01, 0x82];
/// SCP02 derivation purpose for the session MAC key
pub const DERIVATION_PURPOSE_MAC: DerivationPurpose = [0x01, 0x01];
/// SCP02 derivation purpose for the session KEK
pub const DERIVATION_PURPOSE_KEK: DerivationPurpose = [0x01, 0x81];
/// SCP02 derivation purpose for the session RMAC key
pub const DERIVATION_PURPOSE_RMAC: DerivationPurpose = [0x01, 0x02];

/// SCP03 KDF derivation constant for the card cryptogram
pub const KDF_CARD_CRYPTOGRAM: u8 = 0x00;
/// SCP03 KDF derivation constant for the host cryptogram
pub const KDF_HOST_CRYPTOGRAM: u8 = 0x01;
/// SCP03 KDF derivation constant for the session ENC key
pub const KDF_ENC: u8 = 0x04;
/// SCP03 KDF derivation constant for the session MAC key
pub const KDF_MAC: u8 = 0x06;
/// SCP03 KDF derivation constant for the session RMAC key
pub const KDF_RMAC: u8 = 0x07;

/// Pad data to the cipher block size with ISO 7816 padding
///
/// Always appends at least one byte: 0x80 followed by zero bytes.
pub fn iso7816_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut padded = Vec::with_capacity(data.len() + block_size);
    padded.extend_from_slice(data);
    padded.push(0x80);
    while padded.len() % block_size != 0 {
        padded.push(0x00);
    }
    padded
}

/// Expand a 16-byte two-key 3DES secret to 24 bytes (K1 K2 K1)
pub(crate) fn resize_des3_key(secret: &[u8]) -> Result<[u8; 24]> {
    let mut key = [0u8; 24];
    match secret.len() {
        16 => {
            key[..16].copy_from_slice(secret);
            key[16..].copy_from_slice(&secret[..8]);
        }
        24 => key.copy_from_slice(secret),
        _ => {
            return Err(Error::BadKeyLength {
                cipher: KeyCipher::Des3,
                actual: secret.len(),
            });
        }
    }
    Ok(key)
}

/// Encrypt a single block with single DES
pub(crate) fn des_encrypt_block(secret: &[u8], block: &mut [u8; 8]) -> Result<()> {
    let cipher = Des::new_from_slice(secret).map_err(|_| Error::Crypto("bad DES key length"))?;
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
    Ok(())
}

/// Encrypt data in place with 3DES in ECB mode
pub(crate) fn des3_encrypt_ecb(secret: &[u8], data: &mut [u8]) -> Result<()> {
    let key = resize_des3_key(secret)?;
    let cipher =
        TdesEde3::new_from_slice(&key).map_err(|_| Error::Crypto("bad 3DES key length"))?;
    for chunk in data.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(())
}

/// Encrypt data in place with 3DES in CBC mode
pub(crate) fn des3_encrypt_cbc(secret: &[u8], iv: &[u8; 8], data: &mut [u8]) -> Result<()> {
    let key = resize_des3_key(secret)?;
    let mut encryptor = cbc::Encryptor::<TdesEde3>::new_from_slices(&key, iv)
        .map_err(|_| Error::Crypto("bad 3DES key or IV length"))?;
    for chunk in data.chunks_exact_mut(8) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
    Ok(())
}

/// Encrypt a single block with AES in ECB mode
pub(crate) fn aes_encrypt_block(secret: &[u8], block: &mut [u8; 16]) -> Result<()> {
    let block = GenericArray::from_mut_slice(block);
    match secret.len() {
        16 => Aes128::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .encrypt_block(block),
        24 => Aes192::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .encrypt_block(block),
        32 => Aes256::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .encrypt_block(block),
        _ => return Err(Error::Crypto("bad AES key length")),
    }
    Ok(())
}

/// Encrypt data in place with AES in CBC mode
pub(crate) fn aes_encrypt_cbc(secret: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    fn run<C: cipher::BlockCipher + cipher::BlockEncrypt + KeyInit>(
        secret: &[u8],
        iv: &[u8],
        data: &mut [u8],
    ) -> Result<()> {
        let mut encryptor = cbc::Encryptor::<C>::new_from_slices(secret, iv)
            .map_err(|_| Error::Crypto("bad AES key or IV length"))?;
        for chunk in data.chunks_exact_mut(16) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }

    match secret.len() {
        16 => run::<Aes128>(secret, iv, data),
        24 => run::<Aes192>(secret, iv, data),
        32 => run::<Aes256>(secret, iv, data),
        _ => Err(Error::Crypto("bad AES key length")),
    }
}

/// Calculate a full 3DES retail MAC for SCP02
///
/// Single DES over all blocks except the last, which uses 3DES. The data
/// is ISO 7816 padded before chaining.
pub fn mac_full_3des(secret: &[u8], iv: &[u8; 8], data: &[u8]) -> Result<[u8; 8]> {
    let padded = iso7816_pad(data, 8);
    let split = padded.len() - 8;

    let mut chain = *iv;
    for chunk in padded[..split].chunks_exact(8) {
        let mut block = [0u8; 8];
        for (b, (d, c)) in block.iter_mut().zip(chunk.iter().zip(chain.iter())) {
            *b = d ^ c;
        }
        des_encrypt_block(&secret[..8], &mut block)?;
        chain = block;
    }

    let mut last = [0u8; 8];
    for (b, (d, c)) in last.iter_mut().zip(padded[split..].iter().zip(chain.iter())) {
        *b = d ^ c;
    }
    des3_encrypt_ecb(secret, &mut last)?;
    Ok(last)
}

/// Calculate a full 3DES CBC-MAC, used by SCP01
pub fn mac_des3(secret: &[u8], iv: &[u8; 8], data: &[u8]) -> Result<[u8; 8]> {
    let mut padded = iso7816_pad(data, 8);
    des3_encrypt_cbc(secret, iv, &mut padded)?;
    let mut mac = [0u8; 8];
    mac.copy_from_slice(&padded[padded.len() - 8..]);
    Ok(mac)
}

/// Encrypt an ICV under the single-DES half of the MAC key
///
/// SCP02 variants with ICV encryption pass the previous command's MAC
/// through this before chaining the next MAC from it.
pub fn encrypt_icv(mac_secret: &[u8], icv: &[u8; 8]) -> Result<[u8; 8]> {
    let mut mac = <CbcMac<Des> as Mac>::new_from_slice(&mac_secret[..8])
        .map_err(|_| Error::Crypto("bad DES key length"))?;
    mac.update(icv);
    Ok(mac.finalize().into_bytes().into())
}

/// Calculate an AES-CMAC over the data, dispatching on key length
pub fn aes_cmac(secret: &[u8], data: &[u8]) -> Result<[u8; 16]> {
    let tag = match secret.len() {
        16 => <Cmac<Aes128> as Mac>::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .chain_update(data)
            .finalize()
            .into_bytes(),
        24 => <Cmac<Aes192> as Mac>::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .chain_update(data)
            .finalize()
            .into_bytes(),
        32 => <Cmac<Aes256> as Mac>::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .chain_update(data)
            .finalize()
            .into_bytes(),
        _ => return Err(Error::Crypto("bad AES key length")),
    };
    Ok(tag.into())
}

/// Verify a truncated AES-CMAC tag in constant time
pub(crate) fn aes_cmac_verify(secret: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let verified = match secret.len() {
        16 => <Cmac<Aes128> as Mac>::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .chain_update(data)
            .verify_truncated_left(tag)
            .is_ok(),
        24 => <Cmac<Aes192> as Mac>::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .chain_update(data)
            .verify_truncated_left(tag)
            .is_ok(),
        32 => <Cmac<Aes256> as Mac>::new_from_slice(secret)
            .map_err(|_| Error::Crypto("bad AES key length"))?
            .chain_update(data)
            .verify_truncated_left(tag)
            .is_ok(),
        _ => return Err(Error::Crypto("bad AES key length")),
    };
    Ok(verified)
}

/// SP 800-108 counter-mode KDF with AES-CMAC as the PRF, as used by SCP03
///
/// Per output block i: CMAC(key, 11 zero bytes ‖ constant ‖ 0x00 ‖
/// output length in bits (2 bytes) ‖ i ‖ context).
pub fn scp03_kdf(secret: &[u8], constant: u8, context: &[u8], out_bits: u16) -> Result<Vec<u8>> {
    let out_len = (out_bits as usize).div_ceil(8);
    let blocks = out_len.div_ceil(16);

    let mut out = Vec::with_capacity(blocks * 16);
    for i in 1..=blocks as u8 {
        let mut message = Vec::with_capacity(16 + context.len());
        message.extend_from_slice(&[0u8; 11]);
        message.push(constant);
        message.push(0x00);
        message.extend_from_slice(&out_bits.to_be_bytes());
        message.push(i);
        message.extend_from_slice(context);
        out.extend_from_slice(&aes_cmac(secret, &message)?);
    }
    out.truncate(out_len);
    Ok(out)
}

/// Calculate an SCP02 authentication cryptogram
///
/// The card cryptogram chains host challenge ‖ sequence counter ‖ card
/// challenge; the host cryptogram chains sequence counter ‖ card
/// challenge ‖ host challenge. Both are the last 3DES-CBC block over the
/// padded data under the session ENC key.
pub fn scp02_cryptogram(
    enc_secret: &[u8],
    sequence_counter: &[u8; 2],
    card_challenge: &[u8; 6],
    host_challenge: &[u8; 8],
    for_host: bool,
) -> Result<[u8; 8]> {
    let mut data = Vec::with_capacity(24);
    if for_host {
        data.extend_from_slice(sequence_counter);
        data.extend_from_slice(card_challenge);
        data.extend_from_slice(host_challenge);
    } else {
        data.extend_from_slice(host_challenge);
        data.extend_from_slice(sequence_counter);
        data.extend_from_slice(card_challenge);
    }

    let mut padded = iso7816_pad(&data, 8);
    des3_encrypt_cbc(enc_secret, &[0u8; 8], &mut padded)?;
    let mut cryptogram = [0u8; 8];
    cryptogram.copy_from_slice(&padded[padded.len() - 8..]);
    Ok(cryptogram)
}

/// Calculate an SCP03 authentication cryptogram via the KDF
///
/// `constant` selects the card (0x00) or host (0x01) cryptogram.
pub fn scp03_cryptogram(
    secret: &[u8],
    constant: u8,
    host_challenge: &[u8],
    card_challenge: &[u8],
) -> Result<[u8; 8]> {
    let mut context = Vec::with_capacity(host_challenge.len() + card_challenge.len());
    context.extend_from_slice(host_challenge);
    context.extend_from_slice(card_challenge);

    let out = scp03_kdf(secret, constant, &context, 0x0040)?;
    let mut cryptogram = [0u8; 8];
    cryptogram.copy_from_slice(&out);
    Ok(cryptogram)
}

/// Compute a key check value for the given cipher
pub(crate) fn key_check_value(cipher: KeyCipher, secret: &[u8]) -> Result<[u8; 3]> {
    let mut kcv = [0u8; 3];
    match cipher {
        KeyCipher::Des => {
            let mut block = [0u8; 8];
            des_encrypt_block(secret, &mut block)?;
            kcv.copy_from_slice(&block[..3]);
        }
        KeyCipher::Des3 => {
            let mut block = [0u8; 8];
            des3_encrypt_ecb(secret, &mut block)?;
            kcv.copy_from_slice(&block[..3]);
        }
        KeyCipher::Aes => {
            let mut block = [0x01u8; 16];
            aes_encrypt_block(secret, &mut block)?;
            kcv.copy_from_slice(&block[..3]);
        }
    }
    Ok(kcv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_resize_des3_key() {
        let key = hex!("404142434445464748494a4b4c4d4e4f");
        let resized = resize_des3_key(&key).unwrap();
        assert_eq!(
            resized,
            hex!("404142434445464748494a4b4c4d4e4f4041424344454647")
        );
        assert!(resize_des3_key(&key[..8]).is_err());
    }

    #[test]
    fn test_iso7816_pad() {
        assert_eq!(iso7816_pad(&[], 8), hex!("8000000000000000"));
        assert_eq!(iso7816_pad(&hex!("0102030405"), 8), hex!("0102030405800000"));
        assert_eq!(
            iso7816_pad(&hex!("0102030405060708"), 8),
            hex!("01020304050607088000000000000000")
        );
    }

    #[test]
    fn test_mac_full_3des() {
        let key = hex!("5b02e75ad63190aece0622936f11abab");
        let data = hex!("8482010010810b098a8fbb88da");
        let mac = mac_full_3des(&key, &[0u8; 8], &data).unwrap();
        assert_eq!(mac, hex!("5271d7174a5a166a"));
    }

    #[test]
    fn test_scp02_card_cryptogram() {
        let enc_key = hex!("16b5867ff50be7239c2bf1245b83a362");
        let host_challenge = hex!("32da078d7aac1cff");
        let sequence_counter = hex!("0072");
        let card_challenge = hex!("84f64a7d6465");

        let cryptogram = scp02_cryptogram(
            &enc_key,
            &sequence_counter,
            &card_challenge,
            &host_challenge,
            false,
        )
        .unwrap();
        assert_eq!(cryptogram, hex!("05c4bb8a86014e22"));
    }

    #[test]
    fn test_scp03_cryptograms() {
        // Session keys from the SCP03 reference derivation
        let s_mac = hex!("053db6abc7fdf3b63a0d965ee16b0255");
        let host = hex!("a7f76c713f0a713d");
        let card = hex!("31900058c1c451a2");

        let card_cryptogram = scp03_cryptogram(&s_mac, KDF_CARD_CRYPTOGRAM, &host, &card).unwrap();
        let host_cryptogram = scp03_cryptogram(&s_mac, KDF_HOST_CRYPTOGRAM, &host, &card).unwrap();
        assert_ne!(card_cryptogram, host_cryptogram);
    }

    #[test]
    fn test_aes_cmac_verify() {
        let key = hex!("404142434445464748494a4b4c4d4e4f");
        let data = hex!("0102030405");
        let tag = aes_cmac(&key, &data).unwrap();

        assert!(aes_cmac_verify(&key, &data, &tag[..8]).unwrap());
        let mut bad = tag;
        bad[0] ^= 0x01;
        assert!(!aes_cmac_verify(&key, &data, &bad[..8]).unwrap());
    }
}
