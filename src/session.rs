//! Session key derivation for the secure channel protocols
//!
//! Pure functions deriving short-lived session key sets from static card
//! keys and the challenge or sequence material exchanged during mutual
//! authentication. Nothing here touches I/O or mutable state; the caller
//! performs the authentication exchange and feeds the results in.

use tracing::debug;

use crate::crypto::{
    self, DERIVATION_PURPOSE_ENC, DERIVATION_PURPOSE_KEK, DERIVATION_PURPOSE_MAC,
    DERIVATION_PURPOSE_RMAC, DerivationPurpose, KDF_ENC, KDF_MAC, KDF_RMAC,
};
use crate::keys::{Key, KeyCipher, KeySet, KeyType};
use crate::{Error, Result};

fn check_length(data: &[u8], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(Error::BadChallengeLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

const fn scp02_purpose(key_type: KeyType) -> DerivationPurpose {
    match key_type {
        KeyType::Enc => DERIVATION_PURPOSE_ENC,
        KeyType::Mac => DERIVATION_PURPOSE_MAC,
        KeyType::Kek => DERIVATION_PURPOSE_KEK,
        KeyType::Rmac => DERIVATION_PURPOSE_RMAC,
    }
}

/// Derive SCP02 session keys from the static key set
///
/// For every key in the static set, the 16-byte derivation block
/// purpose ‖ sequence counter ‖ 12 zero bytes is encrypted with 3DES-CBC
/// (zero IV) under the static key; the ciphertext is the session secret.
/// The counter must be the 2 bytes reported by the card, used exactly as
/// received.
pub fn derive_scp02_session_keys(static_keys: &KeySet, sequence_counter: &[u8]) -> Result<KeySet> {
    check_length(sequence_counter, 2)?;

    let mut session_keys = Vec::with_capacity(static_keys.keys().len());
    for key in static_keys.keys() {
        let mut block = [0u8; 16];
        block[..2].copy_from_slice(&scp02_purpose(key.key_type()));
        block[2..4].copy_from_slice(sequence_counter);
        crypto::des3_encrypt_cbc(key.secret(), &[0u8; 8], &mut block)?;

        session_keys.push(Key::new(
            key.key_type(),
            KeyCipher::Des3,
            key.version(),
            key.id(),
            &block,
        )?);
    }

    debug!(
        seq = %hex::encode(sequence_counter),
        version = static_keys.version(),
        "derived SCP02 session keys"
    );
    KeySet::new(session_keys)
}

/// Derive SCP01 session keys from the authentication challenges
///
/// The derivation data card[4..8] ‖ host[0..4] ‖ card[0..4] ‖ host[4..8]
/// is encrypted with 3DES-ECB under each static key. The KEK is not
/// derived under SCP01 and passes through unchanged.
pub fn derive_scp01_session_keys(
    static_keys: &KeySet,
    card_challenge: &[u8],
    host_challenge: &[u8],
) -> Result<KeySet> {
    check_length(card_challenge, 8)?;
    check_length(host_challenge, 8)?;

    let mut derivation = [0u8; 16];
    derivation[..4].copy_from_slice(&card_challenge[4..8]);
    derivation[4..8].copy_from_slice(&host_challenge[..4]);
    derivation[8..12].copy_from_slice(&card_challenge[..4]);
    derivation[12..].copy_from_slice(&host_challenge[4..8]);

    let mut session_keys = Vec::with_capacity(static_keys.keys().len());
    for key in static_keys.keys() {
        if key.key_type() == KeyType::Kek {
            session_keys.push(key.clone());
            continue;
        }

        let mut block = derivation;
        crypto::des3_encrypt_ecb(key.secret(), &mut block)?;
        session_keys.push(Key::new(
            key.key_type(),
            KeyCipher::Des3,
            key.version(),
            key.id(),
            &block,
        )?);
    }

    KeySet::new(session_keys)
}

/// Derive SCP03 session keys with the AES-CMAC counter-mode KDF
///
/// The KDF context is host challenge ‖ card challenge. ENC derives from
/// the static ENC key, MAC and RMAC both derive from the static MAC key,
/// each under its own derivation constant. Session key lengths follow the
/// static AES key length. The KEK is used directly under SCP03 and is
/// carried through unchanged when present.
pub fn derive_scp03_session_keys(
    static_keys: &KeySet,
    card_sequence: &[u8],
    host_challenge: &[u8],
    card_challenge: &[u8],
) -> Result<KeySet> {
    check_length(card_sequence, 3)?;
    check_length(host_challenge, 8)?;
    check_length(card_challenge, 8)?;

    let mut context = [0u8; 16];
    context[..8].copy_from_slice(host_challenge);
    context[8..].copy_from_slice(card_challenge);

    let enc = static_keys.key(KeyType::Enc)?;
    let mac = static_keys.key(KeyType::Mac)?;
    if enc.cipher() != KeyCipher::Aes || mac.cipher() != KeyCipher::Aes {
        return Err(Error::InvalidKeySet("SCP03 requires AES static keys"));
    }

    let mut session_keys = Vec::with_capacity(4);
    for (key_type, static_key, constant) in [
        (KeyType::Enc, enc, KDF_ENC),
        (KeyType::Mac, mac, KDF_MAC),
        (KeyType::Rmac, mac, KDF_RMAC),
    ] {
        let out_bits = (static_key.secret().len() * 8) as u16;
        let secret = crypto::scp03_kdf(static_key.secret(), constant, &context, out_bits)?;
        session_keys.push(Key::new(
            key_type,
            KeyCipher::Aes,
            static_key.version(),
            static_key.id(),
            &secret,
        )?);
    }

    if let Some(kek) = static_keys.get(KeyType::Kek) {
        session_keys.push(kek.clone());
    }

    debug!(
        seq = %hex::encode(card_sequence),
        version = static_keys.version(),
        "derived SCP03 session keys"
    );
    KeySet::new(session_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_scp02_reference_derivation() {
        let static_keys = KeySet::global_platform_test(KeyCipher::Des3);

        let session = derive_scp02_session_keys(&static_keys, &hex!("0000")).unwrap();
        assert_eq!(
            session.key(KeyType::Enc).unwrap().secret(),
            hex!("010b0371d78377b801f2d62afc671d95")
        );
        assert_eq!(
            session.key(KeyType::Mac).unwrap().secret(),
            hex!("d1c28c601652a4770d67ad82d2d2e1c4")
        );
        assert_eq!(
            session.key(KeyType::Kek).unwrap().secret(),
            hex!("e11987ee331b417a5d67d760692f89d4")
        );

        let session = derive_scp02_session_keys(&static_keys, &hex!("ffff")).unwrap();
        assert_eq!(
            session.key(KeyType::Enc).unwrap().secret(),
            hex!("e75adaaf916de18a01ab9acc6ef84b8b")
        );
        assert_eq!(
            session.key(KeyType::Mac).unwrap().secret(),
            hex!("66f6b778a1fafccc9de6c253233be33d")
        );
        assert_eq!(
            session.key(KeyType::Kek).unwrap().secret(),
            hex!("3c750e0f60899ffc8f0d26d860ae6c95")
        );
    }

    #[test]
    fn test_scp02_enc_derivation_vector() {
        let static_keys = KeySet::global_platform_test(KeyCipher::Des3);
        let session = derive_scp02_session_keys(&static_keys, &hex!("0065")).unwrap();
        assert_eq!(
            session.key(KeyType::Enc).unwrap().secret(),
            hex!("85e72aaf47874218a202bf5ef891dd21")
        );
    }

    #[test]
    fn test_scp03_reference_derivation() {
        let static_keys = KeySet::global_platform_test(KeyCipher::Aes);

        let session = derive_scp03_session_keys(
            &static_keys,
            &hex!("000010"),
            &hex!("a7f76c713f0a713d"),
            &hex!("31900058c1c451a2"),
        )
        .unwrap();

        assert_eq!(
            session.key(KeyType::Enc).unwrap().secret(),
            hex!("258a78866f41482bef482dc8ca976ccd")
        );
        assert_eq!(
            session.key(KeyType::Mac).unwrap().secret(),
            hex!("053db6abc7fdf3b63a0d965ee16b0255")
        );
        assert_eq!(
            session.key(KeyType::Rmac).unwrap().secret(),
            hex!("eda0b4f2ec0345bfc50f3bc59cfef936")
        );
        // Static KEK passes through
        assert_eq!(
            session.key(KeyType::Kek).unwrap().secret(),
            hex!("404142434445464748494a4b4c4d4e4f")
        );
    }

    #[test]
    fn test_scp01_derivation() {
        let static_keys = KeySet::global_platform_test(KeyCipher::Des3);
        let session = derive_scp01_session_keys(
            &static_keys,
            &hex!("1011121314151617"),
            &hex!("0001020304050607"),
        )
        .unwrap();

        assert_eq!(
            session.key(KeyType::Enc).unwrap().secret(),
            hex!("b5bf23a2b30f621483ee006440cdd375")
        );
        // ENC and MAC static secrets are identical in the test set
        assert_eq!(
            session.key(KeyType::Mac).unwrap().secret(),
            session.key(KeyType::Enc).unwrap().secret()
        );
        // KEK is not derived under SCP01
        assert_eq!(
            session.key(KeyType::Kek).unwrap().secret(),
            hex!("404142434445464748494a4b4c4d4e4f")
        );
    }

    #[test]
    fn test_bad_challenge_lengths() {
        let des_keys = KeySet::global_platform_test(KeyCipher::Des3);
        let aes_keys = KeySet::global_platform_test(KeyCipher::Aes);

        assert!(matches!(
            derive_scp02_session_keys(&des_keys, &hex!("000000")),
            Err(Error::BadChallengeLength {
                expected: 2,
                actual: 3
            })
        ));
        assert!(matches!(
            derive_scp01_session_keys(&des_keys, &hex!("1011"), &hex!("0001020304050607")),
            Err(Error::BadChallengeLength { expected: 8, .. })
        ));
        assert!(matches!(
            derive_scp03_session_keys(
                &aes_keys,
                &hex!("0000"),
                &hex!("a7f76c713f0a713d"),
                &hex!("31900058c1c451a2")
            ),
            Err(Error::BadChallengeLength { expected: 3, .. })
        ));
        assert!(matches!(
            derive_scp03_session_keys(
                &aes_keys,
                &hex!("000010"),
                &hex!("a7f76c713f0a713d"),
                &hex!("31900058c1c451a231")
            ),
            Err(Error::BadChallengeLength { expected: 8, .. })
        ));
    }

    #[test]
    fn test_scp03_rejects_des_keys() {
        let des_keys = KeySet::global_platform_test(KeyCipher::Des3);
        assert!(matches!(
            derive_scp03_session_keys(
                &des_keys,
                &hex!("000010"),
                &hex!("a7f76c713f0a713d"),
                &hex!("31900058c1c451a2")
            ),
            Err(Error::InvalidKeySet(_))
        ));
    }
}
