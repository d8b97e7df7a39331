//! Cipher and MAC (message authentication code) combinations.


use aes::{Aes128, Aes192, Aes256};
use block_padding::NoPadding;
use cipher::{BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::Block;
use cipher::generic_array::GenericArray;
use cmac::{Cmac, Mac};
use des::{Des, TdesEde2};
use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::Error;


/// A combination of cipher, MAC and KDF (key derivation function) usable during authentication and
/// Secure Messaging.
pub trait CipherAndMac: Send + Sync {
    /// Size of the cipher key in bytes.
    fn cipher_key_size(&self) -> usize;

    /// Block size of the cipher in bytes.
    ///
    /// Secure Messaging pads commands and MAC input to this size and uses it as the size of the
    /// send sequence counter.
    fn cipher_block_size(&self) -> usize;

    /// Block size to which the PACE authentication token input is padded.
    ///
    /// CMAC pads internally, so AES-based combinations return 1 here.
    fn mac_block_size(&self) -> usize;

    /// Whether the CBC IV for Secure Messaging is derived by encrypting the send sequence counter.
    ///
    /// If not, the IV is all zeroes.
    fn derives_iv_from_send_sequence_counter(&self) -> bool;

    /// The key derivation function.
    fn derive_key(&self, key_seed: &[u8], counter: u32) -> Zeroizing<Vec<u8>>;

    /// The key derivation function for encryption purposes.
    fn derive_encryption_key(&self, key_seed: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(key_seed, 1)
    }

    /// The key derivation function for message authentication purposes.
    fn derive_mac_key(&self, key_seed: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(key_seed, 2)
    }

    /// The password-to-key derivation function.
    fn derive_key_from_password(&self, password: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(password, 3)
    }

    /// Decrypts data in-place using the given key and CBC IV.
    ///
    /// Does not strip padding.
    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>;

    /// Encrypts pre-padded data in-place using the given key and CBC IV.
    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>;

    /// Generates a MAC (message authentication code) for the given pre-padded data and key.
    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;

    /// Verifies whether the given data fits the given MAC (message authentication code).
    fn verify_mac_padded_data(&self, data: &[u8], key: &[u8], expected_mac: &[u8]) -> Result<bool, Error> {
        let computed_mac = self.mac_padded_data(data, key)?;
        Ok(computed_mac.ct_eq(expected_mac).into())
    }

    /// The IV used to encrypt or decrypt a Secure Messaging payload at the given send sequence
    /// counter value.
    fn secure_messaging_iv(&self, k_session_enc: &[u8], send_sequence_counter: &[u8]) -> Result<Vec<u8>, Error> {
        let mut iv = vec![0u8; self.cipher_block_size()];
        if self.derives_iv_from_send_sequence_counter() {
            // E(K_enc, SSC); one block of CBC with a zero IV is plain ECB
            iv.copy_from_slice(send_sequence_counter);
            let zero_iv = vec![0u8; self.cipher_block_size()];
            self.encrypt_padded_data(&mut iv, k_session_enc, &zero_iv)?;
        }
        Ok(iv)
    }
}


/// Appends ISO/IEC 9797-1 padding method 2 (a single 1 bit, then zero bits) up to a multiple of
/// `block_size`.
pub fn pad_iso9797_method2(data: &mut Vec<u8>, block_size: usize) {
    data.push(0x80);
    while data.len() % block_size != 0 {
        data.push(0x00);
    }
}

/// Strips ISO/IEC 9797-1 padding method 2, returning `None` if the padding is malformed.
pub fn unpad_iso9797_method2(data: &mut Vec<u8>) -> Option<()> {
    while data.last() == Some(&0x00) {
        data.pop();
    }
    if data.last() != Some(&0x80) {
        return None;
    }
    data.pop();
    Some(())
}


fn cbc_encrypt<C>(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>
    where C: BlockEncryptMut + BlockCipher + KeyInit
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;
    let data_len = data.len();
    encryptor.encrypt_padded_mut::<NoPadding>(data, data_len)
        .map_err(|_| Error::DataLength { obtained: data_len })?;
    Ok(())
}

fn cbc_decrypt<C>(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>
    where C: BlockDecryptMut + BlockCipher + KeyInit
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;
    let data_len = data.len();
    decryptor.decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| Error::DataLength { obtained: data_len })?;
    Ok(())
}

fn sha1_kdf(key_seed: &[u8], counter: u32, key_size: usize) -> Zeroizing<Vec<u8>> {
    let mut hasher = Sha1::new();
    hasher.update(key_seed);
    hasher.update(counter.to_be_bytes());
    let result = hasher.finalize();
    Zeroizing::new(result[0..key_size].to_vec())
}

fn sha256_kdf(key_seed: &[u8], counter: u32, key_size: usize) -> Zeroizing<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(key_seed);
    hasher.update(counter.to_be_bytes());
    let result = hasher.finalize();
    Zeroizing::new(result[0..key_size].to_vec())
}

macro_rules! truncated_cmac {
    ($cipher:ty, $data:expr, $key:expr) => {{
        let key: &[u8] = $key;
        let mut mac = <Cmac<$cipher> as KeyInit>::new_from_slice(key)
            .map_err(|_| Error::KeyLength { obtained: key.len() })?;
        mac.update($data);
        let full_mac = mac.finalize().into_bytes();
        Ok(Zeroizing::new(full_mac[0..8].to_vec()))
    }};
}


/// Retail MAC (ISO/IEC 9797-1 MAC algorithm 3) with single DES and a zero IV.
///
/// `key` is `K1 || K2`; the final block is additionally decrypted with `K2` and re-encrypted with
/// `K1`. The data must already be padded to a multiple of 8 bytes.
pub fn retail_mac(data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    if key.len() != 16 {
        return Err(Error::KeyLength { obtained: key.len() });
    }
    if data.len() % 8 != 0 {
        return Err(Error::DataLength { obtained: data.len() });
    }
    let k1 = Des::new_from_slice(&key[0..8])
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;
    let k2 = Des::new_from_slice(&key[8..16])
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;

    let mut state: Block<Des> = GenericArray::default();
    for block in data.chunks_exact(8) {
        for (s, b) in state.iter_mut().zip(block) {
            *s ^= *b;
        }
        k1.encrypt_block(&mut state);
    }
    k2.decrypt_block(&mut state);
    k1.encrypt_block(&mut state);

    Ok(Zeroizing::new(state.to_vec()))
}


/// 3DES-based cipher and MAC.
///
/// 3DES is used in EDE two-key mode:
/// ```plain
/// encrypt((K1, K2), D) = encrypt(K1, decrypt(K2, encrypt(K1, D)))
/// ```
/// The block mode of operation is Cipher Block Chaining (CBC) with a zero IV.
///
/// The KDF is equivalent to:
/// ```plain
/// keydata = sha1(key || counter)[0..16]
/// ```
/// whereupon
/// ```plain
/// K1 = keydata[0..8]
/// K2 = keydata[8..16]
/// ```
///
/// The MAC is Retail MAC (ISO/IEC 9797-1 algorithm 3) with DES, zero IV and padding method 2 (bit 1
/// and then as many zero bits as necessary).
pub struct Cam3Des;
impl CipherAndMac for Cam3Des {
    fn cipher_key_size(&self) -> usize { 16 }
    fn cipher_block_size(&self) -> usize { 8 }
    fn mac_block_size(&self) -> usize { 8 }
    fn derives_iv_from_send_sequence_counter(&self) -> bool { false }

    fn derive_key(&self, key_seed: &[u8], counter: u32) -> Zeroizing<Vec<u8>> {
        sha1_kdf(key_seed, counter, self.cipher_key_size())
    }

    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        cbc_decrypt::<TdesEde2>(data, key, iv)
    }

    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        cbc_encrypt::<TdesEde2>(data, key, iv)
    }

    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        retail_mac(data, key)
    }
}


/// AES-128-based cipher and MAC.
///
/// The KDF is equivalent to:
/// ```plain
/// keydata = sha1(key || counter)[0..16]
/// ```
///
/// The MAC is CMAC with AES-128 truncated to the initial 8 bytes.
pub struct CamAes128;
impl CipherAndMac for CamAes128 {
    fn cipher_key_size(&self) -> usize { 16 }
    fn cipher_block_size(&self) -> usize { 16 }
    fn mac_block_size(&self) -> usize { 1 }
    fn derives_iv_from_send_sequence_counter(&self) -> bool { true }

    fn derive_key(&self, key_seed: &[u8], counter: u32) -> Zeroizing<Vec<u8>> {
        sha1_kdf(key_seed, counter, self.cipher_key_size())
    }

    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        cbc_decrypt::<Aes128>(data, key, iv)
    }

    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        cbc_encrypt::<Aes128>(data, key, iv)
    }

    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        truncated_cmac!(Aes128, data, key)
    }
}


/// AES-192-based cipher and MAC.
///
/// The KDF is equivalent to:
/// ```plain
/// keydata = sha256(key || counter)[0..24]
/// ```
///
/// The MAC is CMAC with AES-192 truncated to the initial 8 bytes.
pub struct CamAes192;
impl CipherAndMac for CamAes192 {
    fn cipher_key_size(&self) -> usize { 24 }
    fn cipher_block_size(&self) -> usize { 16 }
    fn mac_block_size(&self) -> usize { 1 }
    fn derives_iv_from_send_sequence_counter(&self) -> bool { true }

    fn derive_key(&self, key_seed: &[u8], counter: u32) -> Zeroizing<Vec<u8>> {
        sha256_kdf(key_seed, counter, self.cipher_key_size())
    }

    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        cbc_decrypt::<Aes192>(data, key, iv)
    }

    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        cbc_encrypt::<Aes192>(data, key, iv)
    }

    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        truncated_cmac!(Aes192, data, key)
    }
}


/// AES-256-based cipher and MAC.
///
/// The KDF is equivalent to:
/// ```plain
/// keydata = sha256(key || counter)
/// ```
///
/// The MAC is CMAC with AES-256 truncated to the initial 8 bytes.
pub struct CamAes256;
impl CipherAndMac for CamAes256 {
    fn cipher_key_size(&self) -> usize { 32 }
    fn cipher_block_size(&self) -> usize { 16 }
    fn mac_block_size(&self) -> usize { 1 }
    fn derives_iv_from_send_sequence_counter(&self) -> bool { true }

    fn derive_key(&self, key_seed: &[u8], counter: u32) -> Zeroizing<Vec<u8>> {
        sha256_kdf(key_seed, counter, self.cipher_key_size())
    }

    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        cbc_decrypt::<Aes256>(data, key, iv)
    }

    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        cbc_encrypt::<Aes256>(data, key, iv)
    }

    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        truncated_cmac!(Aes256, data, key)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_bac_key_derivation_p11_appd() {
        // ICAO Doc 9303 Part 11 Appendix D.2
        let k_seed = hex!("239AB9CB282DAF66231DC5A4DF6BFBAE");
        let k_enc = Cam3Des.derive_encryption_key(&k_seed);
        let k_mac = Cam3Des.derive_mac_key(&k_seed);
        // parity bits are ignored by DES, so compare with parity-adjusted values masked out
        let expected_enc = hex!("AB94FDECF2674FDFB9B391F85D7F76F2");
        let expected_mac = hex!("7962D9ECE03D1ACD4C76089DCE131543");
        for (a, b) in k_enc.iter().zip(expected_enc.iter()) {
            assert_eq!(a & 0xFE, b & 0xFE);
        }
        for (a, b) in k_mac.iter().zip(expected_mac.iter()) {
            assert_eq!(a & 0xFE, b & 0xFE);
        }
    }

    #[test]
    fn test_retail_mac_p11_appd() {
        // ICAO Doc 9303 Part 11 Appendix D.3, EXTERNAL AUTHENTICATE MAC
        let k_mac = hex!("7962D9ECE03D1ACD4C76089DCE131543");
        let mut e_ifd = hex!("72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2").to_vec();
        pad_iso9797_method2(&mut e_ifd, 8);
        let mac = Cam3Des.mac_padded_data(&e_ifd, &k_mac).unwrap();
        assert_eq!(mac.as_slice(), &hex!("5F1448EEA8AD90A7"));
    }

    #[test]
    fn test_padding_round_trip() {
        let mut data = vec![0x01, 0x02, 0x03];
        pad_iso9797_method2(&mut data, 8);
        assert_eq!(data, vec![0x01, 0x02, 0x03, 0x80, 0x00, 0x00, 0x00, 0x00]);
        unpad_iso9797_method2(&mut data).unwrap();
        assert_eq!(data, vec![0x01, 0x02, 0x03]);

        let mut bad = vec![0x01, 0x02, 0x00];
        assert!(unpad_iso9797_method2(&mut bad).is_none());
    }

    #[test]
    fn test_aes_iv_is_encrypted_counter() {
        let key = [0x11u8; 16];
        let mut counter = [0u8; 16];
        counter[15] = 1;
        let iv = CamAes128.secure_messaging_iv(&key, &counter).unwrap();

        let mut expected = counter;
        CamAes128.encrypt_padded_data(&mut expected, &key, &[0u8; 16]).unwrap();
        assert_eq!(iv, expected.to_vec());

        let des_iv = Cam3Des.secure_messaging_iv(&[0x22u8; 16], &[0u8; 8]).unwrap();
        assert_eq!(des_iv, vec![0u8; 8]);
    }

    #[test]
    fn test_wrong_key_length_is_an_error() {
        let mut data = [0u8; 16];
        assert!(matches!(
            CamAes128.encrypt_padded_data(&mut data, &[0u8; 15], &[0u8; 16]),
            Err(Error::KeyLength { obtained: 15 }),
        ));
    }
}
