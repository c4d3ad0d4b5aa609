use aws_lc_rs::hmac;
use crc::{CRC_32_ISCSI, Crc};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// HMAC SHA1 digest.
///
/// Used for the STUN MESSAGE-INTEGRITY attribute, where the key is the
/// short-term ICE password, and for the SRTP authentication tag.
///
/// # Test
///
/// ```
/// use restream_codec::crypto::hmac_sha1;
///
/// // RFC 2202, test case 2
/// let sign = [
///     0xef, 0xfc, 0xdf, 0x6a, 0xe5, 0xeb, 0x2f, 0xa2, 0xd2, 0x74, 0x16,
///     0xd5, 0xf1, 0x84, 0xdf, 0x9c, 0x25, 0x9a, 0x7c, 0x79,
/// ];
///
/// assert_eq!(hmac_sha1(b"Jefe", &[b"what do ya want ", b"for nothing?"]), sign);
/// ```
pub fn hmac_sha1(key: &[u8], source: &[&[u8]]) -> [u8; 20] {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    let mut ctx = hmac::Context::with_key(&key);

    for buf in source {
        ctx.update(buf);
    }

    let mut result = [0u8; 20];
    result.copy_from_slice(ctx.sign().as_ref());
    result
}

/// HMAC SHA256 digest.
///
/// Used to sign the SCTP state cookie handed out in INIT-ACK.
pub fn hmac_sha256(key: &[u8], source: &[&[u8]]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut ctx = hmac::Context::with_key(&key);

    for buf in source {
        ctx.update(buf);
    }

    let mut result = [0u8; 32];
    result.copy_from_slice(ctx.sign().as_ref());
    result
}

/// CRC32 Fingerprint.
///
/// # Test
///
/// ```
/// use restream_codec::crypto::fingerprint;
///
/// assert_eq!(fingerprint(b"1"), 3498621689);
/// ```
pub fn fingerprint(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes) ^ 0x5354_554e
}

/// CRC32c checksum of an SCTP packet.
///
/// The caller is responsible for zeroing the checksum field before the
/// packet is passed in.
///
/// # Test
///
/// ```
/// use restream_codec::crypto::crc32c;
///
/// assert_eq!(crc32c(&[&b"123456789"[..]]), 0xe3069283);
/// ```
pub fn crc32c(source: &[&[u8]]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    for buf in source {
        digest.update(buf);
    }

    digest.finalize()
}
