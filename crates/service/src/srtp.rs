//! Secure Real-time Transport Protocol.
//!
//! [RFC3711]: https://datatracker.ietf.org/doc/html/rfc3711
//! [RFC5764]: https://datatracker.ietf.org/doc/html/rfc5764
//!
//! AES-128 counter mode with HMAC-SHA1 authentication, the only transform
//! the DTLS-SRTP protection profiles negotiated here [RFC5764] use.
//! Session keys are derived once from the master key and salt with a key
//! derivation rate of zero [RFC3711].

use crate::Error;

use aes::cipher::{KeyIvInit, StreamCipher};
use ahash::{HashMap, HashMapExt};
use aws_lc_rs::constant_time::verify_slices_are_equal;
use codec::{
    crypto::hmac_sha1,
    rtp::{RtpHeader, rtcp_sender_ssrc},
};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// SRTCP always carries the 80-bit tag, whatever the RTP profile.
pub const SRTCP_AUTH_TAG_LEN: usize = 10;
const SRTCP_INDEX_LEN: usize = 4;
const SRTCP_ENCRYPTED_FLAG: u32 = 0x8000_0000;
const REPLAY_WINDOW: u64 = 64;

#[rustfmt::skip]
mod label {
    pub const RTP_ENCRYPTION:  u8 = 0x00;
    pub const RTP_AUTH:        u8 = 0x01;
    pub const RTP_SALT:        u8 = 0x02;
    pub const RTCP_ENCRYPTION: u8 = 0x03;
    pub const RTCP_AUTH:       u8 = 0x04;
    pub const RTCP_SALT:       u8 = 0x05;
}

/// DTLS-SRTP protection profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpProfile {
    Aes128CmSha1_80,
    Aes128CmSha1_32,
}

impl SrtpProfile {
    /// length of the RTP authentication tag.
    pub fn tag_len(self) -> usize {
        match self {
            Self::Aes128CmSha1_80 => 10,
            Self::Aes128CmSha1_32 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128CmSha1_80 => "SRTP_AES128_CM_SHA1_80",
            Self::Aes128CmSha1_32 => "SRTP_AES128_CM_SHA1_32",
        }
    }
}

/// Master key and salt of one direction.
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpKeyingMaterial {
    pub master_key: [u8; 16],
    pub master_salt: [u8; 14],
}

impl std::fmt::Debug for SrtpKeyingMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpKeyingMaterial")
            .field("master_key", &"[REDACTED]")
            .field("master_salt", &"[REDACTED]")
            .finish()
    }
}

/// Session keys derived from a master key.
///
/// # Test
///
/// ```
/// use restream_service::srtp::{SessionKeys, SrtpKeyingMaterial};
///
/// // RFC 3711, B.3
/// let material = SrtpKeyingMaterial {
///     master_key: [
///         0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, 0xD6, 0x4F, 0xA3, 0x2C,
///         0x06, 0xDE, 0x41, 0x39,
///     ],
///     master_salt: [
///         0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, 0xEB, 0xB6, 0x96, 0x0B, 0x3A,
///         0xAB, 0xE6,
///     ],
/// };
///
/// let keys = SessionKeys::rtp(&material);
/// assert_eq!(
///     keys.cipher_key,
///     [
///         0xC6, 0x1E, 0x7A, 0x93, 0x74, 0x4F, 0x39, 0xEE, 0x10, 0x73, 0x4A, 0xFE,
///         0x3F, 0xF7, 0xA0, 0x87,
///     ]
/// );
/// ```
#[derive(Clone)]
pub struct SessionKeys {
    pub cipher_key: [u8; 16],
    pub cipher_salt: [u8; 14],
    pub auth_key: [u8; 20],
}

impl SessionKeys {
    pub fn rtp(material: &SrtpKeyingMaterial) -> Self {
        Self::derive(material, label::RTP_ENCRYPTION, label::RTP_AUTH, label::RTP_SALT)
    }

    pub fn rtcp(material: &SrtpKeyingMaterial) -> Self {
        Self::derive(material, label::RTCP_ENCRYPTION, label::RTCP_AUTH, label::RTCP_SALT)
    }

    fn derive(material: &SrtpKeyingMaterial, cipher: u8, auth: u8, salt: u8) -> Self {
        let mut keys = Self {
            cipher_key: [0u8; 16],
            cipher_salt: [0u8; 14],
            auth_key: [0u8; 20],
        };

        prf(material, cipher, &mut keys.cipher_key);
        prf(material, auth, &mut keys.auth_key);
        prf(material, salt, &mut keys.cipher_salt);
        keys
    }
}

/// AES-CM key derivation: the keystream of the master key with
/// `IV = (label << 48 XOR master_salt) << 16`.
fn prf(material: &SrtpKeyingMaterial, label: u8, output: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(&material.master_salt);
    iv[7] ^= label;

    output.fill(0);
    let mut cipher = Aes128Ctr::new(material.master_key.as_slice().into(), iv.as_slice().into());
    cipher.apply_keystream(output);
}

/// `IV = (salt << 16) XOR (SSRC << 64) XOR (index << 16)`
fn iv(salt: &[u8; 14], ssrc: u32, index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(salt);

    ssrc.to_be_bytes()
        .iter()
        .zip(&mut iv[4..8])
        .for_each(|(src, dst)| *dst ^= src);

    index.to_be_bytes()[2..]
        .iter()
        .zip(&mut iv[8..14])
        .for_each(|(src, dst)| *dst ^= src);

    iv
}

/// Highest packet index seen on one SSRC and the replay bitmap behind it.
///
/// The index is the 48-bit `ROC || SEQ`, so the rollover counter and the
/// highest sequence number both live in it.
#[derive(Debug, Clone, Copy)]
struct ReplayState {
    index: u64,
    window: u64,
}

impl ReplayState {
    fn new(index: u64) -> Self {
        Self { index, window: 1 }
    }

    fn roc(&self) -> u32 {
        (self.index >> 16) as u32
    }

    /// RFC 3711 Appendix A, guess the rollover counter of a sequence
    /// number relative to the highest one seen.
    fn estimate(&self, seq: u16) -> u64 {
        let roc = self.roc();
        let s_l = self.index as u16;

        let v = if s_l < 0x8000 {
            if seq > s_l && seq - s_l > 0x8000 {
                roc.saturating_sub(1)
            } else {
                roc
            }
        } else if s_l - 0x8000 > seq {
            roc.wrapping_add(1)
        } else {
            roc
        };

        ((v as u64) << 16) | seq as u64
    }

    fn is_replayed(&self, index: u64) -> bool {
        if index > self.index {
            return false;
        }

        let delta = self.index - index;
        delta >= REPLAY_WINDOW || self.window & (1 << delta) != 0
    }

    fn update(&mut self, index: u64) {
        if index > self.index {
            let shift = index - self.index;
            self.window = if shift < REPLAY_WINDOW {
                (self.window << shift) | 1
            } else {
                1
            };

            self.index = index;
        } else {
            let delta = self.index - index;
            if delta < REPLAY_WINDOW {
                self.window |= 1 << delta;
            }
        }
    }
}

/// Crypto context of one direction.
///
/// The outbound and the inbound direction of a connection each own one,
/// rollover counters are tracked per SSRC inside the context.
pub struct SrtpContext {
    profile: SrtpProfile,
    rtp: SessionKeys,
    rtcp: SessionKeys,
    streams: HashMap<u32, ReplayState>,
    rtcp_streams: HashMap<u32, ReplayState>,
    rtcp_index: HashMap<u32, u32>,
}

impl std::fmt::Debug for SrtpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpContext")
            .field("profile", &self.profile)
            .field("keys", &"[REDACTED]")
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl SrtpContext {
    pub fn new(material: &SrtpKeyingMaterial, profile: SrtpProfile) -> Self {
        Self {
            rtp: SessionKeys::rtp(material),
            rtcp: SessionKeys::rtcp(material),
            rtcp_streams: HashMap::new(),
            rtcp_index: HashMap::new(),
            streams: HashMap::new(),
            profile,
        }
    }

    pub fn profile(&self) -> SrtpProfile {
        self.profile
    }

    /// rollover counter of an SSRC, `None` until a packet was seen.
    pub fn roc(&self, ssrc: u32) -> Option<u32> {
        self.streams.get(&ssrc).map(|it| it.roc())
    }

    /// Encrypt an RTP packet, the header stays in the clear and the
    /// authentication tag is appended.
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        let header = RtpHeader::decode(packet)?;
        let seq = header.sequence_number;

        let state = self
            .streams
            .entry(header.ssrc)
            .or_insert_with(|| ReplayState::new(seq as u64));

        let index = state.estimate(seq);
        state.update(index);

        let roc = (index >> 16) as u32;
        let header_len = header.len();

        let mut output = Vec::with_capacity(packet.len() + self.profile.tag_len());
        output.extend_from_slice(packet);

        let iv = iv(&self.rtp.cipher_salt, header.ssrc, index);
        let mut cipher = Aes128Ctr::new(self.rtp.cipher_key.as_slice().into(), iv.as_slice().into());
        cipher.apply_keystream(&mut output[header_len..]);

        let tag = hmac_sha1(&self.rtp.auth_key, &[&output[..], &roc.to_be_bytes()]);
        output.extend_from_slice(&tag[..self.profile.tag_len()]);
        Ok(output)
    }

    /// Authenticate and decrypt an SRTP packet.
    ///
    /// Fails with `Crypto` when the tag does not match or the packet index
    /// was already seen.
    pub fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        let tag_len = self.profile.tag_len();
        if packet.len() < codec::rtp::FIXED_HEADER_SIZE + tag_len {
            return Err(Error::Codec(codec::Error::MalformedHeader));
        }

        let (body, tag) = packet.split_at(packet.len() - tag_len);
        let header = RtpHeader::decode(body)?;
        let seq = header.sequence_number;

        let state = self.streams.get(&header.ssrc).copied();
        let index = match &state {
            Some(state) => {
                let index = state.estimate(seq);
                if state.is_replayed(index) {
                    return Err(Error::Crypto);
                }

                index
            }
            None => seq as u64,
        };

        let roc = (index >> 16) as u32;
        let expected = hmac_sha1(&self.rtp.auth_key, &[body, &roc.to_be_bytes()]);
        verify_slices_are_equal(&expected[..tag_len], tag).map_err(|_| Error::Crypto)?;

        let mut output = body.to_vec();
        let iv = iv(&self.rtp.cipher_salt, header.ssrc, index);
        let mut cipher = Aes128Ctr::new(self.rtp.cipher_key.as_slice().into(), iv.as_slice().into());
        cipher.apply_keystream(&mut output[header.len()..]);

        self.streams
            .entry(header.ssrc)
            .or_insert_with(|| ReplayState::new(index))
            .update(index);

        Ok(output)
    }

    /// Encrypt an RTCP compound packet.
    ///
    /// ```text
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|    RC   |   PT=SR or RR   |             length          |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                         SSRC of sender                        |
    /// +>+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// | ~                          encrypted                          ~
    /// +>+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |E|                         SRTCP index                         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ~                     authentication tag                        ~
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        let ssrc = rtcp_sender_ssrc(packet).ok_or(Error::Codec(codec::Error::MalformedHeader))?;

        let counter = self.rtcp_index.entry(ssrc).or_insert(0);
        let index = *counter;
        *counter = (index + 1) & !SRTCP_ENCRYPTED_FLAG;

        let mut output = Vec::with_capacity(packet.len() + SRTCP_INDEX_LEN + SRTCP_AUTH_TAG_LEN);
        output.extend_from_slice(packet);

        let iv = iv(&self.rtcp.cipher_salt, ssrc, index as u64);
        let mut cipher = Aes128Ctr::new(self.rtcp.cipher_key.as_slice().into(), iv.as_slice().into());
        cipher.apply_keystream(&mut output[8..]);

        output.extend_from_slice(&(SRTCP_ENCRYPTED_FLAG | index).to_be_bytes());
        let tag = hmac_sha1(&self.rtcp.auth_key, &[&output[..]]);
        output.extend_from_slice(&tag[..SRTCP_AUTH_TAG_LEN]);
        Ok(output)
    }

    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>, Error> {
        if packet.len() < 8 + SRTCP_INDEX_LEN + SRTCP_AUTH_TAG_LEN {
            return Err(Error::Codec(codec::Error::MalformedHeader));
        }

        let ssrc = rtcp_sender_ssrc(packet).ok_or(Error::Codec(codec::Error::MalformedHeader))?;
        let (body, tag) = packet.split_at(packet.len() - SRTCP_AUTH_TAG_LEN);

        let expected = hmac_sha1(&self.rtcp.auth_key, &[body]);
        verify_slices_are_equal(&expected[..SRTCP_AUTH_TAG_LEN], tag).map_err(|_| Error::Crypto)?;

        let (body, trailer) = body.split_at(body.len() - SRTCP_INDEX_LEN);
        let e_index = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let index = (e_index & !SRTCP_ENCRYPTED_FLAG) as u64;

        if let Some(state) = self.rtcp_streams.get(&ssrc) {
            if state.is_replayed(index) {
                return Err(Error::Crypto);
            }
        }

        let mut output = body.to_vec();
        if e_index & SRTCP_ENCRYPTED_FLAG != 0 {
            let iv = iv(&self.rtcp.cipher_salt, ssrc, index);
            let mut cipher =
                Aes128Ctr::new(self.rtcp.cipher_key.as_slice().into(), iv.as_slice().into());
            cipher.apply_keystream(&mut output[8..]);
        }

        self.rtcp_streams
            .entry(ssrc)
            .or_insert_with(|| ReplayState::new(index))
            .update(index);

        Ok(output)
    }
}
