use anyhow::Result;
use restream_service::{
    Error,
    srtp::{SessionKeys, SrtpContext, SrtpKeyingMaterial, SrtpProfile},
};

// RFC 3711, B.3
const MASTER_KEY: [u8; 16] = [
    0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, 0xD6, 0x4F, 0xA3, 0x2C, 0x06, 0xDE, 0x41, 0x39,
];

const MASTER_SALT: [u8; 14] = [
    0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, 0xEB, 0xB6, 0x96, 0x0B, 0x3A, 0xAB, 0xE6,
];

fn material() -> SrtpKeyingMaterial {
    SrtpKeyingMaterial {
        master_key: MASTER_KEY,
        master_salt: MASTER_SALT,
    }
}

fn rtp(seq: u16, ssrc: u32) -> Vec<u8> {
    let mut bytes = vec![0x80, 0x60];
    bytes.extend(seq.to_be_bytes());
    bytes.extend(0x3e80u32.to_be_bytes());
    bytes.extend(ssrc.to_be_bytes());
    bytes.extend((0..160).map(|it| it as u8));
    bytes
}

#[test]
fn test_session_key_derivation() {
    let keys = SessionKeys::rtp(&material());

    assert_eq!(
        keys.cipher_key,
        [
            0xC6, 0x1E, 0x7A, 0x93, 0x74, 0x4F, 0x39, 0xEE, 0x10, 0x73, 0x4A, 0xFE, 0x3F, 0xF7,
            0xA0, 0x87,
        ]
    );

    assert_eq!(
        keys.cipher_salt,
        [
            0x30, 0xCB, 0xBC, 0x08, 0x86, 0x3D, 0x8C, 0x85, 0xD4, 0x9D, 0xB3, 0x4A, 0x9A, 0xE1,
        ]
    );

    assert_eq!(
        keys.auth_key,
        [
            0xCE, 0xBE, 0x32, 0x1F, 0x6F, 0xF7, 0x71, 0x6B, 0x6F, 0xD4, 0xAB, 0x49, 0xAF, 0x25,
            0x6A, 0x15, 0x6D, 0x38, 0xBA, 0xA4,
        ]
    );
}

#[test]
fn test_protect_and_unprotect_rtp() -> Result<()> {
    let mut sender = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);
    let mut receiver = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);

    let packet = rtp(1000, 0xABCD1234);
    let protected = sender.protect_rtp(&packet)?;

    assert_eq!(protected.len(), packet.len() + 10);
    assert_eq!(&protected[..12], &packet[..12]);
    assert_ne!(&protected[12..172], &packet[12..]);

    assert_eq!(receiver.unprotect_rtp(&protected)?, packet);
    Ok(())
}

#[test]
fn test_short_tag_profile() -> Result<()> {
    let mut sender = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_32);
    let mut receiver = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_32);

    let packet = rtp(7, 1);
    let protected = sender.protect_rtp(&packet)?;
    assert_eq!(protected.len(), packet.len() + 4);
    assert_eq!(receiver.unprotect_rtp(&protected)?, packet);

    Ok(())
}

#[test]
fn test_tampered_packet_is_rejected() -> Result<()> {
    let mut sender = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);
    let mut receiver = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);

    let mut protected = sender.protect_rtp(&rtp(1000, 0xABCD1234))?;
    let last = protected.len() - 1;
    protected[last] ^= 0x01;
    assert!(matches!(receiver.unprotect_rtp(&protected), Err(Error::Crypto)));

    let mut protected = sender.protect_rtp(&rtp(1001, 0xABCD1234))?;
    protected[20] ^= 0x80;
    assert!(matches!(receiver.unprotect_rtp(&protected), Err(Error::Crypto)));

    Ok(())
}

#[test]
fn test_replayed_packet_is_rejected() -> Result<()> {
    let mut sender = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);
    let mut receiver = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);

    let first = sender.protect_rtp(&rtp(1000, 0xABCD1234))?;
    let second = sender.protect_rtp(&rtp(1001, 0xABCD1234))?;

    receiver.unprotect_rtp(&second)?;

    // out of order but inside the window.
    receiver.unprotect_rtp(&first)?;

    assert!(matches!(receiver.unprotect_rtp(&first), Err(Error::Crypto)));
    assert!(matches!(receiver.unprotect_rtp(&second), Err(Error::Crypto)));

    Ok(())
}

#[test]
fn test_rollover_counter_per_ssrc() -> Result<()> {
    let mut sender = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);
    let mut receiver = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);

    for seq in [65534, 65535, 0, 1] {
        let packet = rtp(seq, 0x1111);
        let protected = sender.protect_rtp(&packet)?;
        assert_eq!(receiver.unprotect_rtp(&protected)?, packet);
    }

    for seq in [0, 1] {
        sender.protect_rtp(&rtp(seq, 0x2222))?;
    }

    assert_eq!(sender.roc(0x1111), Some(1));
    assert_eq!(receiver.roc(0x1111), Some(1));
    assert_eq!(sender.roc(0x2222), Some(0));
    assert_eq!(sender.roc(0x3333), None);

    Ok(())
}

#[test]
fn test_different_keys_do_not_authenticate() -> Result<()> {
    let mut sender = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);
    let mut receiver = SrtpContext::new(
        &SrtpKeyingMaterial {
            master_key: [0x11; 16],
            master_salt: MASTER_SALT,
        },
        SrtpProfile::Aes128CmSha1_80,
    );

    let protected = sender.protect_rtp(&rtp(1, 1))?;
    assert!(matches!(receiver.unprotect_rtp(&protected), Err(Error::Crypto)));

    Ok(())
}

#[test]
fn test_protect_and_unprotect_rtcp() -> Result<()> {
    let mut sender = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);
    let mut receiver = SrtpContext::new(&material(), SrtpProfile::Aes128CmSha1_80);

    // receiver report without report blocks followed by some payload.
    let mut packet = vec![0x80, 0xc9, 0x00, 0x01, 0xab, 0xcd, 0x12, 0x34];
    packet.extend([0x5a; 24]);

    let first = sender.protect_rtcp(&packet)?;
    assert_eq!(first.len(), packet.len() + 4 + 10);
    assert_eq!(&first[..8], &packet[..8]);
    assert_eq!(&first[packet.len()..packet.len() + 4], &[0x80, 0, 0, 0]);

    let second = sender.protect_rtcp(&packet)?;
    assert_eq!(&second[packet.len()..packet.len() + 4], &[0x80, 0, 0, 1]);

    assert_eq!(receiver.unprotect_rtcp(&first)?, packet);
    assert_eq!(receiver.unprotect_rtcp(&second)?, packet);
    assert!(matches!(receiver.unprotect_rtcp(&first), Err(Error::Crypto)));

    Ok(())
}
