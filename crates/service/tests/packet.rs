use anyhow::Result;
use restream_service::{Error, packet::RtpPacket, pool::BufferPool};

/// seq 1000, SSRC 0xABCD1234, 160 bytes of payload.
fn datagram() -> Vec<u8> {
    let mut bytes = vec![
        0x80, 0x60, 0x03, 0xe8, 0x00, 0x00, 0x3e, 0x80, 0xab, 0xcd, 0x12, 0x34,
    ];

    bytes.extend((0..160).map(|it| it as u8));
    bytes
}

#[test]
fn test_acquire_and_release_keeps_datagram() -> Result<()> {
    let datagram = datagram();
    assert_eq!(datagram.len(), 172);

    let pool = BufferPool::new(2, 1500);
    let mut packet = RtpPacket::new(pool.clone());
    packet.acquire(&datagram, 0, datagram.len())?;
    assert_eq!(pool.available(), 1);

    let header = packet.header()?;
    assert_eq!(header.sequence_number, 1000);
    assert_eq!(header.timestamp, 16000);
    assert_eq!(header.ssrc, 0xABCD1234);
    assert_eq!(header.payload_type, 96);
    assert_eq!(packet.payload()?.len(), 160);

    let bytes = packet.release()?;
    assert_eq!(&bytes[..], &datagram[..]);
    assert_eq!(pool.available(), 2);

    Ok(())
}

#[test]
fn test_acquire_with_offset() -> Result<()> {
    let mut raw = vec![0xff; 8];
    raw.extend(datagram());
    raw.extend([0xee; 4]);

    let mut packet = RtpPacket::new(BufferPool::new(1, 1500));
    packet.acquire(&raw, 8, 172)?;
    assert_eq!(packet.header()?.ssrc, 0xABCD1234);
    assert_eq!(packet.as_bytes()?, &datagram()[..]);

    assert!(matches!(
        RtpPacket::new(BufferPool::new(1, 1500)).acquire(&raw, 8, raw.len()),
        Err(Error::Codec(codec::Error::MalformedHeader))
    ));

    Ok(())
}

#[test]
fn test_rewrite_header_in_place() -> Result<()> {
    let datagram = datagram();
    let mut packet = RtpPacket::new(BufferPool::new(1, 1500));
    packet.acquire(&datagram, 0, datagram.len())?;

    {
        let header = packet.header_mut()?;
        header.ssrc = 0x11223344;
        header.payload_type = 111;
    }

    packet.rewrite_header()?;

    let bytes = packet.release()?;
    assert_eq!(bytes[1] & 0x7f, 111);
    assert_eq!(&bytes[8..12], &[0x11, 0x22, 0x33, 0x44]);
    assert_eq!(&bytes[12..], &datagram[12..]);

    Ok(())
}

#[test]
fn test_accessors_outside_of_acquire() -> Result<()> {
    let datagram = datagram();
    let mut packet = RtpPacket::new(BufferPool::new(1, 1500));

    assert!(matches!(packet.header(), Err(Error::InvalidState)));
    assert!(matches!(packet.payload(), Err(Error::InvalidState)));
    assert!(matches!(packet.release(), Err(Error::InvalidState)));

    packet.acquire(&datagram, 0, datagram.len())?;
    assert!(matches!(
        packet.acquire(&datagram, 0, datagram.len()),
        Err(Error::InvalidState)
    ));

    packet.release()?;
    assert!(!packet.is_applied());
    assert!(matches!(packet.payload_mut(), Err(Error::InvalidState)));
    assert!(matches!(packet.rewrite_header(), Err(Error::InvalidState)));

    Ok(())
}

#[test]
fn test_pool_exhausted() -> Result<()> {
    let datagram = datagram();
    let pool = BufferPool::new(1, 1500);

    let mut first = RtpPacket::new(pool.clone());
    let mut second = RtpPacket::new(pool.clone());

    first.acquire(&datagram, 0, datagram.len())?;
    assert!(matches!(
        second.acquire(&datagram, 0, datagram.len()),
        Err(Error::PoolExhausted)
    ));

    first.release()?;
    second.acquire(&datagram, 0, datagram.len())?;

    Ok(())
}

#[test]
fn test_truncated_header_checks_nothing_out() {
    let pool = BufferPool::new(1, 1500);
    let mut packet = RtpPacket::new(pool.clone());

    assert!(packet.acquire(&datagram()[..8], 0, 8).is_err());
    assert_eq!(pool.available(), 1);
}
