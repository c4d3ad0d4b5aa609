use crate::{
    Error,
    pool::{BufferPool, PooledBuffer},
};

use std::sync::Arc;

use bytes::Bytes;
use codec::rtp::RtpHeader;

struct Applied {
    buffer: PooledBuffer,
    header: RtpHeader,
    header_len: usize,
}

/// One RTP datagram held in a pooled buffer.
///
/// A packet is reused across datagrams: [`RtpPacket::acquire`] checks a
/// buffer out of the pool and parses the header, [`RtpPacket::release`]
/// hands the bytes back.  Between the two the header and payload can be
/// read and rewritten in place, outside of it every accessor returns
/// [`Error::InvalidState`].
///
/// ```
/// use restream_service::{Error, packet::RtpPacket, pool::BufferPool};
///
/// let datagram = [
///     0x80, 0x60, 0x03, 0xe8, 0x00, 0x00, 0x00, 0x00, 0xab, 0xcd, 0x12, 0x34,
///     0x01, 0x02, 0x03, 0x04,
/// ];
///
/// let mut packet = RtpPacket::new(BufferPool::new(4, 1500));
/// packet.acquire(&datagram, 0, datagram.len()).unwrap();
/// assert_eq!(packet.header().unwrap().sequence_number, 1000);
/// assert_eq!(packet.payload().unwrap(), &[0x01, 0x02, 0x03, 0x04]);
/// assert!(matches!(packet.acquire(&datagram, 0, datagram.len()), Err(Error::InvalidState)));
///
/// let bytes = packet.release().unwrap();
/// assert_eq!(&bytes[..], &datagram[..]);
/// assert!(matches!(packet.header(), Err(Error::InvalidState)));
/// ```
pub struct RtpPacket {
    pool: Arc<BufferPool>,
    applied: Option<Applied>,
}

impl RtpPacket {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            applied: None,
            pool,
        }
    }

    /// Parse `raw[offset..offset + length]` and copy it into a pooled
    /// buffer.
    ///
    /// The range must contain at least the fixed header plus the CSRC
    /// list and extension it declares, otherwise the packet is rejected
    /// with `MalformedHeader` and no buffer is checked out.
    pub fn acquire(&mut self, raw: &[u8], offset: usize, length: usize) -> Result<(), Error> {
        if self.applied.is_some() {
            return Err(Error::InvalidState);
        }

        let end = offset
            .checked_add(length)
            .filter(|end| *end <= raw.len())
            .ok_or(Error::Codec(codec::Error::MalformedHeader))?;

        let bytes = &raw[offset..end];
        let header = RtpHeader::decode(bytes)?;
        let buffer = self.pool.checkout(bytes)?;

        self.applied = Some(Applied {
            header_len: header.len(),
            header,
            buffer,
        });

        Ok(())
    }

    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }

    pub fn header(&self) -> Result<&RtpHeader, Error> {
        Ok(&self.get()?.header)
    }

    /// Mutable header fields.  Changes only reach the buffer once
    /// [`RtpPacket::rewrite_header`] is called.
    pub fn header_mut(&mut self) -> Result<&mut RtpHeader, Error> {
        Ok(&mut self.get_mut()?.header)
    }

    /// Everything after the header, padding included.
    pub fn payload(&self) -> Result<&[u8], Error> {
        let applied = self.get()?;
        Ok(&applied.buffer.as_slice()[applied.header_len..])
    }

    /// Fixed-size view over the payload, it can be rewritten but never
    /// grown.
    pub fn payload_mut(&mut self) -> Result<&mut [u8], Error> {
        let applied = self.get_mut()?;
        let header_len = applied.header_len;
        Ok(&mut applied.buffer.as_mut_slice()[header_len..])
    }

    /// The whole datagram as it currently sits in the buffer.
    pub fn as_bytes(&self) -> Result<&[u8], Error> {
        Ok(self.get()?.buffer.as_slice())
    }

    /// Serialize the header fields back into the buffer.
    ///
    /// The header has to keep the size it was parsed with, the payload
    /// is never moved.
    pub fn rewrite_header(&mut self) -> Result<(), Error> {
        let applied = self.get_mut()?;
        if applied.header.len() != applied.header_len {
            return Err(Error::Codec(codec::Error::InvalidInput));
        }

        applied.header.encode(applied.buffer.as_mut_slice())?;
        Ok(())
    }

    /// Return the buffer to the pool.  The bytes of the datagram are
    /// handed back to the caller.
    pub fn release(&mut self) -> Result<Bytes, Error> {
        let applied = self.applied.take().ok_or(Error::InvalidState)?;
        Ok(Bytes::copy_from_slice(applied.buffer.as_slice()))
    }

    fn get(&self) -> Result<&Applied, Error> {
        self.applied.as_ref().ok_or(Error::InvalidState)
    }

    fn get_mut(&mut self) -> Result<&mut Applied, Error> {
        self.applied.as_mut().ok_or(Error::InvalidState)
    }
}
