use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use crate::{Error, stun::MAGIC_NUMBER};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum IpFamily {
    V4 = 0x01,
    V6 = 0x02,
}

/// [RFC8489]: https://datatracker.ietf.org/doc/html/rfc8489
///
/// MAPPED-ADDRESS and XOR-MAPPED-ADDRESS share one layout: an 8-bit
/// reserved field, the address family, a 16-bit port and a 32 or 128
/// bit address, all in network byte order.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |0 0 0 0 0 0 0 0|    Family     |         X-Port                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                X-Address (Variable)
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// X-Port is the port XOR'ed with the most significant 16 bits of the
/// magic cookie.  An IPv4 X-Address is the address XOR'ed with the magic
/// cookie, an IPv6 X-Address is XOR'ed with the concatenation of the
/// magic cookie and the 96-bit transaction ID.
#[derive(Debug, Clone, Copy)]
pub struct XAddress;

impl XAddress {
    /// encoder SocketAddr as Bytes.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use restream_codec::stun::attributes::address::XAddress;
    ///
    /// let xor_addr_bytes: [u8; 8] =
    ///     [0x00, 0x01, 0xfc, 0xbe, 0xe1, 0xba, 0xa4, 0x29];
    ///
    /// let addr_bytes: [u8; 8] = [0x00, 0x01, 0xdd, 0xac, 0xc0, 0xa8, 0x00, 0x6b];
    ///
    /// let transaction_id: [u8; 12] = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let source = "192.168.0.107:56748".parse().unwrap();
    ///
    /// let mut buffer = BytesMut::with_capacity(1280);
    /// XAddress::serialize(&source, &transaction_id, &mut buffer, true);
    /// assert_eq!(&xor_addr_bytes, &buffer[..]);
    ///
    /// let mut buffer = BytesMut::with_capacity(1280);
    /// XAddress::serialize(&source, &transaction_id, &mut buffer, false);
    /// assert_eq!(&addr_bytes, &buffer[..]);
    /// ```
    pub fn serialize<B: BufMut>(
        addr: &SocketAddr,
        transaction_id: &[u8; 12],
        bytes: &mut B,
        is_xor: bool,
    ) {
        let addr = if is_xor {
            xor(addr, transaction_id)
        } else {
            *addr
        };

        bytes.put_u8(0);

        match addr.ip() {
            IpAddr::V4(ip) => {
                bytes.put_u8(IpFamily::V4 as u8);
                bytes.put_u16(addr.port());
                bytes.put(&ip.octets()[..]);
            }
            IpAddr::V6(ip) => {
                bytes.put_u8(IpFamily::V6 as u8);
                bytes.put_u16(addr.port());
                bytes.put(&ip.octets()[..]);
            }
        }
    }

    /// decoder Bytes as SocketAddr.
    ///
    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::attributes::address::XAddress;
    ///
    /// let xor_addr_bytes: [u8; 8] =
    ///     [0x00, 0x01, 0xfc, 0xbe, 0xe1, 0xba, 0xa4, 0x29];
    ///
    /// let transaction_id: [u8; 12] = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let source = "192.168.0.107:56748".parse().unwrap();
    ///
    /// let addr = XAddress::deserialize(&xor_addr_bytes, &transaction_id, true).unwrap();
    /// assert_eq!(addr, source);
    ///
    /// assert!(XAddress::deserialize(&xor_addr_bytes[..6], &transaction_id, true).is_err());
    /// ```
    pub fn deserialize(
        mut bytes: &[u8],
        transaction_id: &[u8; 12],
        is_xor: bool,
    ) -> Result<SocketAddr, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        // skip the first 8 bits
        bytes.advance(1);

        let family = IpFamily::try_from(bytes.get_u8()).map_err(|_| Error::InvalidInput)?;
        let port = bytes.get_u16();

        let ip = match family {
            IpFamily::V4 => {
                let octets: [u8; 4] = bytes.try_into().map_err(|_| Error::InvalidInput)?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpFamily::V6 => {
                let octets: [u8; 16] = bytes.try_into().map_err(|_| Error::InvalidInput)?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };

        let addr = SocketAddr::new(ip, port);
        Ok(if is_xor {
            xor(&addr, transaction_id)
        } else {
            addr
        })
    }
}

/// # Test
///
/// ```
/// use std::net::SocketAddr;
/// use restream_codec::stun::attributes::address::xor;
///
/// let source: SocketAddr = "192.168.0.107:1".parse().unwrap();
///
/// let res: SocketAddr = "225.186.164.41:8467".parse().unwrap();
///
/// let transaction_id: [u8; 12] = [
///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
/// ];
///
/// assert_eq!(xor(&source, &transaction_id), res);
/// assert_eq!(xor(&res, &transaction_id), source);
/// ```
pub fn xor(addr: &SocketAddr, transaction_id: &[u8; 12]) -> SocketAddr {
    let cookie = MAGIC_NUMBER.to_be_bytes();

    SocketAddr::new(
        match addr.ip() {
            IpAddr::V4(it) => {
                let mut octets = it.octets();
                for (b, k) in octets.iter_mut().zip(cookie) {
                    *b ^= k;
                }

                IpAddr::V4(octets.into())
            }
            IpAddr::V6(it) => {
                let mut octets = it.octets();
                for (b, k) in octets.iter_mut().zip(cookie.iter().chain(transaction_id)) {
                    *b ^= k;
                }

                IpAddr::V6(octets.into())
            }
        },
        addr.port() ^ (MAGIC_NUMBER >> 16) as u16,
    )
}
