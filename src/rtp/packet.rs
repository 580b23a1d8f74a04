//! RTP packet parsing and serialization
//!
//! Fixed-header parsing with CSRC list, extension header and padding
//! handling. Anything that would read past the datagram is rejected as
//! malformed; malformed packets are counted and dropped upstream, never
//! fatal.

use super::RtpError;

/// Fixed RTP header length in bytes
const HEADER_LEN: usize = 12;

/// A parsed RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Parse a datagram into an RTP packet.
    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < HEADER_LEN {
            return Err(RtpError::MalformedPacket(format!(
                "datagram of {} bytes is shorter than the RTP header",
                data.len()
            )));
        }

        let version = (data[0] >> 6) & 0x03;
        if version != 2 {
            return Err(RtpError::MalformedPacket(format!(
                "unsupported RTP version {version}"
            )));
        }
        let padding = (data[0] >> 5) & 0x01 == 1;
        let extension = (data[0] >> 4) & 0x01 == 1;
        let csrc_count = (data[0] & 0x0F) as usize;

        let marker = (data[1] >> 7) & 0x01 == 1;
        let payload_type = data[1] & 0x7F;

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = HEADER_LEN;

        // CSRC list: 4 bytes per entry
        if data.len() < offset + csrc_count * 4 {
            return Err(RtpError::MalformedPacket(
                "datagram truncated inside CSRC list".into(),
            ));
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]));
            offset += 4;
        }

        // Extension header: 16-bit profile, 16-bit length in 32-bit words
        if extension {
            if data.len() < offset + 4 {
                return Err(RtpError::MalformedPacket(
                    "datagram truncated at extension header".into(),
                ));
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let ext_bytes = ext_words * 4;
            if data.len() < offset + 4 + ext_bytes {
                return Err(RtpError::MalformedPacket(
                    "datagram truncated inside extension data".into(),
                ));
            }
            offset += 4 + ext_bytes;
        }

        let mut payload = data[offset..].to_vec();

        // Padding: the final byte carries the pad length including itself
        if padding {
            let pad_len = *payload.last().ok_or_else(|| {
                RtpError::MalformedPacket("padded packet with empty payload".into())
            })? as usize;
            if pad_len == 0 || pad_len > payload.len() {
                return Err(RtpError::MalformedPacket(format!(
                    "invalid padding length {pad_len} for {}-byte payload",
                    payload.len()
                )));
            }
            payload.truncate(payload.len() - pad_len);
        }

        Ok(Self {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc,
            payload,
        })
    }

    /// Serialize an outbound packet: fixed header only, no CSRC, no
    /// extension, no padding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(2 << 6);
        out.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Build an outbound packet
    pub fn outbound(
        payload_type: u8,
        sequence: u16,
        timestamp: u32,
        ssrc: u32,
        marker: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_packet(seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        RtpPacket::outbound(0, seq, ts, ssrc, false, payload.to_vec()).serialize()
    }

    #[test]
    fn test_round_trip() {
        let raw = raw_packet(1000, 160, 0xDEADBEEF, &[0x55; 160]);
        let packet = RtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.version, 2);
        assert_eq!(packet.sequence, 1000);
        assert_eq!(packet.timestamp, 160);
        assert_eq!(packet.ssrc, 0xDEADBEEF);
        assert_eq!(packet.payload_type, 0);
        assert_eq!(packet.payload.len(), 160);
        assert!(!packet.marker);
    }

    #[test]
    fn test_marker_bit() {
        let raw = RtpPacket::outbound(8, 1, 0, 1, true, vec![0; 160]).serialize();
        assert!(RtpPacket::parse(&raw).unwrap().marker);
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(matches!(
            RtpPacket::parse(&[0x80, 0x00, 0x01]),
            Err(RtpError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut raw = raw_packet(1, 0, 1, &[0; 16]);
        raw[0] = 0x40; // version 1
        assert!(matches!(
            RtpPacket::parse(&raw),
            Err(RtpError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_csrc_list_skipped() {
        let mut raw = raw_packet(7, 0, 9, &[0xAA; 8]);
        raw[0] |= 0x02; // csrc_count = 2
        // Splice two CSRC entries between header and payload
        let mut with_csrc = raw[..12].to_vec();
        with_csrc.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 2]);
        with_csrc.extend_from_slice(&raw[12..]);

        let packet = RtpPacket::parse(&with_csrc).unwrap();
        assert_eq!(packet.csrc, vec![1, 2]);
        assert_eq!(packet.payload, vec![0xAA; 8]);
    }

    #[test]
    fn test_csrc_underflow_rejected() {
        let mut raw = raw_packet(7, 0, 9, &[]);
        raw[0] |= 0x0F; // claims 15 CSRC entries that are not there
        assert!(matches!(
            RtpPacket::parse(&raw),
            Err(RtpError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_extension_skipped() {
        let mut raw = raw_packet(7, 0, 9, &[]);
        raw[0] |= 0x10; // extension bit
        let mut with_ext = raw[..12].to_vec();
        // profile 0xBEDE, length 1 word, 4 bytes of extension data
        with_ext.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4]);
        with_ext.extend_from_slice(&[0x77; 4]);

        let packet = RtpPacket::parse(&with_ext).unwrap();
        assert!(packet.extension);
        assert_eq!(packet.payload, vec![0x77; 4]);
    }

    #[test]
    fn test_extension_underflow_rejected() {
        let mut raw = raw_packet(7, 0, 9, &[]);
        raw[0] |= 0x10;
        let mut with_ext = raw[..12].to_vec();
        with_ext.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x10]); // claims 16 words
        assert!(matches!(
            RtpPacket::parse(&with_ext),
            Err(RtpError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_padding_stripped() {
        let mut raw = raw_packet(7, 0, 9, &[0xAA, 0xBB, 0x00, 0x00, 0x03]);
        raw[0] |= 0x20; // padding bit; last byte says 3 bytes of padding
        let packet = RtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.payload, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_invalid_padding_rejected() {
        let mut raw = raw_packet(7, 0, 9, &[0x09]); // pad length 9 > payload
        raw[0] |= 0x20;
        assert!(matches!(
            RtpPacket::parse(&raw),
            Err(RtpError::MalformedPacket(_))
        ));
    }
}
