use crate::mac::MacAddress;

pub const SYNC_STREAM: [u8; 6] = [ 0xff, 0xff, 0xff, 0xff, 0xff, 0xff ];
pub const MAC_REPETITIONS: usize = 16;
pub const MAGIC_PACKET_LEN: usize = SYNC_STREAM.len() + MAC_REPETITIONS * 6;

/// Wake-on-LAN payload: 6 bytes of 0xff followed by the MAC 16 times.
#[derive(Clone, PartialEq, Eq)]
pub struct MagicPacket([u8; MAGIC_PACKET_LEN]);

impl MagicPacket {
    pub fn new(mac: MacAddress) -> Self {
        let mut data = [0u8; MAGIC_PACKET_LEN];
        data[..6].copy_from_slice(&SYNC_STREAM);
        for block in data[6..].chunks_exact_mut(6) {
            block.copy_from_slice(&mac.octets());
        }
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Checks whether `payload` starts with a magic packet. Anything past the
/// first 102 bytes (e.g. a SecureOn password) is ignored.
pub fn check_wol_payload(payload: &[u8]) -> bool {
    if payload.len() < MAGIC_PACKET_LEN { return false; }

    let blocks: Vec<&[u8]> = payload[..MAGIC_PACKET_LEN].chunks(6).collect();
    if blocks[0] != SYNC_STREAM {
        return false;
    }

    blocks[2..].iter().all(|block| *block == blocks[1])
}

pub fn wol_payload_get_target_mac(payload: &[u8]) -> Option<MacAddress> {
    if !check_wol_payload(payload) { return None; }

    let mut octets = [0u8; 6];
    octets.copy_from_slice(&payload[6..12]);
    Some(MacAddress::new(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    #[test]
    fn layout_is_sync_stream_then_sixteen_macs() {
        let pkt = MagicPacket::new(MAC);
        let bytes = pkt.as_bytes();

        assert_eq!(bytes.len(), 102);
        assert!(bytes[..6].iter().all(|b| *b == 0xff));
        let blocks: Vec<&[u8]> = bytes[6..].chunks(6).collect();
        assert_eq!(blocks.len(), 16);
        for block in blocks {
            assert_eq!(block, MAC.octets());
        }
    }

    #[test]
    fn recognises_own_packets() {
        let pkt = MagicPacket::new(MAC);
        assert!(check_wol_payload(pkt.as_bytes()));
        assert_eq!(wol_payload_get_target_mac(pkt.as_bytes()), Some(MAC));
    }

    #[test]
    fn tolerates_secureon_password() {
        let mut payload = MagicPacket::new(MAC).as_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert!(check_wol_payload(&payload));
    }

    #[test]
    fn rejects_damaged_payloads() {
        let pkt = MagicPacket::new(MAC);

        assert!(!check_wol_payload(&pkt.as_bytes()[..101]));

        let mut bad_sync = pkt.as_bytes().to_vec();
        bad_sync[3] = 0x00;
        assert!(!check_wol_payload(&bad_sync));

        let mut bad_block = pkt.as_bytes().to_vec();
        bad_block[60] ^= 0x01;
        assert!(!check_wol_payload(&bad_block));
        assert_eq!(wol_payload_get_target_mac(&bad_block), None);
    }
}
