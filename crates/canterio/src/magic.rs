//! Header magic.
//!
//! The header is `u32` little-endian on the wire. Its low half carries the
//! frame length under a bit-mixing that always sets bit 15; its high half is
//! the low half XOR-ed with the command id. The length counts the header
//! itself, so a frame with `n` payload bytes encodes length `n + 4`.
//!
//! These formulas are the compatibility contract with the game client and
//! must not be "simplified".

/// Size of the per-client receive buffer the header math is keyed on.
pub const RECV_BUFFER_SIZE: u16 = 4092;

/// Encodes a header for a regular frame (no jumbo bits).
pub fn encode_header(command_id: u16, length: u16) -> u32 {
    encode_header_full(command_id, 0, length, RECV_BUFFER_SIZE)
}

/// Encodes a header in its full form.
///
/// `jumbo` bits are OR-ed into the command id before the XOR fold; the
/// decoder strips bits 14-15 off the recovered id, so jumbo flags never
/// alias a real command. Round trip holds for `command_id <= 0x3FFF` and
/// `length <= 0x3FFF`.
pub fn encode_header_full(command_id: u16, jumbo: u16, length: u16, buffer_size: u16) -> u32 {
    let val = (u32::from(buffer_size) << 16) | u32::from(length);
    let mixed = (val & 0x3FFF) | (val << 14);

    let magic = ((((mixed & 0xF) | 0xFF80) << 8) | ((val >> 4) & 0xFF) | (mixed & 0xF000)) as u16;

    let id = command_id | jumbo;
    (u32::from(magic ^ id) << 16) | u32::from(magic)
}

/// Decodes a header into `(command_id, length)`.
///
/// Returns `None` when bit 15 of the low half is clear; such a header cannot
/// have been produced by [`encode_header`] and the connection carrying it is
/// broken.
pub fn decode_header(header: u32) -> Option<(u16, u16)> {
    if header & (1 << 15) == 0 {
        return None;
    }

    let low = (header & 0xFFFF) as u16;
    let high = (header >> 16) as u16;

    let section = low & 0x3FFF;
    let length = ((u32::from(low) & 0xFF) << 4)
        | ((u32::from(section) >> 8) & 0xF)
        | (u32::from(section) & 0xF000);

    let folded = low ^ high;
    let command_id = !(folded & 0xC000) & folded;

    Some((command_id, length as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_header() {
        // id 7, jumbo bit 14, length 29, buffer 4092.
        let header = encode_header_full(7, 16384, 29, RECV_BUFFER_SIZE);
        assert_eq!(header, 0x8D06CD01);

        let (id, length) = decode_header(header).unwrap();
        assert_eq!(id, 7);
        assert_eq!(length, 29);
    }

    #[test]
    fn round_trips() {
        for id in [0u16, 1, 7, 29, 0x1AB, 0x3FFF] {
            for length in [0u16, 4, 5, 29, 255, 256, 0x1000, 0x3FFF] {
                let header = encode_header(id, length);
                assert_eq!(
                    decode_header(header),
                    Some((id, length)),
                    "id={id:#x} length={length:#x}"
                );
            }
        }
    }

    #[test]
    fn bit15_always_set() {
        for length in 0u16..=0x3FFF {
            assert_ne!(encode_header(1, length) & 0x8000, 0);
        }
    }

    #[test]
    fn rejects_cleared_bit15() {
        assert_eq!(decode_header(0x0000_0000), None);
        assert_eq!(decode_header(0x8000_7FFF), None);
    }
}
