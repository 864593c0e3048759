// src/checksums.rs
//
// Checksums used on the TWELITE serial link:
// - LRC-8 over the ASCII-hex frame payload
// - CRC-8 (poly 0x31, MSB-first) closing every PAL payload

use once_cell::sync::Lazy;

// ============================================================================
// Parameterised CRC
// ============================================================================

/// MSB-first CRC-8 with arbitrary polynomial, initial value and final XOR.
pub fn crc8_parameterised(data: &[u8], polynomial: u8, init: u8, xor_out: u8) -> u8 {
    let crc = data.iter().fold(init, |mut crc, &byte| {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ polynomial
            } else {
                crc << 1
            };
        }
        crc
    });
    crc ^ xor_out
}

// ============================================================================
// Table-driven PAL CRC
// ============================================================================

const TWELITE_CRC8_POLY: u8 = 0x31;

/// Byte-wise lookup table for the PAL CRC, built once from the bitwise form.
static TWELITE_CRC8_TABLE: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = crc8_parameterised(&[i as u8], TWELITE_CRC8_POLY, 0x00, 0x00);
    }
    table
});

/// CRC-8 closing a TWELITE PAL payload.
/// Poly 0x31, init 0x00, MSB-first, no final XOR.
pub fn crc8_twelite_checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |crc, &byte| TWELITE_CRC8_TABLE[(crc ^ byte) as usize])
}

// ============================================================================
// Simple Checksums
// ============================================================================

/// Simple modulo-256 sum of bytes (8-bit sum).
pub fn sum8_checksum(data: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in data {
        sum = sum.wrapping_add(byte);
    }
    sum
}

/// Longitudinal redundancy check: two's complement of the 8-bit sum.
/// Appending it to `data` makes the whole sequence sum to zero.
pub fn lrc8_checksum(data: &[u8]) -> u8 {
    (!sum8_checksum(data)).wrapping_add(1)
}

/// True when `data` (payload followed by its LRC byte) sums to zero.
pub fn lrc8_valid(data_with_lrc: &[u8]) -> bool {
    sum8_checksum(data_with_lrc) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Parameterised CRC Tests
    // ========================================================================

    #[test]
    fn test_crc8_parameterised_test_vector() {
        // CRC-8 poly 0x31 MSB-first over "123456789"
        assert_eq!(crc8_parameterised(b"123456789", 0x31, 0x00, 0x00), 0xA2);
    }

    // ========================================================================
    // PAL CRC Tests
    // ========================================================================

    #[test]
    fn test_crc8_twelite_matches_bitwise_form() {
        let data = b"123456789";
        assert_eq!(
            crc8_twelite_checksum(data),
            crc8_parameterised(data, 0x31, 0x00, 0x00)
        );
    }

    #[test]
    fn test_crc8_twelite_captured_mag_packet() {
        // :800000008D0011810EE29A01808103113008020CE411300102048A00000001006163
        let payload = hex::decode("800000008D0011810EE29A01808103113008020CE411300102048A0000000100")
            .unwrap();
        assert_eq!(crc8_twelite_checksum(&payload), 0x61);
    }

    #[test]
    fn test_crc8_twelite_captured_mot_header() {
        // :80000000A8002F810EE29A07808302113008020CE41130010203CC3014
        let payload = hex::decode("80000000A8002F810EE29A07808302113008020CE41130010203CC").unwrap();
        assert_eq!(crc8_twelite_checksum(&payload), 0x30);
    }

    #[test]
    fn test_crc8_twelite_empty() {
        assert_eq!(crc8_twelite_checksum(&[]), 0x00);
    }

    // ========================================================================
    // LRC / Sum Tests
    // ========================================================================

    #[test]
    fn test_lrc8_app_twelite_sample() {
        // :7881150175810000380026C9000C04220000FFFFFFFFFFA7
        let payload = hex::decode("7881150175810000380026C9000C04220000FFFFFFFFFF").unwrap();
        assert_eq!(lrc8_checksum(&payload), 0xA7);

        let mut framed = payload.clone();
        framed.push(0xA7);
        assert!(lrc8_valid(&framed));

        framed[3] ^= 0x01;
        assert!(!lrc8_valid(&framed));
    }

    #[test]
    fn test_lrc8_empty_is_zero() {
        assert_eq!(lrc8_checksum(&[]), 0x00);
    }

    #[test]
    fn test_sum8_checksum_wrapping() {
        assert_eq!(sum8_checksum(&[0xFF, 0x01]), 0x00);
        assert_eq!(sum8_checksum(&[0x80, 0x80, 0x05]), 0x05);
    }
}
