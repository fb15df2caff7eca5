/// CRC-16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF.
/// Transmitted low byte first.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let poly: u16 = 0xA001;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus_known_frame() {
        // Read 1 holding register at 0x0000 from slave 1: 01 03 00 00 00 01 84 0A
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let crc = crc16_modbus(&data);
        assert_eq!(crc.to_le_bytes(), [0x84, 0x0A]);
    }

    #[test]
    fn test_crc16_modbus_check_value() {
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc_over_frame_with_crc_is_zero() {
        let mut frame = vec![0x11, 0x06, 0x00, 0x01, 0x00, 0x03];
        let crc = crc16_modbus(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(crc16_modbus(&frame), 0);
    }
}
