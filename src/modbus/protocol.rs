use bytes::{BufMut, BytesMut};

use super::crc::crc16_modbus;
use crate::utils::error::ProtocolError;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Exception code for "slave device failure".
pub const EXCEPTION_DEVICE_FAILURE: u8 = 0x04;

/// Address + function + payload; the CRC only exists on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub address: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

impl RtuFrame {
    pub fn new(address: u8, function: u8, payload: Vec<u8>) -> Self {
        Self { address, function, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 4);
        buf.put_u8(self.address);
        buf.put_u8(self.function);
        buf.put_slice(&self.payload);
        let crc = crc16_modbus(&buf);
        buf.put_u16_le(crc);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 4 {
            return Err(ProtocolError::FrameTooShort(bytes.len()));
        }
        let data_len = bytes.len() - 2;
        let received = u16::from_le_bytes([bytes[data_len], bytes[data_len + 1]]);
        let calculated = crc16_modbus(&bytes[..data_len]);
        if received != calculated {
            return Err(ProtocolError::CrcMismatch { calculated, received });
        }
        Ok(Self {
            address: bytes[0],
            function: bytes[1],
            payload: bytes[2..data_len].to_vec(),
        })
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.function & EXCEPTION_FLAG != 0 {
            self.payload.first().copied()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModbusRequest {
    ReadHoldingRegisters {
        address: u8,
        start_register: u16,
        quantity: u16,
    },
    WriteSingleRegister {
        address: u8,
        register: u16,
        value: u16,
    },
    WriteMultipleRegisters {
        address: u8,
        start_register: u16,
        values: Vec<u16>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModbusResponse {
    Registers(Vec<u16>),
    Written { start_register: u16, quantity: u16 },
}

impl ModbusRequest {
    pub fn address(&self) -> u8 {
        match self {
            ModbusRequest::ReadHoldingRegisters { address, .. }
            | ModbusRequest::WriteSingleRegister { address, .. }
            | ModbusRequest::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    pub fn function(&self) -> u8 {
        match self {
            ModbusRequest::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            ModbusRequest::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
            ModbusRequest::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn to_frame(&self) -> RtuFrame {
        let mut payload = BytesMut::new();
        match self {
            ModbusRequest::ReadHoldingRegisters { start_register, quantity, .. } => {
                payload.put_u16(*start_register);
                payload.put_u16(*quantity);
            }
            ModbusRequest::WriteSingleRegister { register, value, .. } => {
                payload.put_u16(*register);
                payload.put_u16(*value);
            }
            ModbusRequest::WriteMultipleRegisters { start_register, values, .. } => {
                payload.put_u16(*start_register);
                payload.put_u16(values.len() as u16);
                payload.put_u8((values.len() * 2) as u8);
                for value in values {
                    payload.put_u16(*value);
                }
            }
        }
        RtuFrame::new(self.address(), self.function(), payload.to_vec())
    }

    /// Total length of a normal (non-exception) reply on the wire, CRC included.
    pub fn expected_response_len(&self) -> usize {
        match self {
            ModbusRequest::ReadHoldingRegisters { quantity, .. } => 5 + (*quantity as usize) * 2,
            ModbusRequest::WriteSingleRegister { .. } => 8,
            ModbusRequest::WriteMultipleRegisters { .. } => 8,
        }
    }

    pub fn parse_response(&self, frame: &RtuFrame) -> Result<ModbusResponse, ProtocolError> {
        if frame.address != self.address() {
            return Err(ProtocolError::UnexpectedResponse(format!(
                "reply from slave {} to request for slave {}",
                frame.address,
                self.address()
            )));
        }
        if let Some(code) = frame.exception_code() {
            return Err(ProtocolError::Exception {
                function: self.function(),
                code,
            });
        }
        if frame.function != self.function() {
            return Err(ProtocolError::UnexpectedResponse(format!(
                "function 0x{:02x} in reply to 0x{:02x}",
                frame.function,
                self.function()
            )));
        }

        match self {
            ModbusRequest::ReadHoldingRegisters { quantity, .. } => {
                let byte_count = *frame.payload.first().ok_or(ProtocolError::FrameTooShort(4))? as usize;
                let data = &frame.payload[1..];
                if byte_count != (*quantity as usize) * 2 || data.len() != byte_count {
                    return Err(ProtocolError::UnexpectedResponse(format!(
                        "byte count {} for {} registers",
                        byte_count, quantity
                    )));
                }
                let registers = data
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(ModbusResponse::Registers(registers))
            }
            ModbusRequest::WriteSingleRegister { .. } => {
                // The slave echoes the request verbatim.
                if frame.payload != self.to_frame().payload {
                    return Err(ProtocolError::UnexpectedResponse("write echo mismatch".to_string()));
                }
                let register = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                Ok(ModbusResponse::Written { start_register: register, quantity: 1 })
            }
            ModbusRequest::WriteMultipleRegisters { start_register, values, .. } => {
                if frame.payload.len() != 4 {
                    return Err(ProtocolError::FrameTooShort(frame.payload.len() + 4));
                }
                let start = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                let quantity = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);
                if start != *start_register || quantity as usize != values.len() {
                    return Err(ProtocolError::UnexpectedResponse(format!(
                        "acknowledged {} registers at 0x{:04x}",
                        quantity, start
                    )));
                }
                Ok(ModbusResponse::Written { start_register: start, quantity })
            }
        }
    }
}

/// IEEE-754 single precision, high word first.
pub fn f32_to_registers(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, (bits & 0xFFFF) as u16]
}

pub fn registers_to_f32(registers: &[u16]) -> Option<f32> {
    match registers {
        [high, low, ..] => Some(f32::from_bits(((*high as u32) << 16) | *low as u32)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_encoding() {
        let request = ModbusRequest::ReadHoldingRegisters {
            address: 0x01,
            start_register: 0x8002,
            quantity: 2,
        };
        let wire = request.to_frame().encode();
        assert_eq!(&wire[..6], &[0x01, 0x03, 0x80, 0x02, 0x00, 0x02]);
        assert_eq!(wire.len(), 8);
        assert_eq!(request.expected_response_len(), 9);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let frames = [
            RtuFrame::new(0x01, READ_HOLDING_REGISTERS, vec![0x04, 0x42, 0xC8, 0x00, 0x00]),
            RtuFrame::new(0xF7, WRITE_SINGLE_REGISTER, vec![0x80, 0x10, 0x00, 0x00]),
            RtuFrame::new(0x11, WRITE_MULTIPLE_REGISTERS, vec![]),
        ];
        for frame in frames {
            assert_eq!(RtuFrame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let frame = ModbusRequest::WriteMultipleRegisters {
            address: 0x01,
            start_register: 0x8004,
            values: f32_to_registers(100.0).to_vec(),
        }
        .to_frame();
        let wire = frame.encode();

        for byte in 0..wire.len() {
            for bit in 0..8 {
                let mut corrupted = wire.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    matches!(RtuFrame::decode(&corrupted), Err(ProtocolError::CrcMismatch { .. })),
                    "flip of bit {} in byte {} went undetected",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_parse_register_reply() {
        let request = ModbusRequest::ReadHoldingRegisters {
            address: 0x01,
            start_register: 0x8002,
            quantity: 2,
        };
        let [high, low] = f32_to_registers(123.5);
        let mut payload = vec![0x04];
        payload.extend_from_slice(&high.to_be_bytes());
        payload.extend_from_slice(&low.to_be_bytes());
        let reply = RtuFrame::new(0x01, READ_HOLDING_REGISTERS, payload);

        match request.parse_response(&reply).unwrap() {
            ModbusResponse::Registers(regs) => assert_eq!(registers_to_f32(&regs), Some(123.5)),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_parse_exception_reply() {
        let request = ModbusRequest::WriteSingleRegister {
            address: 0x01,
            register: 0x8010,
            value: 0,
        };
        let reply = RtuFrame::new(0x01, WRITE_SINGLE_REGISTER | EXCEPTION_FLAG, vec![0x02]);
        assert_eq!(
            request.parse_response(&reply),
            Err(ProtocolError::Exception { function: 0x06, code: 0x02 })
        );
    }

    #[test]
    fn test_reply_from_wrong_slave() {
        let request = ModbusRequest::ReadHoldingRegisters {
            address: 0x01,
            start_register: 0x8000,
            quantity: 1,
        };
        let reply = RtuFrame::new(0x02, READ_HOLDING_REGISTERS, vec![0x02, 0x00, 0x01]);
        assert!(matches!(
            request.parse_response(&reply),
            Err(ProtocolError::UnexpectedResponse(_))
        ));
    }
}
