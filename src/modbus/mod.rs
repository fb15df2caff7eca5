pub mod client;
pub mod protocol;
pub mod crc;

pub use client::{inter_frame_silence, ModbusClientTrait, RtuClient};
pub use protocol::{ModbusRequest, ModbusResponse, RtuFrame};
pub use crc::crc16_modbus;
