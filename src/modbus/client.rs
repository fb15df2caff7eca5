use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use super::protocol::{ModbusRequest, ModbusResponse, RtuFrame, EXCEPTION_DEVICE_FAILURE, EXCEPTION_FLAG};
use crate::transport::{SerialConnector, SerialTransport};
use crate::utils::error::{CalibrationError, ProtocolError, TransportError};
use crate::utils::retry::RetryPolicy;

/// Bits per RTU character: start + 8 data + parity/stop + stop.
const BITS_PER_CHAR: f64 = 11.0;

/// Minimum bus silence between frames: 3.5 character times at `baud_rate`.
pub fn inter_frame_silence(baud_rate: u32) -> Duration {
    Duration::from_secs_f64(3.5 * BITS_PER_CHAR / baud_rate.max(1) as f64)
}

#[async_trait]
pub trait ModbusClientTrait: Send + Sync {
    async fn connect(&self) -> Result<(), CalibrationError>;

    async fn disconnect(&self);

    async fn read_holding_registers(
        &self,
        slave_id: u8,
        start_addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, CalibrationError>;

    async fn write_single_register(
        &self,
        slave_id: u8,
        register: u16,
        value: u16,
    ) -> Result<(), CalibrationError>;

    async fn write_multiple_registers(
        &self,
        slave_id: u8,
        start_addr: u16,
        values: &[u16],
    ) -> Result<(), CalibrationError>;
}

struct RtuLink {
    transport: Option<Box<dyn SerialTransport>>,
    last_frame_at: Option<Instant>,
}

/// Modbus RTU master on one serial link. The link mutex is held for the whole
/// request/response exchange, so at most one transaction is on the wire.
pub struct RtuClient {
    name: String,
    connector: Arc<dyn SerialConnector>,
    link: Mutex<RtuLink>,
    silence: Duration,
    response_timeout: Duration,
    retry: RetryPolicy,
}

impl RtuClient {
    pub fn new(
        name: &str,
        connector: Arc<dyn SerialConnector>,
        baud_rate: u32,
        response_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            connector,
            link: Mutex::new(RtuLink {
                transport: None,
                last_frame_at: None,
            }),
            silence: inter_frame_silence(baud_rate),
            response_timeout,
            retry,
        }
    }

    pub fn silence(&self) -> Duration {
        self.silence
    }

    pub async fn execute(&self, request: &ModbusRequest) -> Result<ModbusResponse, CalibrationError> {
        let operation = format!("function 0x{:02x}", request.function());
        self.retry
            .run(&self.name, &operation, || self.transact_once(request))
            .await
    }

    async fn transact_once(&self, request: &ModbusRequest) -> Result<ModbusResponse, CalibrationError> {
        let mut link = self.link.lock().await;

        if let Some(last) = link.last_frame_at {
            let ready = last + self.silence;
            if Instant::now() < ready {
                sleep_until(ready).await;
            }
        }

        let wire = request.to_frame().encode();
        let result = {
            let transport = link.transport.as_mut().ok_or(TransportError::NotConnected)?;
            debug!("📤 {} TX [{}]", self.name, hex::encode(&wire));
            transport.clear_input()?;
            transport.write(&wire)?;
            Self::read_reply(transport.as_mut(), request, self.response_timeout)
        };
        link.last_frame_at = Some(Instant::now());

        let reply = result?;
        debug!("📥 {} RX [{}]", self.name, hex::encode(&reply));

        let frame = RtuFrame::decode(&reply)?;
        request.parse_response(&frame).map_err(|err| match err {
            ProtocolError::Exception { code, .. } if code == EXCEPTION_DEVICE_FAILURE => {
                CalibrationError::device_fault(&self.name, "slave device failure (exception 0x04)")
            }
            other => CalibrationError::Protocol(other),
        })
    }

    /// Reads the header first to tell an exception reply from a normal one.
    fn read_reply(
        transport: &mut dyn SerialTransport,
        request: &ModbusRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut reply = transport.read(2, timeout)?;
        let remaining = if reply[1] & EXCEPTION_FLAG != 0 {
            3
        } else {
            request.expected_response_len() - 2
        };
        reply.extend(transport.read(remaining, timeout)?);
        Ok(reply)
    }
}

#[async_trait]
impl ModbusClientTrait for RtuClient {
    async fn connect(&self) -> Result<(), CalibrationError> {
        let mut link = self.link.lock().await;
        if link.transport.is_none() {
            info!("🔌 Connecting {} via {}", self.name, self.connector.describe());
            link.transport = Some(self.connector.open()?);
            link.last_frame_at = None;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if let Some(mut transport) = link.transport.take() {
            transport.close();
            info!("✅ {} disconnected", self.name);
        }
    }

    async fn read_holding_registers(
        &self,
        slave_id: u8,
        start_addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, CalibrationError> {
        let request = ModbusRequest::ReadHoldingRegisters {
            address: slave_id,
            start_register: start_addr,
            quantity: count,
        };
        match self.execute(&request).await? {
            ModbusResponse::Registers(registers) => Ok(registers),
            other => Err(ProtocolError::UnexpectedResponse(format!("{:?}", other)).into()),
        }
    }

    async fn write_single_register(
        &self,
        slave_id: u8,
        register: u16,
        value: u16,
    ) -> Result<(), CalibrationError> {
        let request = ModbusRequest::WriteSingleRegister {
            address: slave_id,
            register,
            value,
        };
        self.execute(&request).await.map(|_| ())
    }

    async fn write_multiple_registers(
        &self,
        slave_id: u8,
        start_addr: u16,
        values: &[u16],
    ) -> Result<(), CalibrationError> {
        let request = ModbusRequest::WriteMultipleRegisters {
            address: slave_id,
            start_register: start_addr,
            values: values.to_vec(),
        };
        self.execute(&request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::protocol::{f32_to_registers, registers_to_f32, READ_HOLDING_REGISTERS};
    use crate::transport::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pv_reply(value: f32) -> Vec<u8> {
        let [high, low] = f32_to_registers(value);
        let mut payload = vec![0x04];
        payload.extend_from_slice(&high.to_be_bytes());
        payload.extend_from_slice(&low.to_be_bytes());
        RtuFrame::new(0x01, READ_HOLDING_REGISTERS, payload).encode()
    }

    fn client_on(mock: &MockTransport, max_retries: u32) -> RtuClient {
        RtuClient::new(
            "furnace",
            Arc::new(mock.clone()),
            9600,
            Duration::from_millis(100),
            RetryPolicy { max_retries, backoff_ms: 10 },
        )
    }

    #[test]
    fn test_inter_frame_silence_at_9600() {
        // 3.5 * 11 bits / 9600 baud ≈ 4.01 ms
        let silence = inter_frame_silence(9600);
        assert!(silence > Duration::from_micros(4000) && silence < Duration::from_micros(4020));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crc_mismatch_is_discarded_and_retried() {
        let replies = Arc::new(AtomicUsize::new(0));
        let counter = replies.clone();
        let mock = MockTransport::with_responder("furnace", move |_req| {
            let mut reply = pv_reply(250.0);
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                reply[4] ^= 0x01;
            }
            reply
        });
        let client = client_on(&mock, 3);
        client.connect().await.unwrap();

        let registers = client.read_holding_registers(0x01, 0x8002, 2).await.unwrap();

        assert_eq!(registers_to_f32(&registers), Some(250.0));
        assert_eq!(replies.load(Ordering::SeqCst), 2);
        assert_eq!(mock.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_corruption_surfaces_device_error() {
        let mock = MockTransport::with_responder("furnace", |_req| {
            let mut reply = pv_reply(25.0);
            let last = reply.len() - 1;
            reply[last] ^= 0xFF;
            reply
        });
        let client = client_on(&mock, 2);
        client.connect().await.unwrap();

        let err = client.read_holding_registers(0x01, 0x8002, 2).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Device { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_enforced_between_transactions() {
        let mock = MockTransport::with_responder("furnace", |_req| pv_reply(30.0));
        let client = client_on(&mock, 0);
        client.connect().await.unwrap();

        client.read_holding_registers(0x01, 0x8002, 2).await.unwrap();
        let before = Instant::now();
        client.read_holding_registers(0x01, 0x8002, 2).await.unwrap();

        assert!(before.elapsed() >= client.silence());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_failure_exception_is_a_fault() {
        let mock = MockTransport::with_responder("furnace", |_req| {
            RtuFrame::new(0x01, 0x86, vec![EXCEPTION_DEVICE_FAILURE]).encode()
        });
        let client = client_on(&mock, 3);
        client.connect().await.unwrap();

        let err = client.write_single_register(0x01, 0x8010, 0).await.unwrap_err();
        assert!(matches!(err, CalibrationError::DeviceFault { .. }));
        assert_eq!(mock.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let mock = MockTransport::new("furnace");
        let client = client_on(&mock, 0);
        let err = client.read_holding_registers(0x01, 0x8002, 2).await.unwrap_err();
        assert_eq!(err, CalibrationError::Transport(TransportError::NotConnected));
    }
}
