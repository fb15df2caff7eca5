pub mod error;
pub mod retry;

pub use error::{CalibrationError, ErrorKind, ProtocolError, TransportError};
pub use retry::RetryPolicy;
