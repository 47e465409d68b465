/// Errors reported by the protocol and polling layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Starting address plus quantity exceeds the 16-bit register space.
    #[error("Register range out of bounds")]
    InvalidRange,
    /// A response frame failed length or checksum validation.
    #[error("Parse error: {0}")]
    Parse(String),
    /// The device answered with a MODBUS exception frame.
    #[error("MODBUS exception code {0}")]
    ModbusException(u8),
    /// No complete response arrived within the per-command timeout.
    #[error("Response timed out")]
    Timeout,
    /// Transport-level connect, write or scan failure.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The link delivered an AT command echo instead of protocol data.
    #[error("Bad connection: {0}")]
    BadConnection(String),
    /// The encryption handshake gave up after its bounded retries.
    #[error("Encryption handshake failed")]
    HandshakeFailed,
    /// The vendor crypto service rejected or failed to transform data.
    #[error("Crypto error: {0}")]
    Crypto(String),
}
