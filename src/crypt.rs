use crate::Error;

/// Outcome of one link negotiation step, as reported by the vendor crypto
/// service. Wire status code 3 maps to [`LinkStep::SendSerial`], 4 to
/// [`LinkStep::Established`]; any other non-negative status with payload is a
/// pass-through step, everything else is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStep {
    /// The device wants its serial number read and sent back.
    SendSerial,
    /// The encrypted link is up.
    Established,
    /// Forward these bytes to the device and keep negotiating.
    PassThrough(Vec<u8>),
    /// Nothing usable yet, try the next notification.
    Again,
}

/// Encryption negotiation state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unknown,
    Disabled,
    Negotiating,
    SerialExchange,
    Established,
    Failed,
}

/// Opaque vendor encryption service guarding the BLE link. Implementations
/// wrap the proprietary crypto library; the polling layer only drives the
/// negotiation and routes frames through the encode/decode paths.
pub trait LinkCrypto: Send {
    fn version(&self) -> String;

    /// Reset internal negotiation state. Called whenever a fresh connection
    /// attempt starts, so the handshake is re-entrant per connection.
    fn reset(&mut self) {}

    /// Advance the link negotiation with the latest notification payload.
    fn negotiate_link(&mut self, data: &[u8]) -> LinkStep;

    /// Transform an outbound frame for the wire.
    fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>, Error>;

    /// Transform an inbound notification payload.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>, Error>;
}

/// No-op service used when the device advertises no encryption support.
#[derive(Debug, Default)]
pub struct PlainLink;

impl LinkCrypto for PlainLink {
    fn version(&self) -> String {
        String::from("plain")
    }

    fn negotiate_link(&mut self, _data: &[u8]) -> LinkStep {
        LinkStep::Established
    }

    fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(data.to_vec())
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_link_passes_data_through() {
        let mut link = PlainLink;
        assert_eq!(link.encode(&[1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert_eq!(link.decode(&[4, 5]).unwrap(), vec![4, 5]);
        assert_eq!(link.negotiate_link(&[]), LinkStep::Established);
    }
}
