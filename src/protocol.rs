use crate::Error;
use std::fmt;

const DEVICE_ADDRESS: u8 = 0x01;
const READ_FUNCTION: u8 = 0x03;
const WRITE_FUNCTION: u8 = 0x06;

// Read responses carry device address, function code and byte count before
// the payload, plus the trailing CRC.
const READ_RESPONSE_OVERHEAD: usize = 5;
// A write response echoes the full 8-byte request frame.
const WRITE_RESPONSE_SIZE: usize = 8;
const EXCEPTION_RESPONSE_SIZE: usize = 5;
const EXCEPTION_CODE_OFFSET: usize = 2;

// One past the highest addressable register.
const REGISTER_SPACE: u32 = 0x1_0000;

fn modbus_crc(buffer: &[u8]) -> [u8; 2] {
    crc16::State::<crc16::MODBUS>::calculate(buffer).to_le_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// One register read or single-register write, with its wire frame built at
/// construction time. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    operation: Operation,
    starting_address: u16,
    quantity: u16,
    frame: Vec<u8>,
}

impl DeviceCommand {
    /// Build a holding-register read command.
    pub fn read_holding_registers(starting_address: u16, quantity: u16) -> Result<Self, Error> {
        if quantity == 0 || u32::from(starting_address) + u32::from(quantity) > REGISTER_SPACE {
            return Err(Error::InvalidRange);
        }
        let mut frame = vec![DEVICE_ADDRESS, READ_FUNCTION];
        frame.extend_from_slice(&starting_address.to_be_bytes());
        frame.extend_from_slice(&quantity.to_be_bytes());
        let crc = modbus_crc(&frame);
        frame.extend_from_slice(&crc);
        Ok(Self {
            operation: Operation::Read,
            starting_address,
            quantity,
            frame,
        })
    }

    /// Build a single-register write command.
    pub fn write_single_register(starting_address: u16, value: u16) -> Result<Self, Error> {
        let mut frame = vec![DEVICE_ADDRESS, WRITE_FUNCTION];
        frame.extend_from_slice(&starting_address.to_be_bytes());
        frame.extend_from_slice(&value.to_be_bytes());
        let crc = modbus_crc(&frame);
        frame.extend_from_slice(&crc);
        Ok(Self {
            operation: Operation::Write,
            starting_address,
            quantity: 1,
            frame,
        })
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn starting_address(&self) -> u16 {
        self.starting_address
    }

    pub fn quantity(&self) -> u16 {
        self.quantity
    }

    /// The raw frame written to the device.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    fn function(&self) -> u8 {
        match self.operation {
            Operation::Read => READ_FUNCTION,
            Operation::Write => WRITE_FUNCTION,
        }
    }

    /// Expected length of a complete response to this command.
    pub fn response_size(&self) -> usize {
        match self.operation {
            Operation::Read => READ_RESPONSE_OVERHEAD + 2 * usize::from(self.quantity),
            Operation::Write => WRITE_RESPONSE_SIZE,
        }
    }

    /// Whether the trailing checksum of `response` is correct.
    pub fn is_valid_response(&self, response: &[u8]) -> bool {
        if response.len() < 3 {
            return false;
        }
        let (payload, crc) = response.split_at(response.len() - 2);
        crc == modbus_crc(payload)
    }

    /// Whether `response` is a MODBUS exception frame for this command.
    pub fn is_exception_response(&self, response: &[u8]) -> bool {
        response.len() == EXCEPTION_RESPONSE_SIZE && response[1] == (self.function() | 0x80)
    }

    /// Exception code carried by an exception frame.
    pub fn exception_code(&self, response: &[u8]) -> u8 {
        response[EXCEPTION_CODE_OFFSET]
    }

    /// Strip framing and checksum, returning the payload. Reads yield the
    /// register bytes, writes the echoed value.
    pub fn parse_response(&self, response: &[u8]) -> Result<Vec<u8>, Error> {
        if response.len() != self.response_size() {
            log::warn!(
                "Invalid response size - expected={} received={}",
                self.response_size(),
                response.len()
            );
            return Err(Error::Parse(format!(
                "invalid response size {}",
                response.len()
            )));
        }
        match self.operation {
            Operation::Read => Ok(response[3..response.len() - 2].to_vec()),
            Operation::Write => Ok(response[4..6].to_vec()),
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.operation {
            Operation::Read => write!(
                f,
                "read {}-{}",
                self.starting_address,
                self.starting_address + (self.quantity - 1)
            ),
            Operation::Write => write!(f, "write {}", self.starting_address),
        }
    }
}
