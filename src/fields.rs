use crate::protocol::DeviceCommand;
use std::collections::HashMap;
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

/// A decoded register value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize), serde(untagged))]
pub enum FieldValue {
    Uint(u64),
    Decimal(f64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    /// Zero is the "not present" sentinel used by battery pack polling.
    pub fn is_zero(&self) -> bool {
        match self {
            FieldValue::Uint(v) => *v == 0,
            FieldValue::Decimal(v) => *v == 0.0,
            FieldValue::Bool(v) => !*v,
            FieldValue::Text(_) => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Uint(v) => write!(f, "{v}"),
            FieldValue::Decimal(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone)]
enum FieldKind {
    Uint,
    Decimal { scale: u32 },
    Bool,
    Enum { variants: &'static [(u16, &'static str)] },
    SwapString,
    SerialNumber,
}

#[derive(Debug, Clone)]
struct FieldDef {
    name: String,
    address: u16,
    // Size in registers.
    size: u16,
    kind: FieldKind,
}

/// Register layout of a device: an ordered table of named fields used to
/// decode read responses and to derive polling commands.
#[derive(Debug, Clone, Default)]
pub struct DeviceStruct {
    fields: Vec<FieldDef>,
}

impl DeviceStruct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_uint_field(&mut self, name: &str, address: u16) {
        self.add(name, address, 1, FieldKind::Uint);
    }

    pub fn add_decimal_field(&mut self, name: &str, address: u16, scale: u32) {
        self.add(name, address, 1, FieldKind::Decimal { scale });
    }

    pub fn add_bool_field(&mut self, name: &str, address: u16) {
        self.add(name, address, 1, FieldKind::Bool);
    }

    pub fn add_enum_field(
        &mut self,
        name: &str,
        address: u16,
        variants: &'static [(u16, &'static str)],
    ) {
        self.add(name, address, 1, FieldKind::Enum { variants });
    }

    /// A string stored with the two ASCII bytes of every register swapped.
    pub fn add_swap_string_field(&mut self, name: &str, address: u16, size: u16) {
        self.add(name, address, size, FieldKind::SwapString);
    }

    /// A serial number spread over four registers, least significant first.
    pub fn add_sn_field(&mut self, name: &str, address: u16) {
        self.add(name, address, 4, FieldKind::SerialNumber);
    }

    fn add(&mut self, name: &str, address: u16, size: u16, kind: FieldKind) {
        self.fields.push(FieldDef {
            name: name.to_string(),
            address,
            size,
            kind,
        });
    }

    /// Decode every field fully contained in the register window starting at
    /// `starting_address` covered by `body`.
    pub fn parse(&self, starting_address: u16, body: &[u8]) -> HashMap<String, FieldValue> {
        let window_end = u32::from(starting_address) + (body.len() / 2) as u32;
        let mut parsed = HashMap::new();
        for field in &self.fields {
            if field.address < starting_address
                || u32::from(field.address) + u32::from(field.size) > window_end
            {
                continue;
            }
            let offset = usize::from(field.address - starting_address) * 2;
            let raw = &body[offset..offset + usize::from(field.size) * 2];
            if let Some(value) = decode_field(&field.kind, raw) {
                parsed.insert(field.name.clone(), value);
            }
        }
        parsed
    }

    /// Read commands covering the whole field table, with adjacent fields
    /// coalesced into one read.
    pub fn read_commands(&self) -> Vec<DeviceCommand> {
        let mut spans: Vec<(u32, u32)> = self
            .fields
            .iter()
            .map(|f| {
                (
                    u32::from(f.address),
                    u32::from(f.address) + u32::from(f.size),
                )
            })
            .collect();
        spans.sort_unstable();

        let mut merged: Vec<(u32, u32)> = Vec::new();
        for (start, end) in spans {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => *last_end = end.max(*last_end),
                _ => merged.push((start, end)),
            }
        }

        merged
            .into_iter()
            .filter_map(|(start, end)| {
                DeviceCommand::read_holding_registers(start as u16, (end - start) as u16).ok()
            })
            .collect()
    }
}

fn decode_field(kind: &FieldKind, raw: &[u8]) -> Option<FieldValue> {
    match kind {
        FieldKind::Uint => Some(FieldValue::Uint(u64::from(u16::from_be_bytes([
            raw[0], raw[1],
        ])))),
        FieldKind::Decimal { scale } => {
            let value = u16::from_be_bytes([raw[0], raw[1]]);
            Some(FieldValue::Decimal(
                f64::from(value) / f64::from(10u32.pow(*scale)),
            ))
        }
        FieldKind::Bool => Some(FieldValue::Bool(u16::from_be_bytes([raw[0], raw[1]]) != 0)),
        FieldKind::Enum { variants } => {
            let value = u16::from_be_bytes([raw[0], raw[1]]);
            match variants.iter().find(|(v, _)| *v == value) {
                Some((_, name)) => Some(FieldValue::Text((*name).to_string())),
                None => {
                    log::warn!("Unknown enum value {value}");
                    None
                }
            }
        }
        FieldKind::SwapString => {
            let mut bytes = Vec::with_capacity(raw.len());
            for pair in raw.chunks_exact(2) {
                bytes.push(pair[1]);
                bytes.push(pair[0]);
            }
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            bytes.truncate(end);
            Some(FieldValue::Text(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        }
        FieldKind::SerialNumber => {
            let mut value = 0u64;
            for (i, pair) in raw.chunks_exact(2).enumerate() {
                value |= u64::from(u16::from_be_bytes([pair[0], pair[1]])) << (16 * i);
            }
            Some(FieldValue::Uint(value))
        }
    }
}
