use crate::fields::{DeviceStruct, FieldValue};
use crate::protocol::DeviceCommand;
use crate::Error;
use std::collections::HashMap;

/// Charging mode register values used by V2 protocol devices.
pub const CHARGING_MODE: &[(u16, &str)] = &[(0, "Standard"), (1, "Silent"), (2, "Turbo")];

/// Contract a concrete power station model has to satisfy: which registers to
/// poll, how to decode them, and how battery packs are addressed.
pub trait BluettiDevice: Send + Sync {
    fn device_type(&self) -> &str;

    fn serial_number(&self) -> &str;

    /// Commands for the main polling pass.
    fn polling_commands(&self) -> Vec<DeviceCommand>;

    /// Commands repeated for every battery pack. Empty when the device
    /// exposes no per-pack data.
    fn pack_polling_commands(&self) -> Vec<DeviceCommand> {
        Vec::new()
    }

    /// Highest pack index to iterate.
    fn pack_num_max(&self) -> u8 {
        1
    }

    /// Register holding the active pack selector, if the device has one.
    fn pack_num_address(&self) -> Option<u16> {
        None
    }

    /// Command selecting battery pack `pack` for subsequent pack reads.
    fn build_pack_select(&self, pack: u8) -> Result<DeviceCommand, Error> {
        let address = self.pack_num_address().ok_or(Error::InvalidRange)?;
        DeviceCommand::write_single_register(address, u16::from(pack))
    }

    /// Serial number reads performed during the encryption handshake.
    fn read_sn_commands(&self) -> Vec<DeviceCommand>;

    /// Decode the body of a read starting at `starting_address` into named
    /// field values.
    fn parse(&self, starting_address: u16, body: &[u8]) -> HashMap<String, FieldValue>;

    /// Name the device advertises over BLE.
    fn advertisement_name(&self) -> String {
        if self.device_type() == "Handsfree" {
            format!("{} {}", self.device_type(), self.serial_number())
        } else {
            format!("{}{}", self.device_type(), self.serial_number())
        }
    }
}

// All register constants below are in the valid range, so the command
// constructors cannot fail.
fn read(starting_address: u16, quantity: u16) -> DeviceCommand {
    DeviceCommand::read_holding_registers(starting_address, quantity)
        .expect("valid register range")
}

/// Register layout shared by all V2 protocol devices.
pub struct ProtocolV2Device {
    device_type: String,
    sn: String,
    fields: DeviceStruct,
    field_derived_polling: bool,
}

impl ProtocolV2Device {
    pub fn new(device_type: &str, sn: &str) -> Self {
        let mut fields = DeviceStruct::new();

        // Device info
        fields.add_swap_string_field("device_type", 110, 6);
        fields.add_sn_field("serial_number", 116);

        // Battery
        fields.add_uint_field("total_battery_percent", 102);

        // Power IO
        fields.add_uint_field("dc_output_power", 140);
        fields.add_uint_field("ac_output_power", 142);
        fields.add_uint_field("dc_input_power", 144);
        fields.add_uint_field("ac_input_power", 146);
        fields.add_uint_field("total_inv_power", 148);
        fields.add_decimal_field("total_dc_consumption", 150, 1);
        fields.add_decimal_field("total_ac_consumption", 152, 1);
        // Total power generated since last reset (kWh)
        fields.add_decimal_field("power_generation", 154, 1);
        fields.add_decimal_field("total_grid_consumption", 156, 1);
        fields.add_enum_field("charging_mode", 160, CHARGING_MODE);

        // Input details
        fields.add_decimal_field("ac_input_voltage", 1314, 1);

        // Output state
        fields.add_bool_field("ac_output_on_switch", 2011);
        fields.add_bool_field("dc_output_on_switch", 2012);
        fields.add_bool_field("silent_charging_on", 2020);
        fields.add_bool_field("power_lifting_on", 2021);

        fields.add_bool_field("grid_enhancement_mode_on", 2225);

        Self {
            device_type: device_type.to_string(),
            sn: sn.to_string(),
            fields,
            field_derived_polling: false,
        }
    }

    /// Derive the polling list from the field table instead of the fixed
    /// per-register list.
    pub fn with_field_derived_polling(mut self) -> Self {
        self.field_derived_polling = true;
        self
    }
}

impl BluettiDevice for ProtocolV2Device {
    fn device_type(&self) -> &str {
        &self.device_type
    }

    fn serial_number(&self) -> &str {
        &self.sn
    }

    fn polling_commands(&self) -> Vec<DeviceCommand> {
        if self.field_derived_polling {
            return self.fields.read_commands();
        }
        vec![
            read(110, 6),
            read(116, 4),
            read(102, 1),
            read(140, 1),
            read(142, 1),
            read(144, 1),
            read(146, 1),
            read(148, 1),
            read(150, 1),
            read(152, 1),
            read(154, 1),
            read(156, 1),
            read(160, 1),
            read(1314, 1),
            read(2011, 1),
            read(2012, 1),
            read(2020, 1),
            read(2021, 1),
            read(2225, 1),
        ]
    }

    fn read_sn_commands(&self) -> Vec<DeviceCommand> {
        vec![read(116, 4)]
    }

    fn parse(&self, starting_address: u16, body: &[u8]) -> HashMap<String, FieldValue> {
        self.fields.parse(starting_address, body)
    }
}

/// Look up a supported model by its type name.
pub fn build_device(device_type: &str, sn: &str) -> Option<ProtocolV2Device> {
    match device_type.to_ascii_uppercase().as_str() {
        "AC2A" => Some(ProtocolV2Device::new("AC2A", sn)),
        "AC70P" => Some(ProtocolV2Device::new("AC70P", sn).with_field_derived_polling()),
        "ELITE200V2" => Some(ProtocolV2Device::new("Elite200V2", sn)),
        _ => None,
    }
}
