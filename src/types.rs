//! Common types used throughout the crate
//!

use std::fmt;

/// Samsung's USB vendor id.
pub const VID_SAMSUNG: u16 = 0x04E8;

/// A vendor/product id pair identifying one device model.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// Devices known to expose the Loke download protocol when booted into
/// download mode.
pub const SUPPORTED_DEVICES: [DeviceId; 3] = [
    // Galaxy S
    DeviceId { vendor_id: VID_SAMSUNG, product_id: 0x6601 },
    // Galaxy S II, Galaxy Tab 10.1
    DeviceId { vendor_id: VID_SAMSUNG, product_id: 0x685D },
    // Droid Charge
    DeviceId { vendor_id: VID_SAMSUNG, product_id: 0x68C3 },
];

/// Interface numbers and endpoint addresses selected during enumeration.
///
/// The bulk endpoints always share `data_interface`; the notification
/// endpoint lives on a separate control interface. Both interfaces are
/// claimed before any I/O happens.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Endpoints {
    pub comm_interface: u8,
    pub data_interface: u8,
    /// IN interrupt endpoint on the control interface.
    pub comm: u8,
    /// IN bulk endpoint on the data interface.
    pub data_in: u8,
    /// OUT bulk endpoint on the data interface.
    pub data_out: u8,
}

/// Where an uploaded file ends up on the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Destination {
    /// A flash partition, addressed by a file identifier from the partition
    /// table.
    Phone,
    /// The modem image. Takes no file identifier.
    Modem,
}

impl Destination {
    pub(crate) fn code(self) -> u32 {
        match self {
            Destination::Phone => 0,
            Destination::Modem => 1,
        }
    }
}

/// Memory device addressed by a raw dump.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChipType {
    Ram,
    Nand,
}

impl ChipType {
    pub(crate) fn code(self) -> u32 {
        match self {
            ChipType::Ram => 0,
            ChipType::Nand => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        let id = DeviceId {
            vendor_id: 0x04E8,
            product_id: 0x685D,
        };
        assert_eq!(id.to_string(), "04E8:685D");
    }

    #[test]
    fn test_destination_codes() {
        assert_eq!(Destination::Phone.code(), 0);
        assert_eq!(Destination::Modem.code(), 1);
    }
}
