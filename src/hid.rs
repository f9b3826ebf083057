// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HID boot keyboard report, and the descriptors that announce it.
//!
//! We use the boot protocol layout (modifier byte, reserved byte, six key
//! slots) so that BIOSes and other simple hosts can use the keyboard without
//! parsing the report descriptor. That caps us at six simultaneous non-modifier
//! keys.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16};

/// Number of key slots in a boot report.
pub const KEY_SLOTS: usize = 6;

/// An 8-byte boot keyboard input report, exactly as it goes on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
pub struct KeyboardReport {
    pub modifiers: u8,
    reserved: u8,
    pub keys: [u8; KEY_SLOTS],
}

impl KeyboardReport {
    pub const fn new() -> Self {
        Self {
            modifiers: 0,
            reserved: 0,
            keys: [0; KEY_SLOTS],
        }
    }
}

pub const REPORT_DESCRIPTOR_LEN: usize = 45;

/// Report descriptor for the boot keyboard report.
pub static REPORT_DESCRIPTOR: [u8; REPORT_DESCRIPTOR_LEN] = [
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0xE0, //   Usage Minimum (Left Control)
    0x29, 0xE7, //   Usage Maximum (Right GUI)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute): modifiers
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant): reserved
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0x65, //   Usage Maximum (101)
    0x81, 0x00, //   Input (Data, Array): keys
    0xC0, // End Collection
];

/// HID class descriptor, sent between the interface and endpoint descriptors
/// in the configuration bundle.
#[repr(C)]
#[derive(Debug, AsBytes, Unaligned)]
pub struct HidDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Must be `HID_DESCRIPTOR_TYPE`.
    pub descriptor_type: u8,
    /// HID class version, BCD.
    pub bcd_hid: U16<LittleEndian>,
    pub country_code: u8,
    /// Number of class descriptors that follow; we have one, the report
    /// descriptor.
    pub num_descriptors: u8,
    pub report_descriptor_type: u8,
    pub report_descriptor_length: U16<LittleEndian>,
}

pub const HID_DESCRIPTOR_TYPE: u8 = 0x21;
pub const REPORT_DESCRIPTOR_TYPE: u8 = 0x22;

/// Interface class, subclass and protocol for a boot keyboard.
pub const INTERFACE_CLASS_HID: u8 = 0x03;
pub const INTERFACE_SUBCLASS_BOOT: u8 = 0x01;
pub const INTERFACE_PROTOCOL_KEYBOARD: u8 = 0x01;

/// Class-specific request to set the idle rate. Keyboards must accept it.
pub const REQUEST_SET_IDLE: u8 = 0x0A;
