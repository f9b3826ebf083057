// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB Full-Speed device driver for the analog keyboard's STM32WB.
//!
//! This is the layer between the USB peripheral's registers and an upper USB
//! stack (enumeration, HID class). It knows how to:
//!
//! - Describe endpoints and put them in packet memory, single- or
//!   double-buffered.
//! - Turn them on and off, and stall them.
//! - Move a transfer of any length through an endpoint one packet at a time.
//! - Bring the controller up and report what happens on the bus.
//!
//! It does _not_ know what a descriptor or a SETUP request means. That's the
//! upper stack's problem; see `main.rs` for a minimal one.
//!
//! The driver runs on the host too, against a simulated peripheral, which is
//! how the tests work.
//!
//! # Layout
//!
//! Bottom-up:
//!
//! - `regs`: register bitfields, the `UsbPeripheral` access trait, the real
//!   memory-mapped peripheral.
//! - `pma`: copying bytes in and out of packet memory.
//! - `endpoint`: endpoint records and their lifecycle.
//! - `transfer`: the transfer scheduler and completion handling.
//! - `device`: `DeviceContext`, which ties it all together.
//! - `shared`: a home for the one `DeviceContext`, shared with interrupts.
//! - `hid`: the boot keyboard report.

#![cfg_attr(not(test), no_std)]

pub mod device;
pub mod endpoint;
pub mod hid;
pub mod pma;
pub mod regs;
pub mod shared;
pub mod transfer;

#[cfg(test)]
mod sim;

pub use device::{DeviceConfig, DeviceContext, DeviceState, Event};
pub use endpoint::{Buffering, EndpointStatus, TransferType, UsbDir};
pub use regs::{Stm32Usb, UsbPeripheral};
pub use shared::SharedDevice;

/// Things that can go wrong talking to the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// No device context has been installed where one was expected.
    NullHandle,
    /// The peripheral's register block or packet memory address was null.
    NullInstance,
    /// The endpoint has no transfer type yet (it was never opened).
    InvalidEndpointType,
    /// The endpoint number is beyond the configured endpoint count, or the
    /// direction is wrong for the request.
    InvalidEndpoint,
    /// Max packet size of zero, or too big for packet memory.
    InvalidPacketSize,
    /// Double-buffered OUT on something other than a bulk or isochronous
    /// endpoint.
    UnsupportedBuffering,
    /// The device isn't initialized, or is in the error state.
    NotReady,
}
