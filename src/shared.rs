// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The one device context, reachable from both the main loop and interrupt
//! handlers.
//!
//! A `SharedDevice` starts out empty and can live in a `static`. Once
//! `install` has put a context in it, `with` runs a closure on the context
//! inside a critical section, so a USB interrupt can never observe a
//! half-finished update from the foreground (or vice versa).

use core::cell::RefCell;

use critical_section::Mutex;
use log::warn;

use crate::device::{DeviceConfig, DeviceContext};
use crate::regs::UsbPeripheral;
use crate::Error;

pub struct SharedDevice<'a, H> {
    slot: Mutex<RefCell<Option<DeviceContext<'a, H>>>>,
}

impl<'a, H: UsbPeripheral> SharedDevice<'a, H> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(RefCell::new(None)),
        }
    }

    /// Puts `dev` in the slot, returning whatever was there before.
    pub fn install(&self, dev: DeviceContext<'a, H>) -> Option<DeviceContext<'a, H>> {
        critical_section::with(|cs| self.slot.borrow_ref_mut(cs).replace(dev))
    }

    /// Empties the slot.
    pub fn take(&self) -> Option<DeviceContext<'a, H>> {
        critical_section::with(|cs| self.slot.borrow_ref_mut(cs).take())
    }

    pub fn is_installed(&self) -> bool {
        critical_section::with(|cs| self.slot.borrow_ref(cs).is_some())
    }

    /// Runs `body` on the installed context, with interrupts held off.
    ///
    /// Fails with `Error::NullHandle` if nothing has been installed.
    pub fn with<R>(&self, body: impl FnOnce(&mut DeviceContext<'a, H>) -> R) -> Result<R, Error> {
        critical_section::with(|cs| {
            let mut slot = self.slot.borrow_ref_mut(cs);
            match slot.as_mut() {
                Some(dev) => Ok(body(dev)),
                None => {
                    warn!("usb: no device installed");
                    Err(Error::NullHandle)
                }
            }
        })
    }

    /// Builds a context around `hw`, initializes it and installs it.
    pub fn init(&self, hw: H, config: DeviceConfig) {
        let mut dev = DeviceContext::new(hw, config);
        dev.init();
        self.install(dev);
    }
}

impl<'a, H: UsbPeripheral> Default for SharedDevice<'a, H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use crate::endpoint::{Buffering, TransferType};
    use crate::sim::SimulatedUsb;

    #[test]
    fn empty_slot_is_a_null_handle() {
        let shared: SharedDevice<'_, SimulatedUsb> = SharedDevice::new();
        assert!(!shared.is_installed());
        assert_eq!(shared.with(|dev| dev.state()), Err(Error::NullHandle));
    }

    #[test]
    fn init_installs_a_ready_device() {
        let report = [0u8, 0, 4, 0, 0, 0, 0, 0];
        let shared = SharedDevice::new();
        shared.init(SimulatedUsb::new(), DeviceConfig::default());
        assert_eq!(shared.with(|dev| dev.state()), Ok(DeviceState::Ready));

        shared
            .with(|dev| {
                dev.open(0x81, TransferType::Interrupt, 8)?;
                dev.configure(0x81, Buffering::Single { addr: 0x100 })?;
                dev.activate(0x81)
            })
            .unwrap()
            .unwrap();
        shared.with(|dev| dev.send(0x81, &report)).unwrap().unwrap();
        let packet = shared
            .with(|dev| dev.peripheral().host_in(1))
            .unwrap()
            .unwrap();
        assert_eq!(packet, report);

        let old = shared.take();
        assert!(old.is_some());
        assert_eq!(shared.with(|_| ()), Err(Error::NullHandle));
    }
}
