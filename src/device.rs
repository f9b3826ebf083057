// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device context: one per USB peripheral.
//!
//! `DeviceContext` owns the peripheral handle and the endpoint table, brings
//! the controller up, and is the front door for everything else in the crate.
//! The upper stack (enumeration, HID class) talks to it in terms of endpoint
//! addresses -- `0x81` for EP1 IN and so on -- and gets `Event`s back out of
//! [`DeviceContext::poll`].
//!
//! The expected order of things is:
//!
//! 1. `new` once at startup, then `init`.
//! 2. `open` + `configure` + `activate` for EP0 IN/OUT, then `start` to connect.
//! 3. Call `poll` from the USB interrupt (or a main loop) until it returns
//!    `None`. On `Event::Reset`, activate EP0 again.
//! 4. `send` / `receive` as the class layer sees fit.

use log::{debug, info, trace, warn};

use crate::endpoint::{
    self, Buffering, Endpoint, EndpointStatus, TransferBuffer, TransferType, UsbDir,
    EP_NUMBER_MASK,
};
use crate::pma;
use crate::regs::{
    EndpointRegister, Reg, UsbPeripheral, BCDR, BTABLE_OFFSET, CNTR, DADDR, EPR, ISTR, LPMCSR,
    MAX_ENDPOINTS,
};
use crate::transfer::{self, Completion};
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Constructed, never initialized.
    Reset,
    /// In the middle of `init`.
    Busy,
    Ready,
    /// The peripheral reported something we can't recover from without a
    /// fresh `init`.
    Error,
}

/// Bring-up configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Number of endpoint numbers in use, counting EP0. At most
    /// `MAX_ENDPOINTS`.
    pub endpoint_count: u8,
    /// Accept Link Power Management (L1) requests from the host.
    pub lpm_enable: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            endpoint_count: MAX_ENDPOINTS as u8,
            lpm_enable: false,
        }
    }
}

/// Things `poll` can tell you about.
#[derive(Debug, PartialEq, Eq)]
pub enum Event<'a> {
    /// The host reset the bus. Our address is back to 0 and EP0 needs to be
    /// activated again.
    Reset,
    Suspend,
    Wakeup,
    StartOfFrame,
    /// A start-of-frame was expected and didn't show up.
    MissedStartOfFrame,
    /// The hardware saw a bus error (CRC, bit stuffing, ...). Informational;
    /// the host retries.
    BusError,
    /// The host asked to enter L1 sleep.
    LpmRequest,
    /// Packet memory overrun. The device is now in `DeviceState::Error`.
    Fault,
    /// A SETUP packet arrived on EP0.
    Setup([u8; 8]),
    /// An IN transfer is done; here's the buffer back.
    InComplete { endpoint: u8, data: &'a [u8] },
    /// An OUT transfer is done; `len` bytes of `data` are valid.
    OutComplete { endpoint: u8, data: &'a mut [u8], len: usize },
}

impl<'a> From<Completion<'a>> for Event<'a> {
    fn from(c: Completion<'a>) -> Self {
        match c {
            Completion::In { endpoint, data } => Event::InComplete { endpoint, data },
            Completion::Out { endpoint, data, len } => Event::OutComplete { endpoint, data, len },
        }
    }
}

/// Interrupt sources we run with: everything except packet-memory overrun,
/// which we poll for.
fn interrupt_mask() -> u16 {
    (CNTR::CTRM::SET
        + CNTR::WKUPM::SET
        + CNTR::SUSPM::SET
        + CNTR::ERRM::SET
        + CNTR::SOFM::SET
        + CNTR::ESOFM::SET
        + CNTR::RESETM::SET
        + CNTR::L1REQM::SET)
        .value
}

pub struct DeviceContext<'a, H> {
    hw: H,
    state: DeviceState,
    config: DeviceConfig,
    address: u8,
    endpoints_in: [Endpoint<'a>; MAX_ENDPOINTS],
    endpoints_out: [Endpoint<'a>; MAX_ENDPOINTS],
}

impl<'a, H: UsbPeripheral> DeviceContext<'a, H> {
    pub fn new(hw: H, config: DeviceConfig) -> Self {
        let mut config = config;
        if usize::from(config.endpoint_count) > MAX_ENDPOINTS {
            warn!(
                "{} endpoints requested, hardware has {}",
                config.endpoint_count, MAX_ENDPOINTS
            );
            config.endpoint_count = MAX_ENDPOINTS as u8;
        }
        Self {
            hw,
            state: DeviceState::Reset,
            config,
            address: 0,
            endpoints_in: core::array::from_fn(|i| Endpoint::new(i as u8, UsbDir::In)),
            endpoints_out: core::array::from_fn(|i| Endpoint::new(i as u8, UsbDir::Out)),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn peripheral(&self) -> &H {
        &self.hw
    }

    /// Looks up the endpoint record for `ep_addr`, if it's in range.
    pub fn endpoint(&self, ep_addr: u8) -> Option<&Endpoint<'a>> {
        let number = ep_addr & EP_NUMBER_MASK;
        if number >= self.config.endpoint_count {
            return None;
        }
        Some(match UsbDir::of_endpoint_addr(ep_addr) {
            UsbDir::In => &self.endpoints_in[usize::from(number)],
            UsbDir::Out => &self.endpoints_out[usize::from(number)],
        })
    }

    /// The peripheral, plus the endpoint record for `ep_addr`. Returned
    /// together so that callers can hold both at once.
    fn slot(&mut self, ep_addr: u8) -> Result<(&H, &mut Endpoint<'a>), Error> {
        let number = ep_addr & EP_NUMBER_MASK;
        if number >= self.config.endpoint_count {
            return Err(Error::InvalidEndpoint);
        }
        let ep = match UsbDir::of_endpoint_addr(ep_addr) {
            UsbDir::In => &mut self.endpoints_in[usize::from(number)],
            UsbDir::Out => &mut self.endpoints_out[usize::from(number)],
        };
        Ok((&self.hw, ep))
    }

    //////////////////////////////////////////////////////////////////////////
    // Bring-up.

    /// Resets the peripheral and our view of it. Interrupts stay masked and
    /// the pull-up stays off until `start`.
    pub fn init(&mut self) {
        self.state = DeviceState::Busy;

        self.disable_interrupts();

        for ep in self.endpoints_in.iter_mut().chain(self.endpoints_out.iter_mut()) {
            ep.reset();
        }

        // Pulse the force-reset bit to get the core into a known state.
        self.hw.write16(Reg::Cntr, CNTR::FRES::SET.value);
        self.hw.write16(Reg::Cntr, 0);

        // Drop anything that was pending before the reset.
        self.hw.write16(Reg::Istr, 0);

        self.hw.write16(Reg::Btable, BTABLE_OFFSET);

        self.address = 0;

        if self.config.lpm_enable {
            self.hw.write16(Reg::Lpmcsr, (LPMCSR::LPMEN::SET + LPMCSR::LPMACK::SET).value);
        }

        self.state = DeviceState::Ready;
        info!("usb: ready, {} endpoints", self.config.endpoint_count);
    }

    /// Clears anything pending, then unmasks our interrupt sources in one
    /// write.
    pub fn enable_interrupts(&mut self) {
        self.hw.write16(Reg::Istr, 0);
        self.hw.write16(Reg::Cntr, interrupt_mask());
    }

    pub fn disable_interrupts(&mut self) {
        let cntr = self.hw.control().get();
        self.hw.write16(Reg::Cntr, cntr & !interrupt_mask());
    }

    /// Unmasks interrupts and turns on the D+ pull-up. This is the point where
    /// the host notices us.
    pub fn start(&mut self) {
        self.enable_interrupts();
        let bcdr = self.hw.read16(Reg::Bcdr);
        self.hw.write16(Reg::Bcdr, bcdr | BCDR::DPPU::SET.value);
        debug!("usb: pull-up on");
    }

    /// Disconnects from the bus.
    pub fn stop(&mut self) {
        self.disable_interrupts();
        let bcdr = self.hw.read16(Reg::Bcdr);
        self.hw.write16(Reg::Bcdr, bcdr & !BCDR::DPPU::SET.value);
        debug!("usb: pull-up off");
    }

    /// Starts driving resume signaling, to wake a suspended host. The host
    /// expects this for 1-15 ms before `deactivate_remote_wakeup`.
    pub fn activate_remote_wakeup(&mut self) {
        let cntr = self.hw.control().get();
        self.hw.write16(Reg::Cntr, cntr | CNTR::RESUME::SET.value);
    }

    pub fn deactivate_remote_wakeup(&mut self) {
        let cntr = self.hw.control().get();
        self.hw.write16(Reg::Cntr, cntr & !CNTR::RESUME::SET.value);
    }

    /// Moves the device to `address` and keeps the function enabled.
    ///
    /// Note that USB requires the status stage of SET_ADDRESS to complete at
    /// the _old_ address, so the upper stack should call this after that IN
    /// completes.
    pub fn set_address(&mut self, address: u8) {
        self.address = address & 0x7F;
        self.hw.write16(
            Reg::Daddr,
            (DADDR::EF::SET + DADDR::ADD.val(u16::from(self.address))).value,
        );
        debug!("usb: address {}", self.address);
    }

    //////////////////////////////////////////////////////////////////////////
    // Endpoint registry and lifecycle.

    /// Records what the upper stack's endpoint descriptor says about
    /// `ep_addr`.
    pub fn open(
        &mut self,
        ep_addr: u8,
        kind: TransferType,
        max_packet_size: u16,
    ) -> Result<(), Error> {
        let (_, ep) = self.slot(ep_addr)?;
        ep.open(kind, max_packet_size)
    }

    /// Sets the buffering mode and packet-memory location(s) for `ep_addr`.
    /// Overlapping regions are not detected.
    pub fn configure(&mut self, ep_addr: u8, buffering: Buffering) -> Result<(), Error> {
        let (_, ep) = self.slot(ep_addr)?;
        ep.configure(buffering);
        Ok(())
    }

    pub fn activate(&mut self, ep_addr: u8) -> Result<(), Error> {
        let (hw, ep) = self.slot(ep_addr)?;
        endpoint::activate(hw, ep)
    }

    /// Turns `ep_addr` off. Anything in flight is abandoned.
    pub fn deactivate(&mut self, ep_addr: u8) -> Result<(), Error> {
        let (hw, ep) = self.slot(ep_addr)?;
        endpoint::deactivate(hw, ep);
        ep.abandon();
        Ok(())
    }

    /// Stalls `ep_addr`. Out-of-range endpoints are refused without touching
    /// the hardware.
    pub fn stall(&mut self, ep_addr: u8) -> Result<(), Error> {
        let (hw, ep) = self.slot(ep_addr).map_err(|e| {
            warn!("stall of unknown ep {:#04x} ignored", ep_addr);
            e
        })?;
        endpoint::stall(hw, ep);
        Ok(())
    }

    pub fn clear_stall(&mut self, ep_addr: u8) -> Result<(), Error> {
        let (hw, ep) = self.slot(ep_addr)?;
        endpoint::clear_stall(hw, ep);
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Transfers.

    /// Runs one scheduling step on `ep_addr`.
    pub fn start_transfer(&mut self, ep_addr: u8) -> Result<(), Error> {
        let (hw, ep) = self.slot(ep_addr)?;
        transfer::start_transfer(hw, ep)
    }

    /// Starts sending `data` on IN endpoint `ep_addr`. The buffer comes back in
    /// `Event::InComplete`.
    pub fn send(&mut self, ep_addr: u8, data: &'a [u8]) -> Result<(), Error> {
        if self.state != DeviceState::Ready {
            return Err(Error::NotReady);
        }
        if UsbDir::of_endpoint_addr(ep_addr) != UsbDir::In {
            return Err(Error::InvalidEndpoint);
        }
        let (hw, ep) = self.slot(ep_addr)?;
        if ep.kind.is_none() {
            return Err(Error::InvalidEndpointType);
        }
        ep.buffer = TransferBuffer::In(data);
        ep.offset = 0;
        ep.transfer_count = 0;
        ep.remaining_length = data.len();
        ep.remaining_length_secondary = data.len();
        trace!("ep {:#04x}: send {} bytes", ep_addr, data.len());
        transfer::start_transfer(hw, ep)
    }

    /// Starts receiving into `buffer` on OUT endpoint `ep_addr`. The transfer
    /// ends when the buffer is full or the host sends a short packet; either
    /// way the buffer comes back in `Event::OutComplete`.
    pub fn receive(&mut self, ep_addr: u8, buffer: &'a mut [u8]) -> Result<(), Error> {
        if self.state != DeviceState::Ready {
            return Err(Error::NotReady);
        }
        if UsbDir::of_endpoint_addr(ep_addr) != UsbDir::Out {
            return Err(Error::InvalidEndpoint);
        }
        let (hw, ep) = self.slot(ep_addr)?;
        if ep.kind.is_none() {
            return Err(Error::InvalidEndpointType);
        }
        let len = buffer.len();
        ep.buffer = TransferBuffer::Out(buffer);
        ep.offset = 0;
        ep.transfer_count = 0;
        ep.remaining_length = len;
        ep.remaining_length_secondary = len;
        trace!("ep {:#04x}: receive up to {} bytes", ep_addr, len);
        transfer::start_transfer(hw, ep)
    }

    /// Abandons the `send` in flight on IN endpoint `ep_addr` and hands its
    /// data back, or `None` if there wasn't one. A direction that was armed is
    /// left idle; a stall is left alone.
    pub fn abort_in(&mut self, ep_addr: u8) -> Result<Option<&'a [u8]>, Error> {
        if UsbDir::of_endpoint_addr(ep_addr) != UsbDir::In {
            return Err(Error::InvalidEndpoint);
        }
        let (hw, ep) = self.slot(ep_addr)?;
        let reg = EndpointRegister::new(hw, ep.number);
        if reg.tx_status() == EndpointStatus::Valid {
            reg.set_tx_status(ep.kind.map_or(EndpointStatus::Nak, |k| k.idle_in_status()));
        }
        Ok(match ep.abandon() {
            TransferBuffer::In(data) => {
                debug!("ep {:#04x}: send aborted", ep_addr);
                Some(data)
            }
            _ => None,
        })
    }

    /// Abandons the `receive` in flight on OUT endpoint `ep_addr` and hands
    /// its buffer back, or `None` if there wasn't one. Whatever was stored so
    /// far is left in the buffer. The endpoint NAKs until the next `receive`,
    /// though EP0 still takes SETUP packets.
    pub fn abort_out(&mut self, ep_addr: u8) -> Result<Option<&'a mut [u8]>, Error> {
        if UsbDir::of_endpoint_addr(ep_addr) != UsbDir::Out {
            return Err(Error::InvalidEndpoint);
        }
        let (hw, ep) = self.slot(ep_addr)?;
        let reg = EndpointRegister::new(hw, ep.number);
        if reg.rx_status() == EndpointStatus::Valid {
            reg.set_rx_status(EndpointStatus::Nak);
        }
        Ok(match ep.abandon() {
            TransferBuffer::Out(data) => {
                debug!("ep {:#04x}: receive aborted", ep_addr);
                Some(data)
            }
            _ => None,
        })
    }

    //////////////////////////////////////////////////////////////////////////
    // Interrupt handling.

    /// Services one pending condition and tells you about it, or returns
    /// `None` if there's nothing (more) to report. Call it until it does.
    ///
    /// Endpoint completions come first, since they're what keeps data moving.
    pub fn poll(&mut self) -> Option<Event<'a>> {
        loop {
            let istr = self.hw.interrupt_status();

            if istr.is_set(ISTR::CTR) {
                let number = istr.read(ISTR::EP_ID) as u8;
                match self.service_endpoint(number) {
                    Some(event) => return Some(event),
                    // Continuation handled internally; see if anything else
                    // is pending.
                    None => continue,
                }
            }

            if istr.is_set(ISTR::PMAOVR) {
                self.clear_flag(ISTR::PMAOVR::SET.value);
                self.state = DeviceState::Error;
                warn!("usb: packet memory overrun");
                return Some(Event::Fault);
            }

            if istr.is_set(ISTR::RESET) {
                self.clear_flag(ISTR::RESET::SET.value);
                self.set_address(0);
                debug!("usb: bus reset");
                return Some(Event::Reset);
            }

            if istr.is_set(ISTR::ERR) {
                self.clear_flag(ISTR::ERR::SET.value);
                return Some(Event::BusError);
            }

            if istr.is_set(ISTR::WKUP) {
                let cntr = self.hw.control().get();
                self.hw.write16(
                    Reg::Cntr,
                    cntr & !(CNTR::LP_MODE::SET + CNTR::FSUSP::SET).value,
                );
                self.clear_flag(ISTR::WKUP::SET.value);
                debug!("usb: wakeup");
                return Some(Event::Wakeup);
            }

            if istr.is_set(ISTR::SUSP) {
                // Force suspend, then drop into low-power mode. The order
                // matters.
                let cntr = self.hw.control().get() | CNTR::FSUSP::SET.value;
                self.hw.write16(Reg::Cntr, cntr);
                self.clear_flag(ISTR::SUSP::SET.value);
                self.hw.write16(Reg::Cntr, cntr | CNTR::LP_MODE::SET.value);
                debug!("usb: suspend");
                return Some(Event::Suspend);
            }

            if istr.is_set(ISTR::L1REQ) {
                self.clear_flag(ISTR::L1REQ::SET.value);
                return Some(Event::LpmRequest);
            }

            if istr.is_set(ISTR::SOF) {
                self.clear_flag(ISTR::SOF::SET.value);
                return Some(Event::StartOfFrame);
            }

            if istr.is_set(ISTR::ESOF) {
                self.clear_flag(ISTR::ESOF::SET.value);
                return Some(Event::MissedStartOfFrame);
            }

            return None;
        }
    }

    /// `ISTR` flags are write-zero-to-clear, so write ones everywhere else.
    fn clear_flag(&self, flag: u16) {
        self.hw.write16(Reg::Istr, !flag);
    }

    fn service_endpoint(&mut self, number: u8) -> Option<Event<'a>> {
        let reg = EndpointRegister::new(&self.hw, number);
        let epr = reg.read();

        if number >= self.config.endpoint_count {
            // Nobody to hand this to. Acknowledge it anyway or CTR never
            // drops and we spin.
            warn!("usb: completion on unconfigured ep {}", number);
            reg.clear_ctr_rx();
            reg.clear_ctr_tx();
            return None;
        }

        if epr.is_set(EPR::CTR_RX) {
            reg.clear_ctr_rx();
            let ep = &mut self.endpoints_out[usize::from(number)];
            if epr.is_set(EPR::SETUP) {
                let mut setup = [0; 8];
                pma::read(&self.hw, &mut setup, reg.rx_address(), reg.rx_count());
                trace!("usb: setup {:02x?}", setup);
                return Some(Event::Setup(setup));
            }
            return transfer::complete_out(&self.hw, ep).map(Event::from);
        }

        if epr.is_set(EPR::CTR_TX) {
            reg.clear_ctr_tx();
            let ep = &mut self.endpoints_in[usize::from(number)];
            return transfer::complete_in(&self.hw, ep).map(Event::from);
        }

        None
    }
}
