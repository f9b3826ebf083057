// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint records, and the endpoint lifecycle: activate, deactivate, stall.
//!
//! An `Endpoint` is the driver's memory of what one direction of one endpoint
//! number is configured as, plus the bookkeeping for whatever transfer is in
//! flight on it. The hardware has its own copy of some of this (type, status,
//! toggles) in `EPnR`; the lifecycle functions here are what keep the two in
//! agreement.

use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::pma;
use crate::regs::{EndpointRegister, UsbPeripheral};
use crate::Error;

/// Largest packet the buffer-descriptor count fields can describe.
pub const MAX_PACKET_SIZE: u16 = 1023;

/// Transfer direction, from the host's point of view. Encoded in bit 7 of an
/// endpoint address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Bits of an endpoint address that hold the endpoint number.
pub const EP_NUMBER_MASK: u8 = 0x0F;

/// Types of transfer, using the values from the `attributes` field of an
/// endpoint descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Encoding of this type in the `EP_TYPE` field of `EPnR`, which -- of
    /// course -- doesn't match the descriptor encoding.
    pub fn register_bits(self) -> u16 {
        match self {
            Self::Bulk => 0,
            Self::Control => 1,
            Self::Isochronous => 2,
            Self::Interrupt => 3,
        }
    }

    /// Status an IN direction sits in while it has nothing to send.
    /// Isochronous endpoints don't handshake, so they can't NAK.
    pub fn idle_in_status(self) -> EndpointStatus {
        match self {
            Self::Isochronous => EndpointStatus::Disabled,
            _ => EndpointStatus::Nak,
        }
    }
}

/// Values of the `STAT_RX`/`STAT_TX` fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum EndpointStatus {
    Disabled = 0,
    Stall = 1,
    Nak = 2,
    Valid = 3,
}

impl EndpointStatus {
    pub fn from_bits(bits: u16) -> Self {
        Self::from_u16(bits & 0b11).unwrap_or(Self::Disabled)
    }
}

/// Where an endpoint's data lives in packet memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Buffering {
    Single { addr: u16 },
    /// Ping-pong between two buffers. The two regions must not overlap each
    /// other or any other endpoint's; nobody checks.
    Double { addr0: u16, addr1: u16 },
}

impl Default for Buffering {
    fn default() -> Self {
        Self::Single { addr: 0 }
    }
}

/// The caller's storage for the transfer currently in flight, if any.
#[derive(Debug, Default)]
pub(crate) enum TransferBuffer<'a> {
    #[default]
    Idle,
    In(&'a [u8]),
    Out(&'a mut [u8]),
}

#[derive(Debug)]
pub struct Endpoint<'a> {
    pub(crate) number: u8,
    pub(crate) direction: UsbDir,
    /// `None` until the upper stack opens the endpoint with a descriptor.
    pub(crate) kind: Option<TransferType>,
    pub(crate) max_packet_size: u16,
    pub(crate) buffering: Buffering,
    pub(crate) buffer: TransferBuffer<'a>,
    /// Next byte of `buffer` to hand to (IN) or fill from (OUT) packet memory.
    pub(crate) offset: usize,
    pub(crate) remaining_length: usize,
    /// Bytes of a double-buffered transfer not yet written into packet
    /// memory.
    pub(crate) remaining_length_secondary: usize,
    pub(crate) transfer_count: usize,
    pub(crate) stalled: bool,
}

impl<'a> Endpoint<'a> {
    pub(crate) fn new(number: u8, direction: UsbDir) -> Self {
        Self {
            number,
            direction,
            kind: None,
            max_packet_size: 0,
            buffering: Buffering::default(),
            buffer: TransferBuffer::Idle,
            offset: 0,
            remaining_length: 0,
            remaining_length_secondary: 0,
            transfer_count: 0,
            stalled: false,
        }
    }

    /// Back to the zeroed state, keeping only which slot this is.
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.number, self.direction);
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn direction(&self) -> UsbDir {
        self.direction
    }

    pub fn address(&self) -> u8 {
        self.direction.endpoint(self.number)
    }

    pub fn kind(&self) -> Option<TransferType> {
        self.kind
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn buffering(&self) -> Buffering {
        self.buffering
    }

    pub fn remaining_length(&self) -> usize {
        self.remaining_length
    }

    pub fn remaining_length_secondary(&self) -> usize {
        self.remaining_length_secondary
    }

    pub fn transfer_count(&self) -> usize {
        self.transfer_count
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.buffer, TransferBuffer::Idle)
    }

    /// Records descriptor data from the upper stack.
    pub(crate) fn open(&mut self, kind: TransferType, max_packet_size: u16) -> Result<(), Error> {
        if max_packet_size == 0 || max_packet_size > MAX_PACKET_SIZE {
            return Err(Error::InvalidPacketSize);
        }
        self.kind = Some(kind);
        self.max_packet_size = max_packet_size;
        Ok(())
    }

    /// Picks single or double buffering and where in packet memory. Doing it
    /// again just overwrites the old setting.
    pub(crate) fn configure(&mut self, buffering: Buffering) {
        self.buffering = buffering;
    }

    /// Copies up to `len` bytes from the caller's IN buffer into packet memory
    /// at `addr`, advancing the cursor. Returns how many bytes went.
    pub(crate) fn load_packet<H: UsbPeripheral>(&mut self, hw: &H, addr: u16, len: usize) -> usize {
        let TransferBuffer::In(data) = &self.buffer else {
            return 0;
        };
        let start = self.offset.min(data.len());
        let end = (start + len).min(data.len());
        let chunk = &data[start..end];
        pma::write(hw, chunk, addr, chunk.len());
        self.offset = end;
        chunk.len()
    }

    /// Copies a received packet of `count` bytes out of packet memory at
    /// `addr` into the caller's OUT buffer. Bytes that don't fit are dropped.
    pub(crate) fn store_packet<H: UsbPeripheral>(
        &mut self,
        hw: &H,
        addr: u16,
        count: usize,
    ) -> usize {
        let TransferBuffer::Out(data) = &mut self.buffer else {
            return 0;
        };
        let start = self.offset.min(data.len());
        let end = (start + count).min(data.len());
        let stored = end - start;
        pma::read(hw, &mut data[start..end], addr, stored);
        self.offset = end;
        stored
    }

    pub(crate) fn take_buffer(&mut self) -> TransferBuffer<'a> {
        core::mem::take(&mut self.buffer)
    }

    /// Forgets the transfer in flight, handing back its buffer.
    pub(crate) fn abandon(&mut self) -> TransferBuffer<'a> {
        self.offset = 0;
        self.remaining_length = 0;
        self.remaining_length_secondary = 0;
        self.transfer_count = 0;
        self.take_buffer()
    }
}

////////////////////////////////////////////////////////////////////////////
// Lifecycle.

/// Programs the hardware for an opened, configured endpoint.
pub(crate) fn activate<H: UsbPeripheral>(hw: &H, ep: &Endpoint<'_>) -> Result<(), Error> {
    let kind = ep.kind.ok_or(Error::InvalidEndpointType)?;
    let reg = EndpointRegister::new(hw, ep.number);

    reg.set_type(kind);
    reg.set_address(ep.number);

    match ep.buffering {
        Buffering::Single { addr } => match ep.direction {
            UsbDir::In => {
                reg.set_tx_address(addr);
                reg.clear_tx_toggle();
                reg.set_tx_status(kind.idle_in_status());
            }
            UsbDir::Out => {
                reg.set_rx_address(addr);
                reg.set_rx_count(ep.max_packet_size);
                reg.clear_rx_toggle();
                // EP0 has to be ready for a SETUP the moment we're reset.
                if ep.number == 0 {
                    reg.set_rx_status(EndpointStatus::Valid);
                } else {
                    reg.set_rx_status(EndpointStatus::Nak);
                }
            }
        },
        Buffering::Double { addr0, addr1 } => {
            // On bulk endpoints EP_KIND means DBL_BUF. Isochronous endpoints are
            // double-buffered by nature and EP_KIND must stay clear.
            if kind == TransferType::Bulk {
                reg.set_kind();
            } else {
                reg.clear_kind();
            }
            reg.set_double_buffer_addresses(addr0, addr1);
            reg.clear_rx_toggle();
            reg.clear_tx_toggle();

            match ep.direction {
                UsbDir::Out => {
                    reg.set_double_buffer_counts(UsbDir::Out, usize::from(ep.max_packet_size));
                    // Software keeps buffer 1 so the hardware can take the
                    // first packet into buffer 0.
                    if kind == TransferType::Bulk {
                        reg.free_user_buffer(UsbDir::Out);
                    }
                    reg.set_rx_status(EndpointStatus::Valid);
                    reg.set_tx_status(EndpointStatus::Disabled);
                }
                UsbDir::In => {
                    reg.set_tx_status(kind.idle_in_status());
                    reg.set_rx_status(EndpointStatus::Disabled);
                }
            }
        }
    }

    debug!(
        "activated ep {:#04x} as {:?}, {:?}, mps {}",
        ep.address(),
        kind,
        ep.buffering,
        ep.max_packet_size
    );
    Ok(())
}

pub(crate) fn deactivate<H: UsbPeripheral>(hw: &H, ep: &Endpoint<'_>) {
    let reg = EndpointRegister::new(hw, ep.number);
    match ep.buffering {
        Buffering::Single { .. } => match ep.direction {
            UsbDir::In => {
                reg.clear_tx_toggle();
                reg.set_tx_status(EndpointStatus::Disabled);
            }
            UsbDir::Out => {
                reg.clear_rx_toggle();
                reg.set_rx_status(EndpointStatus::Disabled);
            }
        },
        Buffering::Double { .. } => {
            // Both toggles double as ping-pong pointers here, so both go back
            // to zero or the next activation starts on the wrong buffer.
            reg.clear_rx_toggle();
            reg.clear_tx_toggle();
            reg.set_rx_status(EndpointStatus::Disabled);
            reg.set_tx_status(EndpointStatus::Disabled);
        }
    }
    debug!("deactivated ep {:#04x}", ep.address());
}

pub(crate) fn stall<H: UsbPeripheral>(hw: &H, ep: &mut Endpoint<'_>) {
    ep.stalled = true;
    let reg = EndpointRegister::new(hw, ep.number);
    match ep.direction {
        UsbDir::In => reg.set_tx_status(EndpointStatus::Stall),
        UsbDir::Out => reg.set_rx_status(EndpointStatus::Stall),
    }
    warn!("stalled ep {:#04x}", ep.address());
}

pub(crate) fn clear_stall<H: UsbPeripheral>(hw: &H, ep: &mut Endpoint<'_>) {
    ep.stalled = false;
    if let Buffering::Double { .. } = ep.buffering {
        return;
    }
    let reg = EndpointRegister::new(hw, ep.number);
    match ep.direction {
        UsbDir::In => {
            reg.clear_tx_toggle();
            if let Some(kind) = ep.kind {
                reg.set_tx_status(kind.idle_in_status());
            }
        }
        UsbDir::Out => {
            reg.clear_rx_toggle();
            reg.set_rx_status(EndpointStatus::Valid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::EPR;
    use crate::sim::SimulatedUsb;

    fn opened(
        number: u8,
        dir: UsbDir,
        kind: TransferType,
        buffering: Buffering,
    ) -> Endpoint<'static> {
        let mut ep = Endpoint::new(number, dir);
        ep.open(kind, 64).unwrap();
        ep.configure(buffering);
        ep
    }

    #[test]
    fn addresses() {
        assert_eq!(UsbDir::In.endpoint(1), 0x81);
        assert_eq!(UsbDir::of_endpoint_addr(0x82), UsbDir::In);
        assert_eq!(UsbDir::of_endpoint_addr(0x02), UsbDir::Out);
    }

    #[test]
    fn open_rejects_bad_sizes() {
        let mut ep = Endpoint::new(1, UsbDir::In);
        assert_eq!(ep.open(TransferType::Bulk, 0), Err(Error::InvalidPacketSize));
        assert_eq!(ep.open(TransferType::Bulk, 1024), Err(Error::InvalidPacketSize));
        assert_eq!(ep.kind(), None);
    }

    #[test]
    fn activate_needs_a_type() {
        let hw = SimulatedUsb::new();
        let ep = Endpoint::new(1, UsbDir::In);
        assert_eq!(activate(&hw, &ep), Err(Error::InvalidEndpointType));
        assert_eq!(hw.writes(), 0);
    }

    #[test]
    fn ep0_out_starts_valid() {
        let hw = SimulatedUsb::new();
        let ep = opened(0, UsbDir::Out, TransferType::Control, Buffering::Single { addr: 0x40 });
        activate(&hw, &ep).unwrap();
        let reg = EndpointRegister::new(&hw, 0);
        assert_eq!(reg.rx_status(), EndpointStatus::Valid);
        assert_eq!(reg.rx_address(), 0x40);
        assert_eq!(reg.read().read(EPR::EP_TYPE), TransferType::Control.register_bits());
    }

    #[test]
    fn other_out_starts_nak_and_iso_in_starts_disabled() {
        let hw = SimulatedUsb::new();
        let out = opened(2, UsbDir::Out, TransferType::Bulk, Buffering::Single { addr: 0x80 });
        activate(&hw, &out).unwrap();
        assert_eq!(EndpointRegister::new(&hw, 2).rx_status(), EndpointStatus::Nak);

        let single = Buffering::Single { addr: 0xC0 };
        let iso = opened(3, UsbDir::In, TransferType::Isochronous, single);
        activate(&hw, &iso).unwrap();
        assert_eq!(EndpointRegister::new(&hw, 3).tx_status(), EndpointStatus::Disabled);
    }

    #[test]
    fn double_buffered_bulk_sets_dbl_buf() {
        let hw = SimulatedUsb::new();
        let ep = opened(
            1,
            UsbDir::In,
            TransferType::Bulk,
            Buffering::Double { addr0: 0x80, addr1: 0xC0 },
        );
        activate(&hw, &ep).unwrap();
        let reg = EndpointRegister::new(&hw, 1);
        assert!(reg.read().is_set(EPR::EP_KIND));
        assert_eq!(reg.tx_address(), 0x80);
        assert_eq!(reg.rx_address(), 0xC0);
        assert_eq!(reg.tx_status(), EndpointStatus::Nak);
        assert_eq!(reg.rx_status(), EndpointStatus::Disabled);
    }

    #[test]
    fn double_buffered_bulk_out_lends_buffer_zero() {
        let hw = SimulatedUsb::new();
        let ep = opened(
            1,
            UsbDir::Out,
            TransferType::Bulk,
            Buffering::Double { addr0: 0x80, addr1: 0xC0 },
        );
        activate(&hw, &ep).unwrap();
        let epr = EndpointRegister::new(&hw, 1).read();
        // Hardware fills buffer DTOG_RX; software holds buffer DTOG_TX.
        assert!(!epr.is_set(EPR::DTOG_RX));
        assert!(epr.is_set(EPR::DTOG_TX));
        assert!(hw.host_out(1, &[1, 2, 3]));
    }

    #[test]
    fn activate_then_deactivate_leaves_everything_off() {
        let layouts = [
            Buffering::Single { addr: 0x80 },
            Buffering::Double { addr0: 0x80, addr1: 0xC0 },
        ];
        let kinds = [
            TransferType::Control,
            TransferType::Bulk,
            TransferType::Interrupt,
            TransferType::Isochronous,
        ];
        for buffering in layouts {
            for kind in kinds {
                for number in 0..8u8 {
                    let hw = SimulatedUsb::new();
                    // Start from junk: every toggle and status bit set.
                    hw.force_endpoint(number, 0x7070);
                    let ep_in = opened(number, UsbDir::In, kind, buffering);
                    let ep_out = opened(number, UsbDir::Out, kind, buffering);
                    activate(&hw, &ep_in).unwrap();
                    activate(&hw, &ep_out).unwrap();
                    deactivate(&hw, &ep_in);
                    deactivate(&hw, &ep_out);

                    let reg = EndpointRegister::new(&hw, number);
                    let epr = reg.read();
                    assert_eq!(reg.tx_status(), EndpointStatus::Disabled);
                    assert_eq!(reg.rx_status(), EndpointStatus::Disabled);
                    assert!(!epr.is_set(EPR::DTOG_TX), "{:?} {:?} ep{}", buffering, kind, number);
                    assert!(!epr.is_set(EPR::DTOG_RX), "{:?} {:?} ep{}", buffering, kind, number);
                }
            }
        }
    }

    #[test]
    fn stall_and_clear() {
        let hw = SimulatedUsb::new();
        let single = Buffering::Single { addr: 0x80 };
        let mut ep = opened(1, UsbDir::In, TransferType::Interrupt, single);
        activate(&hw, &ep).unwrap();
        stall(&hw, &mut ep);
        assert!(ep.is_stalled());
        assert_eq!(EndpointRegister::new(&hw, 1).tx_status(), EndpointStatus::Stall);
        clear_stall(&hw, &mut ep);
        assert!(!ep.is_stalled());
        assert_eq!(EndpointRegister::new(&hw, 1).tx_status(), EndpointStatus::Nak);
    }
}
