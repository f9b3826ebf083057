// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer scheduling.
//!
//! A logical transfer ("send these 200 bytes on EP1 IN") is moved one step at
//! a time. [`start_transfer`] does exactly one step: it puts the next packet
//! (or two, for double-buffered bulk IN) into packet memory, or readies the
//! endpoint to receive, and then marks the direction `Valid` so the hardware
//! can do the wire transaction on its own. When the hardware reports the
//! transaction done, [`complete_in`] / [`complete_out`] do the bookkeeping and
//! either call `start_transfer` again or report the transfer finished.
//!
//! Nothing here blocks, retries, or allocates. Retransmission is the host's
//! and the hardware's business.

use log::{trace, warn};

use crate::endpoint::{Buffering, Endpoint, EndpointStatus, TransferBuffer, TransferType, UsbDir};
use crate::regs::{EndpointRegister, PingPong, UsbPeripheral, EPR};
use crate::Error;

/// A finished transfer, with the caller's buffer handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum Completion<'a> {
    In { endpoint: u8, data: &'a [u8] },
    Out { endpoint: u8, data: &'a mut [u8], len: usize },
}

/// Performs one scheduling step on `ep`.
pub(crate) fn start_transfer<H: UsbPeripheral>(hw: &H, ep: &mut Endpoint<'_>) -> Result<(), Error> {
    let kind = ep.kind.ok_or(Error::InvalidEndpointType)?;
    let reg = EndpointRegister::new(hw, ep.number);
    match ep.direction {
        UsbDir::In => start_in(&reg, ep, kind),
        UsbDir::Out => start_out(&reg, ep, kind),
    }
}

fn start_in<H: UsbPeripheral>(
    reg: &EndpointRegister<'_, H>,
    ep: &mut Endpoint<'_>,
    kind: TransferType,
) -> Result<(), Error> {
    let mps = usize::from(ep.max_packet_size);

    match ep.buffering {
        Buffering::Single { addr } => {
            let len = ep.remaining_length.min(mps);
            let written = ep.load_packet(reg.hw(), addr, len);
            reg.set_tx_count(written);
            trace!("ep {:#04x}: queued {} bytes", ep.address(), written);
        }
        Buffering::Double { addr0, addr1 } if kind == TransferType::Bulk => {
            if ep.remaining_length_secondary > mps {
                reg.set_kind();
                // Fill the buffer DTOG_TX points at and hand it over, then
                // fill the other one and hold on to it until the first has
                // gone out.
                claim_in_buffers(reg);
                let first = free_in_buffer(reg);
                fill_in_buffer(reg, ep, first, addr0, addr1, mps);
                reg.free_user_buffer(UsbDir::In);
                let next = ep.remaining_length_secondary.min(mps);
                fill_in_buffer(reg, ep, first.other(), addr0, addr1, next);
            } else {
                // Last packet. Dropping back to single-buffered mode saves us
                // from juggling a half-empty ping-pong pair at the end.
                reg.clear_kind();
                let len = ep.remaining_length_secondary;
                let written = ep.load_packet(reg.hw(), addr0, len);
                ep.remaining_length_secondary -= written;
                reg.set_tx_count(written);
                trace!("ep {:#04x}: last {} bytes, single-buffered", ep.address(), written);
            }
        }
        Buffering::Double { addr0, addr1 } => {
            // Isochronous: one packet per frame, so one buffer per step.
            let len = ep.remaining_length_secondary.min(mps);
            fill_in_buffer(reg, ep, free_in_buffer(reg), addr0, addr1, len);
        }
    }

    reg.set_tx_status(EndpointStatus::Valid);
    Ok(())
}

/// Points `SW_BUF` at the buffer `DTOG_TX` selects, so the hardware NAKs INs
/// until we release it. Only safe when neither buffer holds unsent data.
fn claim_in_buffers<H: UsbPeripheral>(reg: &EndpointRegister<'_, H>) {
    let epr = reg.read();
    if epr.is_set(EPR::DTOG_TX) != epr.is_set(EPR::DTOG_RX) {
        reg.free_user_buffer(UsbDir::In);
    }
}

/// Which of a double-buffered IN endpoint's buffers software may fill next,
/// going by the hardware's current `DTOG_TX`.
fn free_in_buffer<H: UsbPeripheral>(reg: &EndpointRegister<'_, H>) -> PingPong {
    if reg.read().is_set(EPR::DTOG_TX) {
        PingPong::One
    } else {
        PingPong::Zero
    }
}

fn fill_in_buffer<H: UsbPeripheral>(
    reg: &EndpointRegister<'_, H>,
    ep: &mut Endpoint<'_>,
    buffer: PingPong,
    addr0: u16,
    addr1: u16,
    len: usize,
) {
    let written = ep.load_packet(reg.hw(), buffer.select(addr0, addr1), len);
    reg.set_buffer_count(UsbDir::In, buffer, written);
    ep.remaining_length_secondary = ep.remaining_length_secondary.saturating_sub(written);
    trace!("ep {:#04x}: queued {} bytes in {:?}", ep.address(), written, buffer);
}

fn start_out<H: UsbPeripheral>(
    reg: &EndpointRegister<'_, H>,
    ep: &mut Endpoint<'_>,
    kind: TransferType,
) -> Result<(), Error> {
    let mps = usize::from(ep.max_packet_size);

    match (ep.buffering, kind) {
        (Buffering::Single { .. }, _) => {
            if ep.remaining_length == 0 && kind == TransferType::Control {
                // Zero-length OUT on a control endpoint is the status stage;
                // STATUS_OUT makes the hardware reject anything longer.
                reg.set_kind();
            } else {
                reg.clear_kind();
            }
            reg.set_rx_count(ep.max_packet_size);
            ep.remaining_length = ep.remaining_length.saturating_sub(mps);
        }
        (Buffering::Double { .. }, TransferType::Bulk) => {
            if ep.transfer_count == 0 {
                reg.set_double_buffer_counts(UsbDir::Out, mps);
            }
            // Every packet the hardware takes leaves DTOG_RX equal to SW_BUF,
            // and it NAKs until we hand the buffer we just emptied back.
            let epr = reg.read();
            if epr.is_set(EPR::DTOG_RX) == epr.is_set(EPR::DTOG_TX) {
                reg.free_user_buffer(UsbDir::Out);
            }
            ep.remaining_length = ep.remaining_length.saturating_sub(mps);
        }
        (Buffering::Double { .. }, TransferType::Isochronous) => {
            // Full speed isochronous is one packet per frame; no spanning.
            ep.remaining_length = 0;
        }
        (Buffering::Double { .. }, _) => {
            warn!(
                "ep {:#04x}: double-buffered {:?} OUT is not supported",
                ep.address(),
                kind
            );
            return Err(Error::UnsupportedBuffering);
        }
    }

    reg.set_rx_status(EndpointStatus::Valid);
    Ok(())
}

/// Handles a finished IN transaction on `ep`. The caller has already cleared
/// `CTR_TX`.
pub(crate) fn complete_in<'a, H: UsbPeripheral>(
    hw: &H,
    ep: &mut Endpoint<'a>,
) -> Option<Completion<'a>> {
    let kind = ep.kind?;
    let reg = EndpointRegister::new(hw, ep.number);
    let epr = reg.read();

    let sent = match ep.buffering {
        Buffering::Double { .. }
            if kind != TransferType::Bulk || epr.is_set(EPR::EP_KIND) =>
        {
            // The hardware has already moved DTOG_TX on to the next buffer, so
            // the one just sent is the one it doesn't point at.
            if epr.is_set(EPR::DTOG_TX) {
                reg.buffer_count(PingPong::Zero)
            } else {
                reg.buffer_count(PingPong::One)
            }
        }
        _ => reg.tx_count(),
    };

    ep.remaining_length = ep.remaining_length.saturating_sub(sent);
    ep.transfer_count += sent;

    if ep.remaining_length == 0 {
        return match ep.take_buffer() {
            TransferBuffer::In(data) => Some(Completion::In {
                endpoint: ep.address(),
                data,
            }),
            _ => None,
        };
    }

    if kind == TransferType::Bulk && epr.is_set(EPR::EP_KIND) {
        // The other buffer is still queued. Release it to the hardware and
        // refill once it has drained too.
        if ep.remaining_length > ep.remaining_length_secondary {
            reg.free_user_buffer(UsbDir::In);
            return None;
        }
    }

    if let Err(e) = start_transfer(hw, ep) {
        warn!("ep {:#04x}: could not continue: {:?}", ep.address(), e);
    }
    None
}

/// Handles a finished OUT transaction on `ep`: copies the packet out of packet
/// memory and either re-arms the endpoint or reports the transfer done. The
/// caller has already cleared `CTR_RX`.
pub(crate) fn complete_out<'a, H: UsbPeripheral>(
    hw: &H,
    ep: &mut Endpoint<'a>,
) -> Option<Completion<'a>> {
    ep.kind?;
    let reg = EndpointRegister::new(hw, ep.number);

    let (addr, count) = match ep.buffering {
        Buffering::Single { addr } => (addr, reg.rx_count()),
        Buffering::Double { addr0, addr1 } => {
            // Same trick as IN: DTOG_RX has already moved past the buffer
            // that was just filled.
            if reg.read().is_set(EPR::DTOG_RX) {
                (addr0, reg.buffer_count(PingPong::Zero))
            } else {
                (addr1, reg.buffer_count(PingPong::One))
            }
        }
    };

    let stored = ep.store_packet(hw, addr, count);
    if stored < count {
        warn!(
            "ep {:#04x}: {} bytes didn't fit and were dropped",
            ep.address(),
            count - stored
        );
    }
    ep.transfer_count += count;

    if ep.remaining_length == 0 || count < usize::from(ep.max_packet_size) {
        let len = ep.offset;
        return match ep.take_buffer() {
            TransferBuffer::Out(data) => Some(Completion::Out {
                endpoint: ep.address(),
                data,
                len,
            }),
            _ => None,
        };
    }

    if let Err(e) = start_transfer(hw, ep) {
        warn!("ep {:#04x}: could not continue: {:?}", ep.address(), e);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedUsb;

    fn endpoint(
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

    fn begin_in<'a>(ep: &mut Endpoint<'a>, data: &'a [u8]) {
        ep.buffer = TransferBuffer::In(data);
        ep.offset = 0;
        ep.transfer_count = 0;
        ep.remaining_length = data.len();
        ep.remaining_length_secondary = data.len();
    }

    #[test]
    fn double_bulk_in_follows_the_toggle() {
        let hw = SimulatedUsb::new();
        let data: [u8; 300] = core::array::from_fn(|i| i as u8);
        let mut ep = endpoint(
            1,
            UsbDir::In,
            TransferType::Bulk,
            Buffering::Double { addr0: 0x100, addr1: 0x140 },
        );
        crate::endpoint::activate(&hw, &ep).unwrap();
        begin_in(&mut ep, &data);
        let reg = EndpointRegister::new(&hw, 1);

        // Toggle clear: buffer 0 gets the first chunk and is handed over.
        start_transfer(&hw, &mut ep).unwrap();
        assert_eq!(hw.pma_bytes(0x100, 64), data[0..64]);
        assert_eq!(hw.pma_bytes(0x140, 64), data[64..128]);
        assert_eq!(ep.remaining_length_secondary(), 300 - 128);
        assert!(!reg.read().is_set(EPR::DTOG_TX));
        assert!(reg.read().is_set(EPR::DTOG_RX));

        // Toggle set: buffer 1 gets the first chunk this time.
        reg.toggle_tx();
        start_transfer(&hw, &mut ep).unwrap();
        assert_eq!(hw.pma_bytes(0x140, 64), data[128..192]);
        assert_eq!(hw.pma_bytes(0x100, 64), data[192..256]);
        assert!(reg.read().is_set(EPR::EP_KIND));
        assert!(reg.read().is_set(EPR::DTOG_TX));
        assert!(!reg.read().is_set(EPR::DTOG_RX));

        // 44 bytes left: single-buffered finish.
        start_transfer(&hw, &mut ep).unwrap();
        assert!(!reg.read().is_set(EPR::EP_KIND));
        assert_eq!(reg.tx_count(), 44);
        assert_eq!(hw.pma_bytes(0x100, 44), data[256..300]);
        assert_eq!(ep.remaining_length_secondary(), 0);
        assert_eq!(ep.offset, 300);
        assert_eq!(reg.tx_status(), EndpointStatus::Valid);
    }

    #[test]
    fn double_bulk_in_claims_before_filling() {
        let hw = SimulatedUsb::new();
        let data: [u8; 200] = core::array::from_fn(|i| i as u8);
        let mut ep = endpoint(
            1,
            UsbDir::In,
            TransferType::Bulk,
            Buffering::Double { addr0: 0x100, addr1: 0x140 },
        );
        crate::endpoint::activate(&hw, &ep).unwrap();
        let reg = EndpointRegister::new(&hw, 1);
        // Left over from an earlier transfer: hardware on buffer 1, SW_BUF on 0.
        reg.toggle_tx();
        begin_in(&mut ep, &data);
        start_transfer(&hw, &mut ep).unwrap();

        assert_eq!(hw.pma_bytes(0x140, 64), data[0..64]);
        assert_eq!(hw.pma_bytes(0x100, 64), data[64..128]);
        assert_eq!(hw.host_in(1).as_deref(), Some(&data[0..64]));
        // Buffer 0 is still ours until the completion releases it.
        assert_eq!(hw.host_in(1), None);
    }

    #[test]
    fn double_bulk_in_short_transfer_is_one_packet() {
        let hw = SimulatedUsb::new();
        let data = [0x5Au8; 40];
        let mut ep = endpoint(
            2,
            UsbDir::In,
            TransferType::Bulk,
            Buffering::Double { addr0: 0x100, addr1: 0x140 },
        );
        crate::endpoint::activate(&hw, &ep).unwrap();
        begin_in(&mut ep, &data);
        start_transfer(&hw, &mut ep).unwrap();
        let reg = EndpointRegister::new(&hw, 2);
        assert!(!reg.read().is_set(EPR::EP_KIND));
        assert_eq!(reg.tx_count(), 40);
        assert_eq!(hw.pma_bytes(0x140, 2), [0u8, 0]);
    }

    #[test]
    fn iso_in_writes_one_packet_per_step() {
        let hw = SimulatedUsb::new();
        let data = [7u8; 100];
        let mut ep = endpoint(
            3,
            UsbDir::In,
            TransferType::Isochronous,
            Buffering::Double { addr0: 0x100, addr1: 0x140 },
        );
        crate::endpoint::activate(&hw, &ep).unwrap();
        begin_in(&mut ep, &data);
        start_transfer(&hw, &mut ep).unwrap();
        assert_eq!(ep.remaining_length_secondary(), 36);
        assert_eq!(EndpointRegister::new(&hw, 3).buffer_count(PingPong::Zero), 64);
        assert!(!EndpointRegister::new(&hw, 3).read().is_set(EPR::EP_KIND));
    }

    #[test]
    fn double_bulk_out_releases_a_blocked_buffer() {
        let hw = SimulatedUsb::new();
        let mut ep = endpoint(
            1,
            UsbDir::Out,
            TransferType::Bulk,
            Buffering::Double { addr0: 0x100, addr1: 0x140 },
        );
        crate::endpoint::activate(&hw, &ep).unwrap();
        let reg = EndpointRegister::new(&hw, 1);

        // Fresh transfer on a fresh endpoint: buffer 0 is already the
        // hardware's, so nothing moves.
        ep.remaining_length = 128;
        start_transfer(&hw, &mut ep).unwrap();
        assert!(reg.read().is_set(EPR::DTOG_TX));
        assert_eq!(ep.remaining_length(), 64);

        // A packet lands in buffer 0 and the toggles meet: blocked until the
        // next step gives buffer 0 back.
        reg.toggle_rx();
        ep.transfer_count = 64;
        start_transfer(&hw, &mut ep).unwrap();
        assert!(!reg.read().is_set(EPR::DTOG_TX));
        assert_eq!(ep.remaining_length(), 0);

        // DTOG_RX != DTOG_TX now: nothing to release.
        start_transfer(&hw, &mut ep).unwrap();
        assert!(!reg.read().is_set(EPR::DTOG_TX));
        assert_eq!(reg.rx_status(), EndpointStatus::Valid);
    }

    #[test]
    fn double_out_of_other_types_is_refused_untouched() {
        let hw = SimulatedUsb::new();
        let mut ep = endpoint(
            1,
            UsbDir::Out,
            TransferType::Interrupt,
            Buffering::Double { addr0: 0x100, addr1: 0x140 },
        );
        ep.remaining_length = 10;
        let before = hw.writes();
        assert_eq!(start_transfer(&hw, &mut ep), Err(Error::UnsupportedBuffering));
        assert_eq!(hw.writes(), before);
        assert_eq!(ep.remaining_length(), 10);
    }

    #[test]
    fn iso_out_is_single_packet() {
        let hw = SimulatedUsb::new();
        let mut ep = endpoint(
            4,
            UsbDir::Out,
            TransferType::Isochronous,
            Buffering::Double { addr0: 0x100, addr1: 0x140 },
        );
        ep.remaining_length = 500;
        start_transfer(&hw, &mut ep).unwrap();
        assert_eq!(ep.remaining_length(), 0);
        assert_eq!(EndpointRegister::new(&hw, 4).rx_status(), EndpointStatus::Valid);
    }

    #[test]
    fn unopened_endpoint_is_refused() {
        let hw = SimulatedUsb::new();
        let mut ep = Endpoint::new(1, UsbDir::In);
        assert_eq!(start_transfer(&hw, &mut ep), Err(Error::InvalidEndpointType));
    }
}
