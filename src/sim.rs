// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A software model of the USB peripheral, for tests.
//!
//! Registers behave the way the reference manual says they do on write --
//! toggle bits toggle, `CTR` flags only clear, `SETUP` is read-only -- which
//! is exactly the behavior the driver is most likely to get wrong. `ISTR.CTR`
//! and friends are derived from the endpoint registers like on the real thing.
//!
//! The `host_*` methods play the part of the host and the serial engine: they
//! move a packet through packet memory and set the completion flags.
//!
//! Double-buffered bulk endpoints get the hardware's flow control: the
//! direction's own toggle picks the buffer the engine uses next, the other
//! direction's toggle (SW_BUF) marks the one software owns, and a token is
//! NAKed while the two point at the same buffer. Isochronous endpoints don't
//! handshake, so they skip the check.

use std::cell::{Cell, RefCell};

use tock_registers::LocalRegisterCopy;

use crate::endpoint::EndpointStatus;
use crate::regs::{Reg, UsbPeripheral, EPR, ISTR, MAX_ENDPOINTS, PMA_SIZE};

/// Bits of `EPnR` that toggle when written with 1.
const EPR_TOGGLE: u16 = 0x7070;
/// Bits of `EPnR` that clear when written with 0.
const EPR_CLEAR: u16 = 0x8080;
/// Plain read/write bits of `EPnR`.
const EPR_PLAIN: u16 = 0x070F;
const EPR_SETUP: u16 = 0x0800;

/// `ISTR` flags software can clear. `CTR`, `DIR` and `EP_ID` are read-only.
const ISTR_FLAGS: u16 = 0x7F80;

const EP_TYPE_BULK: u16 = 0;
const EP_TYPE_ISO: u16 = 2;

pub struct SimulatedUsb {
    epr: [Cell<u16>; MAX_ENDPOINTS],
    cntr: Cell<u16>,
    istr: Cell<u16>,
    daddr: Cell<u16>,
    btable: Cell<u16>,
    lpmcsr: Cell<u16>,
    bcdr: Cell<u16>,
    pma: RefCell<Vec<u16>>,
    writes: Cell<usize>,
    reset_pulses: Cell<usize>,
}

impl SimulatedUsb {
    pub fn new() -> Self {
        Self {
            epr: Default::default(),
            cntr: Cell::new(0),
            istr: Cell::new(0),
            daddr: Cell::new(0),
            btable: Cell::new(0),
            lpmcsr: Cell::new(0),
            bcdr: Cell::new(0),
            pma: RefCell::new(vec![0; PMA_SIZE / 2]),
            writes: Cell::new(0),
            reset_pulses: Cell::new(0),
        }
    }

    /// Number of register and packet-memory writes made by the driver.
    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    /// Number of times `CNTR.FRES` was written as 1.
    pub fn reset_pulses(&self) -> usize {
        self.reset_pulses.get()
    }

    /// Sets `EPnR` to `raw` outright, bypassing write semantics.
    pub fn force_endpoint(&self, n: u8, raw: u16) {
        self.epr[usize::from(n)].set(raw);
    }

    pub fn endpoint(&self, n: u8) -> u16 {
        self.epr[usize::from(n)].get()
    }

    /// Latches bus event flags in `ISTR`.
    pub fn raise(&self, flags: u16) {
        self.istr.set(self.istr.get() | (flags & ISTR_FLAGS));
    }

    pub fn pma_bytes(&self, addr: u16, len: usize) -> Vec<u8> {
        let pma = self.pma.borrow();
        (0..len)
            .map(|i| {
                let byte = usize::from(addr) + i;
                let word = pma[byte / 2];
                if byte % 2 == 0 {
                    word as u8
                } else {
                    (word >> 8) as u8
                }
            })
            .collect()
    }

    fn put_bytes(&self, addr: u16, data: &[u8]) {
        let mut pma = self.pma.borrow_mut();
        for (i, &b) in data.iter().enumerate() {
            let byte = usize::from(addr) + i;
            let word = &mut pma[byte / 2];
            if byte % 2 == 0 {
                *word = (*word & 0xFF00) | u16::from(b);
            } else {
                *word = (*word & 0x00FF) | (u16::from(b) << 8);
            }
        }
    }

    fn word(&self, offset: u16) -> u16 {
        self.pma.borrow()[usize::from(offset / 2)]
    }

    fn set_word(&self, offset: u16, value: u16) {
        self.pma.borrow_mut()[usize::from(offset / 2)] = value;
    }

    /// Stores a received byte count in the low bits of a count word, leaving
    /// the block encoding alone.
    fn set_received(&self, offset: u16, count: usize) {
        let old = self.word(offset);
        self.set_word(offset, (old & !0x03FF) | (count as u16 & 0x03FF));
    }

    fn epr_copy(&self, n: u8) -> LocalRegisterCopy<u16, EPR::Register> {
        LocalRegisterCopy::new(self.endpoint(n))
    }

    fn is_double_buffered(epr: &LocalRegisterCopy<u16, EPR::Register>) -> bool {
        Self::is_double_bulk(epr) || epr.read(EPR::EP_TYPE) == EP_TYPE_ISO
    }

    fn is_double_bulk(epr: &LocalRegisterCopy<u16, EPR::Register>) -> bool {
        epr.read(EPR::EP_TYPE) == EP_TYPE_BULK && epr.is_set(EPR::EP_KIND)
    }

    /// The host sends an IN token to endpoint `ep`. Returns the packet, or
    /// `None` if the endpoint didn't have one ready.
    pub fn host_in(&self, ep: u8) -> Option<Vec<u8>> {
        let mut epr = self.epr_copy(ep);
        if EndpointStatus::from_bits(epr.read(EPR::STAT_TX)) != EndpointStatus::Valid {
            return None;
        }
        // SW_BUF for IN is DTOG_RX.
        if Self::is_double_bulk(&epr) && epr.is_set(EPR::DTOG_TX) == epr.is_set(EPR::DTOG_RX) {
            return None;
        }
        let base = u16::from(ep) * 8;
        let (addr, count) = if Self::is_double_buffered(&epr) && epr.is_set(EPR::DTOG_TX) {
            (self.word(base + 4), self.word(base + 6) & 0x03FF)
        } else {
            (self.word(base), self.word(base + 2) & 0x03FF)
        };
        let packet = self.pma_bytes(addr, usize::from(count));

        epr.set(epr.get() ^ EPR::DTOG_TX::SET.value);
        if !Self::is_double_buffered(&epr) {
            epr.modify(EPR::STAT_TX.val(EndpointStatus::Nak as u16));
        }
        epr.modify(EPR::CTR_TX::SET);
        self.force_endpoint(ep, epr.get());
        Some(packet)
    }

    /// The host sends `data` to endpoint `ep`. Returns false if the endpoint
    /// wasn't accepting.
    pub fn host_out(&self, ep: u8, data: &[u8]) -> bool {
        let mut epr = self.epr_copy(ep);
        if EndpointStatus::from_bits(epr.read(EPR::STAT_RX)) != EndpointStatus::Valid {
            return false;
        }
        // SW_BUF for OUT is DTOG_TX.
        if Self::is_double_bulk(&epr) && epr.is_set(EPR::DTOG_RX) == epr.is_set(EPR::DTOG_TX) {
            return false;
        }
        let base = u16::from(ep) * 8;
        let double = Self::is_double_buffered(&epr);
        let (addr, count_word) = if double && !epr.is_set(EPR::DTOG_RX) {
            (self.word(base), base + 2)
        } else {
            (self.word(base + 4), base + 6)
        };
        self.put_bytes(addr, data);
        self.set_received(count_word, data.len());

        epr.set(epr.get() ^ EPR::DTOG_RX::SET.value);
        if !double {
            epr.modify(EPR::STAT_RX.val(EndpointStatus::Nak as u16));
        }
        epr.modify(EPR::CTR_RX::SET);
        self.force_endpoint(ep, epr.get());
        true
    }

    /// The host sends a SETUP packet to endpoint 0. SETUP is always accepted
    /// and leaves both directions NAKing.
    pub fn host_setup(&self, packet: &[u8; 8]) {
        let addr = self.word(4);
        self.put_bytes(addr, packet);
        self.set_received(6, packet.len());
        let mut epr = self.epr_copy(0);
        epr.modify(
            EPR::STAT_RX.val(EndpointStatus::Nak as u16)
                + EPR::STAT_TX.val(EndpointStatus::Nak as u16)
                + EPR::CTR_RX::SET,
        );
        self.force_endpoint(0, epr.get() | EPR_SETUP);
    }

    /// `ISTR`'s view of pending endpoint completions: lowest endpoint first.
    fn pending_ctr(&self) -> u16 {
        for n in 0..MAX_ENDPOINTS as u8 {
            let epr = self.epr_copy(n);
            if epr.is_set(EPR::CTR_RX) || epr.is_set(EPR::CTR_TX) {
                let dir = if epr.is_set(EPR::CTR_RX) {
                    ISTR::DIR::SET
                } else {
                    ISTR::DIR::CLEAR
                };
                return (ISTR::CTR::SET + dir + ISTR::EP_ID.val(u16::from(n))).value;
            }
        }
        0
    }
}

impl UsbPeripheral for SimulatedUsb {
    fn read16(&self, reg: Reg) -> u16 {
        match reg {
            Reg::Endpoint(n) => self.endpoint(n),
            Reg::Cntr => self.cntr.get(),
            Reg::Istr => self.istr.get() | self.pending_ctr(),
            Reg::Daddr => self.daddr.get(),
            Reg::Btable => self.btable.get(),
            Reg::Lpmcsr => self.lpmcsr.get(),
            Reg::Bcdr => self.bcdr.get(),
        }
    }

    fn write16(&self, reg: Reg, value: u16) {
        self.writes.set(self.writes.get() + 1);
        match reg {
            Reg::Endpoint(n) => {
                let old = self.endpoint(n);
                let mut new = (old & EPR_SETUP)
                    | ((old ^ value) & EPR_TOGGLE)
                    | (old & value & EPR_CLEAR)
                    | (value & EPR_PLAIN);
                if old & EPR::CTR_RX::SET.value != 0 && new & EPR::CTR_RX::SET.value == 0 {
                    new &= !EPR_SETUP;
                }
                self.force_endpoint(n, new);
            }
            Reg::Cntr => {
                if value & 1 != 0 {
                    self.reset_pulses.set(self.reset_pulses.get() + 1);
                }
                self.cntr.set(value);
            }
            Reg::Istr => self.istr.set(self.istr.get() & value & ISTR_FLAGS),
            Reg::Daddr => self.daddr.set(value),
            Reg::Btable => self.btable.set(value),
            Reg::Lpmcsr => self.lpmcsr.set(value),
            Reg::Bcdr => self.bcdr.set(value),
        }
    }

    fn read_pma(&self, offset: u16) -> u16 {
        self.word(offset)
    }

    fn write_pma(&self, offset: u16, value: u16) {
        self.writes.set(self.writes.get() + 1);
        self.set_word(offset, value);
    }
}
