// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register view of the USB Full-Speed device peripheral.
//!
//! The peripheral is driven entirely through a handful of 16-bit registers and
//! a block of dedicated packet memory (PMA). Everything the driver does goes
//! through the [`UsbPeripheral`] trait, which only knows how to move raw 16-bit
//! values around. The meaning of those values -- which bit is which -- lives in
//! the bitfield definitions below and is applied with `LocalRegisterCopy`.
//!
//! Splitting things this way lets the same driver code run against the real
//! memory-mapped block ([`Stm32Usb`]) or against a simulated one in tests.
//!
//! # The endpoint register is weird
//!
//! `EPnR` mixes three kinds of bits, and you have to respect all three on every
//! single write:
//!
//! - `STAT_RX`, `DTOG_RX`, `STAT_TX`, `DTOG_TX` _toggle_ when written with 1
//!   and are left alone when written with 0.
//! - `CTR_RX` and `CTR_TX` are _cleared_ when written with 0 and left alone when
//!   written with 1.
//! - Everything else is a plain read/write bit (except `SETUP`, which is
//!   read-only).
//!
//! This means a naive read-modify-write will happily flip status bits and eat
//! completion flags. The [`EndpointRegister`] helpers compute the correct value
//! for each kind of update so that nothing else has to think about it.

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::endpoint::{EndpointStatus, TransferType, UsbDir};
use crate::pma;
use crate::Error;

/// Number of endpoint registers implemented by the peripheral.
pub const MAX_ENDPOINTS: usize = 8;

/// Size of packet memory, in bytes.
pub const PMA_SIZE: usize = 1024;

/// Offset of the buffer-descriptor table within packet memory. We always put
/// it at the very bottom; endpoint buffers go above it.
pub const BTABLE_OFFSET: u16 = 0;

/// Base address of the USB register block.
pub const USB_BASE: usize = 0x4000_6800;
/// Base address of packet memory, as seen from the CPU.
pub const PMA_BASE: usize = 0x4000_6C00;
/// Address of `PWR_CR2`, which holds the USB supply-valid bit.
const PWR_CR2_ADDR: usize = 0x5800_0404;

register_bitfields![u16,
    /// Endpoint n register (`EPnR`).
    pub EPR [
        /// Correct transfer for reception. Cleared by writing 0.
        CTR_RX OFFSET(15) NUMBITS(1) [],
        /// Data toggle for reception; SW_BUF for double-buffered IN.
        DTOG_RX OFFSET(14) NUMBITS(1) [],
        /// Reception status. Toggles on write.
        STAT_RX OFFSET(12) NUMBITS(2) [],
        /// Last completed transaction was a SETUP. Read-only.
        SETUP OFFSET(11) NUMBITS(1) [],
        /// Endpoint transfer type.
        EP_TYPE OFFSET(9) NUMBITS(2) [],
        /// DBL_BUF for bulk endpoints, STATUS_OUT for control endpoints.
        EP_KIND OFFSET(8) NUMBITS(1) [],
        /// Correct transfer for transmission. Cleared by writing 0.
        CTR_TX OFFSET(7) NUMBITS(1) [],
        /// Data toggle for transmission; SW_BUF for double-buffered OUT.
        DTOG_TX OFFSET(6) NUMBITS(1) [],
        /// Transmission status. Toggles on write.
        STAT_TX OFFSET(4) NUMBITS(2) [],
        /// Endpoint address.
        EA OFFSET(0) NUMBITS(4) []
    ],

    /// Control register (`CNTR`).
    pub CNTR [
        CTRM OFFSET(15) NUMBITS(1) [],
        PMAOVRM OFFSET(14) NUMBITS(1) [],
        ERRM OFFSET(13) NUMBITS(1) [],
        WKUPM OFFSET(12) NUMBITS(1) [],
        SUSPM OFFSET(11) NUMBITS(1) [],
        RESETM OFFSET(10) NUMBITS(1) [],
        SOFM OFFSET(9) NUMBITS(1) [],
        ESOFM OFFSET(8) NUMBITS(1) [],
        L1REQM OFFSET(7) NUMBITS(1) [],
        L1RESUME OFFSET(5) NUMBITS(1) [],
        /// Drive resume signaling on the bus (remote wakeup).
        RESUME OFFSET(4) NUMBITS(1) [],
        FSUSP OFFSET(3) NUMBITS(1) [],
        LP_MODE OFFSET(2) NUMBITS(1) [],
        PDWN OFFSET(1) NUMBITS(1) [],
        /// Force USB reset.
        FRES OFFSET(0) NUMBITS(1) []
    ],

    /// Interrupt status register (`ISTR`). Flags are cleared by writing 0.
    pub ISTR [
        CTR OFFSET(15) NUMBITS(1) [],
        PMAOVR OFFSET(14) NUMBITS(1) [],
        ERR OFFSET(13) NUMBITS(1) [],
        WKUP OFFSET(12) NUMBITS(1) [],
        SUSP OFFSET(11) NUMBITS(1) [],
        RESET OFFSET(10) NUMBITS(1) [],
        SOF OFFSET(9) NUMBITS(1) [],
        ESOF OFFSET(8) NUMBITS(1) [],
        L1REQ OFFSET(7) NUMBITS(1) [],
        DIR OFFSET(4) NUMBITS(1) [],
        EP_ID OFFSET(0) NUMBITS(4) []
    ],

    /// Device address register (`DADDR`).
    pub DADDR [
        EF OFFSET(7) NUMBITS(1) [],
        ADD OFFSET(0) NUMBITS(7) []
    ],

    /// LPM control and status register (`LPMCSR`).
    pub LPMCSR [
        BESL OFFSET(4) NUMBITS(4) [],
        REMWAKE OFFSET(3) NUMBITS(1) [],
        LPMACK OFFSET(1) NUMBITS(1) [],
        LPMEN OFFSET(0) NUMBITS(1) []
    ],

    /// Battery charging detector register (`BCDR`). We only care about the
    /// pull-up.
    pub BCDR [
        DPPU OFFSET(15) NUMBITS(1) []
    ],

    /// Reception byte count word in the buffer-descriptor table.
    pub COUNT_RX [
        BL_SIZE OFFSET(15) NUMBITS(1) [],
        NUM_BLOCK OFFSET(10) NUMBITS(5) [],
        COUNT OFFSET(0) NUMBITS(10) []
    ],

    /// Transmission byte count word in the buffer-descriptor table.
    pub COUNT_TX [
        COUNT OFFSET(0) NUMBITS(10) []
    ]
];

register_bitfields![u32,
    PWR_CR2 [
        /// VDDUSB supply valid.
        USV OFFSET(10) NUMBITS(1) []
    ]
];

pub type EndpointVal = LocalRegisterCopy<u16, EPR::Register>;
pub type ControlVal = LocalRegisterCopy<u16, CNTR::Register>;
pub type InterruptStatusVal = LocalRegisterCopy<u16, ISTR::Register>;
pub type CountRxVal = LocalRegisterCopy<u16, COUNT_RX::Register>;

/// Names of the registers reachable through [`UsbPeripheral`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    /// `EPnR` for the given endpoint number.
    Endpoint(u8),
    Cntr,
    Istr,
    Daddr,
    Btable,
    Lpmcsr,
    Bcdr,
}

/// Raw access to the USB peripheral.
///
/// Implementations must not add any cleverness of their own: writes go to the
/// hardware as-is, with whatever side effects the hardware attaches to them.
pub trait UsbPeripheral {
    fn read16(&self, reg: Reg) -> u16;
    fn write16(&self, reg: Reg, value: u16);

    /// Reads the 16-bit packet-memory word at byte offset `offset`.
    fn read_pma(&self, offset: u16) -> u16;
    /// Writes the 16-bit packet-memory word at byte offset `offset`.
    fn write_pma(&self, offset: u16, value: u16);

    #[inline]
    fn control(&self) -> ControlVal {
        LocalRegisterCopy::new(self.read16(Reg::Cntr))
    }

    #[inline]
    fn interrupt_status(&self) -> InterruptStatusVal {
        LocalRegisterCopy::new(self.read16(Reg::Istr))
    }
}

/// Value that leaves both `CTR` flags alone when written to `EPnR`.
#[inline]
fn keep_ctr() -> u16 {
    (EPR::CTR_RX::SET + EPR::CTR_TX::SET).value
}

/// The plain bits of `EPnR`, i.e. the ones that read back and write without
/// side effects (plus the `CTR` flags, which survive being written as read).
#[inline]
fn stable_bits() -> u16 {
    (EPR::CTR_RX::SET
        + EPR::SETUP::SET
        + EPR::EP_TYPE::SET
        + EPR::EP_KIND::SET
        + EPR::CTR_TX::SET
        + EPR::EA::SET)
        .value
}

/// One of the two packet buffers of a double-buffered endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PingPong {
    Zero,
    One,
}

impl PingPong {
    pub fn other(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    /// Picks this buffer's address out of the pair.
    pub fn select(self, addr0: u16, addr1: u16) -> u16 {
        match self {
            Self::Zero => addr0,
            Self::One => addr1,
        }
    }
}

/// Typed handle on one endpoint's `EPnR` and its buffer-descriptor entry.
pub struct EndpointRegister<'h, H> {
    hw: &'h H,
    number: u8,
}

impl<'h, H: UsbPeripheral> EndpointRegister<'h, H> {
    pub fn new(hw: &'h H, number: u8) -> Self {
        Self { hw, number }
    }

    pub fn hw(&self) -> &'h H {
        self.hw
    }

    pub fn read(&self) -> EndpointVal {
        LocalRegisterCopy::new(self.hw.read16(Reg::Endpoint(self.number)))
    }

    fn write(&self, value: u16) {
        self.hw.write16(Reg::Endpoint(self.number), value);
    }

    /// Rewrites the plain bits selected by `mask` with `bits`, leaving status
    /// and toggles alone and not clearing any pending completion.
    fn write_plain(&self, mask: u16, bits: u16) {
        let current = self.read().get() & stable_bits();
        self.write((current & !mask) | bits | keep_ctr());
    }

    pub fn set_type(&self, kind: TransferType) {
        self.write_plain(
            EPR::EP_TYPE::SET.value,
            EPR::EP_TYPE.val(kind.register_bits()).value,
        );
    }

    pub fn set_address(&self, address: u8) {
        self.write_plain(EPR::EA::SET.value, EPR::EA.val(u16::from(address)).value);
    }

    /// Sets `EP_KIND`: double buffering on bulk endpoints, STATUS_OUT on
    /// control endpoints.
    pub fn set_kind(&self) {
        self.write_plain(EPR::EP_KIND::SET.value, EPR::EP_KIND::SET.value);
    }

    pub fn clear_kind(&self) {
        self.write_plain(EPR::EP_KIND::SET.value, 0);
    }

    pub fn tx_status(&self) -> EndpointStatus {
        EndpointStatus::from_bits(self.read().read(EPR::STAT_TX))
    }

    pub fn rx_status(&self) -> EndpointStatus {
        EndpointStatus::from_bits(self.read().read(EPR::STAT_RX))
    }

    /// Moves `STAT_TX` to `status`. Since the field toggles, we write the XOR
    /// of where it is and where we want it to be.
    pub fn set_tx_status(&self, status: EndpointStatus) {
        let epr = self.read();
        let flip = epr.read(EPR::STAT_TX) ^ status as u16;
        self.write((epr.get() & stable_bits()) | EPR::STAT_TX.val(flip).value | keep_ctr());
    }

    pub fn set_rx_status(&self, status: EndpointStatus) {
        let epr = self.read();
        let flip = epr.read(EPR::STAT_RX) ^ status as u16;
        self.write((epr.get() & stable_bits()) | EPR::STAT_RX.val(flip).value | keep_ctr());
    }

    /// Flips `DTOG_TX` unconditionally.
    pub fn toggle_tx(&self) {
        let epr = self.read();
        self.write((epr.get() & stable_bits()) | EPR::DTOG_TX::SET.value | keep_ctr());
    }

    /// Flips `DTOG_RX` unconditionally.
    pub fn toggle_rx(&self) {
        let epr = self.read();
        self.write((epr.get() & stable_bits()) | EPR::DTOG_RX::SET.value | keep_ctr());
    }

    pub fn clear_tx_toggle(&self) {
        if self.read().is_set(EPR::DTOG_TX) {
            self.toggle_tx();
        }
    }

    pub fn clear_rx_toggle(&self) {
        if self.read().is_set(EPR::DTOG_RX) {
            self.toggle_rx();
        }
    }

    /// Hands the software-owned buffer of a double-buffered endpoint back to
    /// the hardware by flipping SW_BUF, which lives in the *other* direction's
    /// toggle bit.
    pub fn free_user_buffer(&self, dir: UsbDir) {
        match dir {
            UsbDir::Out => self.toggle_tx(),
            UsbDir::In => self.toggle_rx(),
        }
    }

    pub fn clear_ctr_rx(&self) {
        let epr = self.read();
        self.write((epr.get() & stable_bits() & !EPR::CTR_RX::SET.value) | EPR::CTR_TX::SET.value);
    }

    pub fn clear_ctr_tx(&self) {
        let epr = self.read();
        self.write((epr.get() & stable_bits() & !EPR::CTR_TX::SET.value) | EPR::CTR_RX::SET.value);
    }

    // Buffer-descriptor table. Each endpoint owns four consecutive words:
    // ADDR_TX, COUNT_TX, ADDR_RX, COUNT_RX.

    fn descriptor(&self, word: u16) -> u16 {
        BTABLE_OFFSET + u16::from(self.number) * 8 + word * 2
    }

    pub fn set_tx_address(&self, addr: u16) {
        self.hw.write_pma(self.descriptor(0), addr & !1);
    }

    pub fn tx_address(&self) -> u16 {
        self.hw.read_pma(self.descriptor(0))
    }

    pub fn set_rx_address(&self, addr: u16) {
        self.hw.write_pma(self.descriptor(2), addr & !1);
    }

    pub fn rx_address(&self) -> u16 {
        self.hw.read_pma(self.descriptor(2))
    }

    pub fn set_tx_count(&self, count: usize) {
        self.hw.write_pma(self.descriptor(1), COUNT_TX::COUNT.val(count as u16).value);
    }

    pub fn tx_count(&self) -> usize {
        let raw = self.hw.read_pma(self.descriptor(1));
        let raw = LocalRegisterCopy::<u16, COUNT_TX::Register>::new(raw);
        usize::from(raw.read(COUNT_TX::COUNT))
    }

    /// Programs the size of the reception buffer, in the block encoding the
    /// hardware wants.
    pub fn set_rx_count(&self, size: u16) {
        self.hw.write_pma(self.descriptor(3), pma::rx_count_encoding(size).get());
    }

    /// Number of bytes the hardware actually received.
    pub fn rx_count(&self) -> usize {
        let raw = CountRxVal::new(self.hw.read_pma(self.descriptor(3)));
        usize::from(raw.read(COUNT_RX::COUNT))
    }

    /// In double-buffered mode buffer 0 uses the TX descriptor slots and buffer
    /// 1 the RX ones, regardless of direction.
    pub fn set_double_buffer_addresses(&self, addr0: u16, addr1: u16) {
        self.set_tx_address(addr0);
        self.set_rx_address(addr1);
    }

    /// Sets one buffer's count. For IN that's the number of bytes to send; for
    /// OUT it's the buffer size, block-encoded.
    pub fn set_buffer_count(&self, dir: UsbDir, buffer: PingPong, count: usize) {
        let word = match buffer {
            PingPong::Zero => self.descriptor(1),
            PingPong::One => self.descriptor(3),
        };
        let value = match dir {
            UsbDir::In => COUNT_TX::COUNT.val(count as u16).value,
            UsbDir::Out => pma::rx_count_encoding(count as u16).get(),
        };
        self.hw.write_pma(word, value);
    }

    pub fn set_double_buffer_counts(&self, dir: UsbDir, count: usize) {
        self.set_buffer_count(dir, PingPong::Zero, count);
        self.set_buffer_count(dir, PingPong::One, count);
    }

    pub fn buffer_count(&self, buffer: PingPong) -> usize {
        let word = match buffer {
            PingPong::Zero => self.descriptor(1),
            PingPong::One => self.descriptor(3),
        };
        usize::from(CountRxVal::new(self.hw.read_pma(word)).read(COUNT_RX::COUNT))
    }
}

////////////////////////////////////////////////////////////////////////////
// The real thing.

/// Every register sits in the bottom half of a 32-bit slot.
#[repr(C)]
struct Slot<R> {
    reg: R,
    _reserved: u16,
}

#[repr(C)]
struct UsbRegisterBlock {
    epr: [Slot<ReadWrite<u16, EPR::Register>>; MAX_ENDPOINTS],
    _reserved0: [u32; 8],
    cntr: Slot<ReadWrite<u16, CNTR::Register>>,
    istr: Slot<ReadWrite<u16, ISTR::Register>>,
    _fnr: Slot<ReadOnly<u16>>,
    daddr: Slot<ReadWrite<u16, DADDR::Register>>,
    btable: Slot<ReadWrite<u16>>,
    lpmcsr: Slot<ReadWrite<u16, LPMCSR::Register>>,
    bcdr: Slot<ReadWrite<u16, BCDR::Register>>,
}

/// The memory-mapped USB peripheral.
pub struct Stm32Usb {
    regs: &'static UsbRegisterBlock,
    pma: *mut u16,
}

// Safety: the peripheral isn't tied to a thread; exclusive use is promised by
// whoever calls `new`.
unsafe impl Send for Stm32Usb {}

impl Stm32Usb {
    /// Wraps the register block at `regs` and the packet memory at `pma`.
    ///
    /// # Safety
    ///
    /// Non-null arguments must point at the USB peripheral and its packet
    /// memory, and nothing else may be driving that peripheral.
    pub unsafe fn new(regs: usize, pma: usize) -> Result<Self, Error> {
        if regs == 0 || pma == 0 {
            return Err(Error::NullInstance);
        }
        Ok(Self {
            regs: &*(regs as *const UsbRegisterBlock),
            pma: pma as *mut u16,
        })
    }

    /// The USB peripheral at its datasheet address.
    ///
    /// # Safety
    ///
    /// Must only be called once.
    pub unsafe fn take() -> Result<Self, Error> {
        Self::new(USB_BASE, PMA_BASE)
    }

    /// Tells the power controller that VDDUSB is present. Without this the
    /// transceiver stays isolated.
    pub fn enable_supply(&self) {
        // Safety: PWR_CR2 is a fixed, always-present register; we only touch
        // the USV bit.
        let cr2 = unsafe { &*(PWR_CR2_ADDR as *const ReadWrite<u32, PWR_CR2::Register>) };
        cr2.modify(PWR_CR2::USV::SET);
    }

    fn pma_word(&self, offset: u16) -> *mut u16 {
        debug_assert!(usize::from(offset) < PMA_SIZE);
        // PMA is byte-addressed from the CPU side, but only 16-bit accesses
        // work.
        (self.pma as usize + usize::from(offset & !1)) as *mut u16
    }
}

impl UsbPeripheral for Stm32Usb {
    fn read16(&self, reg: Reg) -> u16 {
        let r = self.regs;
        match reg {
            Reg::Endpoint(n) => r.epr[usize::from(n)].reg.get(),
            Reg::Cntr => r.cntr.reg.get(),
            Reg::Istr => r.istr.reg.get(),
            Reg::Daddr => r.daddr.reg.get(),
            Reg::Btable => r.btable.reg.get(),
            Reg::Lpmcsr => r.lpmcsr.reg.get(),
            Reg::Bcdr => r.bcdr.reg.get(),
        }
    }

    fn write16(&self, reg: Reg, value: u16) {
        let r = self.regs;
        match reg {
            Reg::Endpoint(n) => r.epr[usize::from(n)].reg.set(value),
            Reg::Cntr => r.cntr.reg.set(value),
            Reg::Istr => r.istr.reg.set(value),
            Reg::Daddr => r.daddr.reg.set(value),
            Reg::Btable => r.btable.reg.set(value),
            Reg::Lpmcsr => r.lpmcsr.reg.set(value),
            Reg::Bcdr => r.bcdr.reg.set(value),
        }
    }

    fn read_pma(&self, offset: u16) -> u16 {
        // Safety: pma_word stays inside packet memory.
        unsafe { self.pma_word(offset).read_volatile() }
    }

    fn write_pma(&self, offset: u16, value: u16) {
        // Safety: as above.
        unsafe { self.pma_word(offset).write_volatile(value) }
    }
}
