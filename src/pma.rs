// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving bytes in and out of packet memory.
//!
//! Packet memory only does 16-bit accesses, so bytes are paired up into words
//! little-end first: byte `2k` is the low half of word `k`, byte `2k+1` the high
//! half. Odd lengths end in a half-used word; we never read past the end of the
//! caller's slice to fill it, the spare half is written as zero instead.

use byteorder::{ByteOrder, LittleEndian};

use crate::regs::{CountRxVal, UsbPeripheral, COUNT_RX};

/// Copies `byte_count` bytes of `buffer` into packet memory starting at byte
/// offset `addr`.
///
/// `byte_count` is clamped to the length of `buffer`.
pub fn write<H: UsbPeripheral>(hw: &H, buffer: &[u8], addr: u16, byte_count: usize) {
    let buffer = &buffer[..byte_count.min(buffer.len())];
    let mut offset = addr;
    let mut pairs = buffer.chunks_exact(2);
    for pair in &mut pairs {
        hw.write_pma(offset, LittleEndian::read_u16(pair));
        offset = offset.wrapping_add(2);
    }
    if let [last] = pairs.remainder() {
        hw.write_pma(offset, u16::from(*last));
    }
}

/// Copies `byte_count` bytes out of packet memory at byte offset `addr` into
/// `buffer`. The mirror image of [`write`].
pub fn read<H: UsbPeripheral>(hw: &H, buffer: &mut [u8], addr: u16, byte_count: usize) {
    let count = byte_count.min(buffer.len());
    let buffer = &mut buffer[..count];
    let mut offset = addr;
    let mut pairs = buffer.chunks_exact_mut(2);
    for pair in &mut pairs {
        LittleEndian::write_u16(pair, hw.read_pma(offset));
        offset = offset.wrapping_add(2);
    }
    if let [last] = pairs.into_remainder() {
        *last = hw.read_pma(offset) as u8;
    }
}

/// Encodes a reception buffer size for the `COUNT_RX` descriptor word.
///
/// The hardware counts in blocks: 2-byte blocks up to 62 bytes, 32-byte blocks
/// beyond that. Sizes are rounded up to a whole block. A size of zero is
/// encoded as `BL_SIZE` with no blocks, as the reference code does.
pub fn rx_count_encoding(size: u16) -> CountRxVal {
    let mut val = CountRxVal::new(0);
    if size > 62 {
        let mut blocks = size >> 5;
        if size & 0x1F == 0 {
            blocks -= 1;
        }
        val.modify(COUNT_RX::BL_SIZE::SET + COUNT_RX::NUM_BLOCK.val(blocks));
    } else if size == 0 {
        val.modify(COUNT_RX::BL_SIZE::SET);
    } else {
        let blocks = (size >> 1) + (size & 1);
        val.modify(COUNT_RX::NUM_BLOCK.val(blocks));
    }
    val
}
