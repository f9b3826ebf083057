// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Analog keyboard firmware, USB side.
//!
//! This brings the STM32WB's USB peripheral up from a cold reset and runs a
//! boot-protocol HID keyboard on it. The driver library does the register
//! work; this file does the rest, top to bottom, in one long `main`:
//!
//! - Clock the USB block from HSI48 and hand PA11/PA12 to it.
//! - Build a `DeviceContext`, park it in a `SharedDevice`, open EP0.
//! - Loop forever, polling for events and answering the handful of control
//!   requests a host needs to enumerate a keyboard.
//!
//! There are no interrupts. The peripheral's interrupt sources are unmasked,
//! so `ISTR` latches events, but the NVIC line stays off and the main loop
//! polls. Moving `poll` into a `USB_LP` handler needs nothing more than a
//! `DEVICE.with` call there.
//!
//! Only the standard requests enumeration needs are handled here; everything
//! else is acknowledged (OUT) or stalled (IN). Key scanning lives elsewhere.

#![no_std]
#![no_main]

use cortex_m_rt::entry;

use byteorder::LittleEndian;
use log::{debug, trace, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tock_registers::interfaces::{ReadWriteable, Readable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

use analog_kb_usb::hid::{self, HidDescriptor, KeyboardReport};
use analog_kb_usb::{
    Buffering, DeviceConfig, DeviceContext, Error, Event, SharedDevice, Stm32Usb, TransferType,
    UsbDir,
};

use panic_halt as _;

/// USB vendor ID. Both halves share it.
const VENDOR_ID: u16 = 0x6969;

// Each half enumerates as its own device, so the host can tell them apart.
cfg_if::cfg_if! {
    if #[cfg(feature = "side-left")] {
        const PRODUCT_ID: u16 = 0x0001;
    } else if #[cfg(feature = "side-right")] {
        const PRODUCT_ID: u16 = 0x0002;
    } else {
        compile_error!("missing or unknown side-* feature");
    }
}

/// The driver instance. Lives in a static so that an interrupt handler could
/// get at it too.
static DEVICE: SharedDevice<'static, Stm32Usb> = SharedDevice::new();

#[entry]
fn main() -> ! {
    // Out of reset we're running from MSI at 4 MHz. That's plenty for the CPU
    // side of USB; the peripheral itself needs its own 48 MHz, below.

    // Safety: fixed, always-present register blocks. Nothing else in this
    // program touches them.
    let rcc = unsafe { &*(RCC_BASE as *const RccRegisters) };
    let gpioa = unsafe { &*(GPIOA_BASE as *const GpioRegisters) };

    //////////////////////////////////////////////////////////////////////////
    // Clocks.

    // Start HSI48 and wait for it to settle.
    rcc.crrcr.modify(CRRCR::HSI48ON::SET);
    while !rcc.crrcr.is_set(CRRCR::HSI48RDY) {}
    // Route it to the 48 MHz domain. This is the reset value, but say it
    // anyway.
    rcc.ccipr.modify(CCIPR::CLK48SEL::Hsi48);

    // Clock GPIOA and the USB block's register interface.
    rcc.ahb2enr.modify(AHB2ENR::GPIOAEN::SET);
    rcc.apb1enr1.modify(APB1ENR1::USBEN::SET);

    //////////////////////////////////////////////////////////////////////////
    // Pins. PA11 is DM, PA12 is DP, both on alternate function 10.

    gpioa.afrh.modify(GPIO_AFRH::AFSEL11.val(10) + GPIO_AFRH::AFSEL12.val(10));
    gpioa
        .ospeedr
        .modify(GPIO_OSPEEDR::OSPEED11::VeryHigh + GPIO_OSPEEDR::OSPEED12::VeryHigh);
    gpioa
        .moder
        .modify(GPIO_MODER::MODE11::Alternate + GPIO_MODER::MODE12::Alternate);

    //////////////////////////////////////////////////////////////////////////
    // USB bring-up.

    let usb = match unsafe { Stm32Usb::take() } {
        Ok(usb) => usb,
        Err(e) => panic!("usb: {:?}", e),
    };
    // The transceiver is isolated until the power controller is told VDDUSB
    // is good.
    usb.enable_supply();

    DEVICE.init(
        usb,
        DeviceConfig {
            endpoint_count: 2,
            lpm_enable: false,
        },
    );
    let started = DEVICE.with(|dev| {
        configure_endpoints(dev, &CONTROL_ENDPOINTS)?;
        // Pull-up on: from here the host can see us.
        dev.start();
        Ok(())
    });
    if let Err(e) = started.and_then(|r| r) {
        panic!("usb: bring-up failed: {:?}", e);
    }

    //////////////////////////////////////////////////////////////////////////
    // Main loop.

    // SET_ADDRESS has to be acknowledged from the old address, so the new one
    // waits here until the status stage is done.
    let mut pending_address = None;
    // Whether the host has picked our configuration, which is when the
    // keyboard endpoint comes alive.
    let mut configured = false;
    // Set while an IN data stage is going out on EP0; its end means the host
    // is about to send the zero-length status OUT.
    let mut status_out_due = false;
    // Landing area for OUT data stages (SET_REPORT carrying the LED byte,
    // mostly). It is lent to the driver for each one and handed back in the
    // completion event.
    let mut ep0_out_buf: Option<&'static mut [u8]> =
        match cortex_m::singleton!(: [u8; 64] = [0; 64]) {
            Some(buf) => Some(&mut buf[..]),
            None => panic!("usb: EP0 buffer taken twice"),
        };

    loop {
        let serviced = DEVICE.with(|dev| {
            while let Some(event) = dev.poll() {
                match event {
                    Event::Reset => {
                        pending_address = None;
                        configured = false;
                        status_out_due = false;
                        reclaim_ep0_buffer(dev, &mut ep0_out_buf);
                        // A bus reset leaves the endpoint registers cleared,
                        // so EP0 has to be set up from scratch.
                        if let Err(e) = configure_endpoints(dev, &CONTROL_ENDPOINTS) {
                            warn!("usb: EP0 setup failed: {:?}", e);
                        }
                    }
                    Event::Setup(packet) => {
                        // A new SETUP ends whatever the last request left
                        // behind: a stall, or a data stage still in flight.
                        reclaim_ep0_buffer(dev, &mut ep0_out_buf);
                        if dev.endpoint(EP0_IN_ADDR).map_or(false, |ep| ep.is_stalled()) {
                            if let Err(e) = dev.clear_stall(EP0_IN_ADDR) {
                                warn!("usb: EP0 unstall: {:?}", e);
                            }
                        }

                        let setup = LayoutVerified::<_, UsbSetupPacket>::new(&packet[..]);
                        let Some(setup) = setup else {
                            continue;
                        };
                        let setup = setup.into_ref();
                        status_out_due = false;

                        let dir = UsbDir::of_endpoint_addr(setup.request_type);
                        let result = match (dir, UsbSetupRequest::from_u8(setup.request)) {
                            (UsbDir::Out, Some(UsbSetupRequest::SetAddress)) => {
                                pending_address = Some(setup.value.get() as u8);
                                dev.send(EP0_IN_ADDR, &[])
                            }
                            (UsbDir::Out, Some(UsbSetupRequest::SetConfiguration)) => {
                                configured = setup.value.get() != 0;
                                if configured {
                                    // Acknowledge, then queue the first report so
                                    // the host has something to collect.
                                    let report = REPORT.as_bytes();
                                    configure_endpoints(dev, &KEYBOARD_ENDPOINTS)
                                        .and_then(|()| dev.send(EP0_IN_ADDR, &[]))
                                        .and_then(|()| dev.send(KEYBOARD_IN_ADDR, report))
                                } else {
                                    dev.deactivate(KEYBOARD_IN_ADDR)
                                        .and_then(|()| dev.send(EP0_IN_ADDR, &[]))
                                }
                            }
                            (UsbDir::Out, _) if setup.length.get() != 0 => {
                                // Data comes first; the status stage goes out
                                // when it has all arrived.
                                match ep0_out_buf.take() {
                                    // Lend the whole buffer: a short packet
                                    // ends the stage early, and keeping it
                                    // whole means it comes back whole.
                                    Some(buf) if usize::from(setup.length.get()) <= buf.len() => {
                                        dev.receive(EP0_OUT_ADDR, buf)
                                    }
                                    other => {
                                        ep0_out_buf = other;
                                        dev.stall(EP0_IN_ADDR)
                                    }
                                }
                            }
                            (UsbDir::Out, _) => {
                                // SET_IDLE and friends. We have nothing to
                                // change, but the host wants its status stage.
                                if setup.request == hid::REQUEST_SET_IDLE {
                                    trace!("usb: set idle {:#06x}", setup.value.get());
                                }
                                dev.send(EP0_IN_ADDR, &[])
                            }
                            (UsbDir::In, Some(UsbSetupRequest::GetDescriptor)) => {
                                match descriptor(setup.value.get() >> 8) {
                                    Some(bytes) => {
                                        let len = usize::from(setup.length.get());
                                        let len = len.min(bytes.len());
                                        status_out_due = true;
                                        dev.send(EP0_IN_ADDR, &bytes[..len])
                                    }
                                    None => dev.stall(EP0_IN_ADDR),
                                }
                            }
                            (UsbDir::In, _) => dev.stall(EP0_IN_ADDR),
                        };
                        if let Err(e) = result {
                            warn!("usb: request {:#04x} failed: {:?}", setup.request, e);
                        }
                    }
                    Event::InComplete { endpoint: EP0_IN_ADDR, .. } => {
                        if let Some(address) = pending_address.take() {
                            dev.set_address(address);
                        } else if core::mem::take(&mut status_out_due) {
                            if let Err(e) = dev.receive(EP0_OUT_ADDR, &mut []) {
                                warn!("usb: status stage: {:?}", e);
                            }
                        }
                    }
                    Event::OutComplete { endpoint: EP0_OUT_ADDR, data, len } => {
                        // Either a status stage (nothing to do) or the end of
                        // an OUT data stage, which we now acknowledge.
                        if !data.is_empty() {
                            debug!("usb: EP0 OUT data {:02x?}", &data[..len]);
                            ep0_out_buf = Some(data);
                            if let Err(e) = dev.send(EP0_IN_ADDR, &[]) {
                                warn!("usb: status stage: {:?}", e);
                            }
                        }
                    }
                    Event::InComplete { endpoint: KEYBOARD_IN_ADDR, .. } => {
                        if configured {
                            if let Err(e) = dev.send(KEYBOARD_IN_ADDR, REPORT.as_bytes()) {
                                warn!("usb: report: {:?}", e);
                            }
                        }
                    }
                    Event::Fault => {
                        // Packet memory overran. Start over from the top; the
                        // host will see us drop off and re-enumerate.
                        warn!("usb: fault, restarting");
                        pending_address = None;
                        configured = false;
                        status_out_due = false;
                        reclaim_ep0_buffer(dev, &mut ep0_out_buf);
                        dev.stop();
                        dev.init();
                        if let Err(e) = configure_endpoints(dev, &CONTROL_ENDPOINTS) {
                            warn!("usb: EP0 setup failed: {:?}", e);
                        }
                        dev.start();
                    }
                    Event::Suspend | Event::Wakeup => debug!("usb: {:?}", event),
                    other => trace!("usb: {:?}", other),
                }
            }
        });
        if serviced.is_err() {
            // Nothing installed. Can't happen after bring-up, but don't spin
            // on the log if it does.
            panic!("usb: device went away");
        }
    }
}

/// The descriptor a GET_DESCRIPTOR of type `kind` asks for, if we have one.
fn descriptor(kind: u16) -> Option<&'static [u8]> {
    match UsbDescType::from_u16(kind)? {
        UsbDescType::Device => Some(DEVICE_DESCRIPTOR.as_bytes()),
        // The whole bundle: config, interface, HID and endpoint descriptors.
        // Hosts ask for the first 9 bytes first, to learn the total length.
        UsbDescType::Config => Some(CONFIGURATION.as_bytes()),
        UsbDescType::Hid => Some(CONFIGURATION.hid.as_bytes()),
        UsbDescType::Report => Some(&hid::REPORT_DESCRIPTOR[..]),
        _ => None,
    }
}

/// Takes the EP0 OUT landing buffer back if a data stage still has it. The
/// empty buffer a status stage borrows isn't ours and is dropped.
fn reclaim_ep0_buffer(
    dev: &mut DeviceContext<'static, Stm32Usb>,
    slot: &mut Option<&'static mut [u8]>,
) {
    match dev.abort_out(EP0_OUT_ADDR) {
        Ok(Some(buf)) if !buf.is_empty() => *slot = Some(buf),
        Ok(_) => {}
        Err(e) => warn!("usb: EP0 OUT abort: {:?}", e),
    }
}

/// Opens, places and activates each endpoint in `table`.
fn configure_endpoints(
    dev: &mut DeviceContext<'static, Stm32Usb>,
    table: &[EndpointConfig],
) -> Result<(), Error> {
    for ep in table {
        dev.open(ep.address, ep.kind, ep.max_packet_size)?;
        dev.configure(ep.address, ep.buffering)?;
        dev.activate(ep.address)?;
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////
// Device configuration.

const EP0_IN_ADDR: u8 = UsbDir::In.endpoint(0);
const EP0_OUT_ADDR: u8 = UsbDir::Out.endpoint(0);
const KEYBOARD_IN_ADDR: u8 = UsbDir::In.endpoint(1);

/// What the driver needs to know about one of our endpoints.
struct EndpointConfig {
    address: u8,
    kind: TransferType,
    max_packet_size: u16,
    buffering: Buffering,
}

// Packet memory layout. The buffer-descriptor table takes the first 64 bytes;
// buffers follow it.
static CONTROL_ENDPOINTS: [EndpointConfig; 2] = [
    EndpointConfig {
        address: EP0_OUT_ADDR,
        kind: TransferType::Control,
        max_packet_size: 64,
        buffering: Buffering::Single { addr: 0x40 },
    },
    EndpointConfig {
        address: EP0_IN_ADDR,
        kind: TransferType::Control,
        max_packet_size: 64,
        buffering: Buffering::Single { addr: 0x80 },
    },
];

static KEYBOARD_ENDPOINTS: [EndpointConfig; 1] = [EndpointConfig {
    address: KEYBOARD_IN_ADDR,
    kind: TransferType::Interrupt,
    max_packet_size: core::mem::size_of::<KeyboardReport>() as u16,
    buffering: Buffering::Single { addr: 0xC0 },
}];

// TODO: feed this from the analog key scanner once it is ported. Until then
// the keyboard enumerates and reports nothing held.
static REPORT: KeyboardReport = KeyboardReport::new();

static DEVICE_DESCRIPTOR: UsbDeviceDescriptor = UsbDeviceDescriptor {
    length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
    descriptor_type: UsbDescType::Device,
    bcd_usb: U16::from_bytes(u16::to_le_bytes(0x0200)),
    // Class is given per interface.
    device_class: 0,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: 64,
    vendor: U16::from_bytes(u16::to_le_bytes(VENDOR_ID)),
    product: U16::from_bytes(u16::to_le_bytes(PRODUCT_ID)),
    bcd_device: U16::from_bytes(u16::to_le_bytes(0x0200)),
    manufacturer_s: 0,
    product_s: 0,
    serial_s: 0,
    num_configurations: 1,
};

static CONFIGURATION: ConfigurationBundle = ConfigurationBundle {
    config: UsbConfigurationDescriptor {
        length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
        descriptor_type: UsbDescType::Config,
        total_length: U16::from_bytes(u16::to_le_bytes(
            core::mem::size_of::<ConfigurationBundle>() as u16,
        )),
        num_interfaces: 1,
        configuration_value: 1,
        configuration_s: 0,
        // Bus powered, remote wakeup.
        attributes: 0xA0,
        // 100 mA.
        max_power: 50,
    },
    interface: UsbInterfaceDescriptor {
        length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: 0,
        alternate_setting: 0,
        num_endpoints: 1,
        interface_class: hid::INTERFACE_CLASS_HID,
        interface_subclass: hid::INTERFACE_SUBCLASS_BOOT,
        interface_protocol: hid::INTERFACE_PROTOCOL_KEYBOARD,
        interface_s: 0,
    },
    hid: HidDescriptor {
        length: core::mem::size_of::<HidDescriptor>() as u8,
        descriptor_type: hid::HID_DESCRIPTOR_TYPE,
        bcd_hid: U16::from_bytes(u16::to_le_bytes(0x0111)),
        country_code: 0,
        num_descriptors: 1,
        report_descriptor_type: hid::REPORT_DESCRIPTOR_TYPE,
        report_descriptor_length: U16::from_bytes(u16::to_le_bytes(
            hid::REPORT_DESCRIPTOR_LEN as u16,
        )),
    },
    endpoint: UsbEndpointDescriptor {
        length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
        descriptor_type: UsbDescType::Endpoint,
        endpoint_address: KEYBOARD_IN_ADDR,
        attributes: TransferType::Interrupt as u8,
        max_packet_size: U16::from_bytes(u16::to_le_bytes(
            core::mem::size_of::<KeyboardReport>() as u16,
        )),
        // Poll every frame.
        interval: 1,
    },
};

////////////////////////////////////////////////////////////////////////////
// USB structure and constant definitions.

/// An 8-byte SETUP packet.
#[repr(C)]
#[derive(Debug, AsBytes, FromBytes, Unaligned)]
struct UsbSetupPacket {
    /// Direction in the top bit, then type and recipient.
    request_type: u8,
    request: u8,
    value: U16<LittleEndian>,
    index: U16<LittleEndian>,
    /// Bytes in the data stage, or the most the host will take.
    length: U16<LittleEndian>,
}

/// Standard requests we answer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum UsbSetupRequest {
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetConfiguration = 0x09,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbDeviceDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    /// USB version, BCD.
    bcd_usb: U16<LittleEndian>,
    device_class: u8,
    device_subclass: u8,
    device_protocol: u8,
    max_packet_size0: u8,
    vendor: U16<LittleEndian>,
    product: U16<LittleEndian>,
    bcd_device: U16<LittleEndian>,
    /// String table indices; 0 means none.
    manufacturer_s: u8,
    product_s: u8,
    serial_s: u8,
    num_configurations: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbConfigurationDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    /// Length of the whole bundle this descriptor heads.
    total_length: U16<LittleEndian>,
    num_interfaces: u8,
    configuration_value: u8,
    configuration_s: u8,
    /// Bit 7 must be set; bit 6 is self-powered, bit 5 remote wakeup.
    attributes: u8,
    /// In units of 2 mA.
    max_power: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbInterfaceDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    interface_number: u8,
    alternate_setting: u8,
    num_endpoints: u8,
    interface_class: u8,
    interface_subclass: u8,
    interface_protocol: u8,
    interface_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbEndpointDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    endpoint_address: u8,
    /// Transfer type in the bottom two bits.
    attributes: u8,
    max_packet_size: U16<LittleEndian>,
    /// Polling interval in frames.
    interval: u8,
}

/// Everything a GET_DESCRIPTOR(Config) returns, in wire order.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct ConfigurationBundle {
    config: UsbConfigurationDescriptor,
    interface: UsbInterfaceDescriptor,
    hid: HidDescriptor,
    endpoint: UsbEndpointDescriptor,
}

#[derive(Copy, Clone, Debug, FromPrimitive, AsBytes)]
#[repr(u8)]
enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    Hid = 0x21,
    Report = 0x22,
}

////////////////////////////////////////////////////////////////////////////
// STM32WB support stuff: just enough of RCC and GPIO to clock and pin out USB.

const RCC_BASE: usize = 0x5800_0000;
const GPIOA_BASE: usize = 0x4800_0000;

register_bitfields![u32,
    CRRCR [
        HSI48RDY OFFSET(1) NUMBITS(1) [],
        HSI48ON OFFSET(0) NUMBITS(1) []
    ],
    CCIPR [
        CLK48SEL OFFSET(26) NUMBITS(2) [
            Hsi48 = 0,
            PllSaiQ = 1,
            PllQ = 2,
            Msi = 3
        ]
    ],
    AHB2ENR [
        GPIOAEN OFFSET(0) NUMBITS(1) []
    ],
    APB1ENR1 [
        USBEN OFFSET(26) NUMBITS(1) []
    ],
    GPIO_MODER [
        MODE11 OFFSET(22) NUMBITS(2) [
            Alternate = 2
        ],
        MODE12 OFFSET(24) NUMBITS(2) [
            Alternate = 2
        ]
    ],
    GPIO_OSPEEDR [
        OSPEED11 OFFSET(22) NUMBITS(2) [
            VeryHigh = 3
        ],
        OSPEED12 OFFSET(24) NUMBITS(2) [
            VeryHigh = 3
        ]
    ],
    GPIO_AFRH [
        AFSEL11 OFFSET(12) NUMBITS(4) [],
        AFSEL12 OFFSET(16) NUMBITS(4) []
    ]
];

register_structs! {
    RccRegisters {
        (0x000 => _reserved0),
        (0x04C => ahb2enr: ReadWrite<u32, AHB2ENR::Register>),
        (0x050 => _reserved1),
        (0x058 => apb1enr1: ReadWrite<u32, APB1ENR1::Register>),
        (0x05C => _reserved2),
        (0x088 => ccipr: ReadWrite<u32, CCIPR::Register>),
        (0x08C => _reserved3),
        (0x098 => crrcr: ReadWrite<u32, CRRCR::Register>),
        (0x09C => @END),
    },
    GpioRegisters {
        (0x000 => moder: ReadWrite<u32, GPIO_MODER::Register>),
        (0x004 => _reserved0),
        (0x008 => ospeedr: ReadWrite<u32, GPIO_OSPEEDR::Register>),
        (0x00C => _reserved1),
        (0x024 => afrh: ReadWrite<u32, GPIO_AFRH::Register>),
        (0x028 => @END),
    }
}
