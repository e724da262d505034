//! ## Initialization
//!
//! Device discovery: walk the descriptors, locate the USBTMC interface and
//! its endpoints, open the device behind a selector and hand the claimed
//! pieces to the engine.
//!

use std::sync::Arc;

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, warn};

use crate::constants::usb::{USBTMC_CLASS_CODE, USBTMC_SUBCLASS_CODE};
use crate::error::{Error, Result};
use crate::quirks::{self, Hooks, QuirksRecord};
use crate::transport::{shared_context, RusbTransport};
use crate::types::{
    DeviceAddr, DeviceId, DeviceInfo, Endpoint, InterfaceInfo, Selector, UsbtmcEndpoints,
};

/// Location of a USBTMC interface inside a device's descriptor tree.
#[derive(Clone, Copy, Debug)]
struct UsbtmcLocation {
    config_number: u8,
    interface_number: u8,
    interface_protocol: u8,
}

fn find_usbtmc_interface<T: UsbContext>(
    device: &Device<T>,
    device_desc: &DeviceDescriptor,
) -> Option<UsbtmcLocation> {
    for config_index in 0..device_desc.num_configurations() {
        let Ok(config_desc) = device.config_descriptor(config_index) else { continue };
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                if interface_desc.class_code() == USBTMC_CLASS_CODE
                    && interface_desc.sub_class_code() == USBTMC_SUBCLASS_CODE
                {
                    return Some(UsbtmcLocation {
                        config_number: config_desc.number(),
                        interface_number: interface_desc.interface_number(),
                        interface_protocol: interface_desc.protocol_code(),
                    });
                }
            }
        }
    }
    None
}

fn collect_endpoints<T: UsbContext>(
    device: &Device<T>,
    location: &UsbtmcLocation,
) -> Result<UsbtmcEndpoints> {
    let config_desc = device
        .config_descriptor(location.config_number.saturating_sub(1))
        .map_err(Error::from)?;
    let interface = config_desc
        .interfaces()
        .find(|interface| interface.number() == location.interface_number)
        .ok_or(Error::NotUsbtmc)?;
    let interface_desc = interface.descriptors().next().ok_or(Error::NotUsbtmc)?;

    let mut bulk_out = None;
    let mut bulk_in = None;
    let mut interrupt_in = None;
    for endpoint in interface_desc.endpoint_descriptors() {
        let record = Endpoint {
            address: endpoint.address(),
            max_packet_size: endpoint.max_packet_size(),
        };
        match (endpoint.transfer_type(), endpoint.direction()) {
            (TransferType::Bulk, Direction::Out) => bulk_out = Some(record),
            (TransferType::Bulk, Direction::In) => bulk_in = Some(record),
            (TransferType::Interrupt, Direction::In) => interrupt_in = Some(record),
            _ => {}
        }
    }

    Ok(UsbtmcEndpoints {
        bulk_out_ep: bulk_out.ok_or(Error::NotUsbtmc)?,
        bulk_in_ep: bulk_in.ok_or(Error::NotUsbtmc)?,
        interrupt_ep: interrupt_in,
    })
}

fn bcd_device(device_desc: &DeviceDescriptor) -> u16 {
    let version = device_desc.device_version();
    ((version.major() as u16) << 8) | ((version.minor() as u16) << 4) | version.sub_minor() as u16
}

fn read_string(
    handle: &DeviceHandle<Context>,
    index: Option<u8>,
    strip_nuls: bool,
) -> Option<String> {
    let mut text = handle.read_string_descriptor_ascii(index?).ok()?;
    if strip_nuls {
        while text.ends_with('\0') {
            text.pop();
        }
    }
    Some(text)
}

/// Does this descriptor-level identity satisfy the selector? Serial matching
/// is deferred until the device is open.
fn matches_descriptors<T: UsbContext>(
    selector: &Selector,
    device: &Device<T>,
    device_desc: &DeviceDescriptor,
) -> bool {
    match selector {
        Selector::VidPid { vid, pid } | Selector::Resource { vid, pid, .. } => {
            *vid == device_desc.vendor_id() && *pid == device_desc.product_id()
        }
        Selector::BusAddress { bus, address } => {
            *bus == device.bus_number() && *address == device.address()
        }
        Selector::Serial(_) => true,
    }
}

fn wanted_serial(selector: &Selector) -> Option<&str> {
    match selector {
        Selector::Serial(serial) => Some(serial),
        Selector::Resource { serial: Some(serial), .. } => Some(serial),
        _ => None,
    }
}

/// ### List Devices
///
/// Enumerate every connected device that exposes a USBTMC interface.
/// Identity strings are filled in when the device can be opened.
///
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let context = shared_context()?;
    let mut found = Vec::new();

    let devices = context.devices().map_err(Error::from)?;
    for device in devices.iter() {
        let Ok(device_desc) = device.device_descriptor() else { continue };
        if find_usbtmc_interface(&device, &device_desc).is_none() {
            continue;
        }

        let (quirks, _) =
            quirks::lookup(device_desc.vendor_id(), device_desc.product_id(), bcd_device(&device_desc));
        let strings = device.open().ok().map(|handle| {
            let strip = quirks.strip_string_descriptor_nuls;
            (
                read_string(&handle, device_desc.manufacturer_string_index(), strip),
                read_string(&handle, device_desc.product_string_index(), strip),
                read_string(&handle, device_desc.serial_number_string_index(), strip),
            )
        });
        let (manufacturer, product, serial_number) = strings.unwrap_or((None, None, None));

        found.push(DeviceInfo {
            id: DeviceId {
                vendor_id: device_desc.vendor_id(),
                product_id: device_desc.product_id(),
            },
            address: DeviceAddr { bus: device.bus_number(), device: device.address() },
            manufacturer,
            product,
            serial_number,
        });
    }

    Ok(found)
}

/// ### Open Interface
///
/// Find the device behind `selector`, open it, locate its USBTMC interface
/// and endpoints, detach any kernel driver, and freeze the matching quirks
/// record. The interface itself is claimed later by the engine.
///
pub(crate) fn open_interface(
    selector: &Selector,
) -> Result<(RusbTransport, InterfaceInfo, QuirksRecord, Hooks)> {
    let context = shared_context()?;
    // A device that matched the selector but carried no USBTMC interface
    // turns the final error from NotFound into NotUsbtmc.
    let mut matched_non_usbtmc = false;

    let devices = context.devices().map_err(Error::from)?;
    for device in devices.iter() {
        let Ok(device_desc) = device.device_descriptor() else { continue };
        if !matches_descriptors(selector, &device, &device_desc) {
            continue;
        }

        let Some(location) = find_usbtmc_interface(&device, &device_desc) else {
            // Serial selectors scan every device; only a narrowed match counts.
            if !matches!(selector, Selector::Serial(_)) {
                matched_non_usbtmc = true;
            }
            continue;
        };

        let mut handle = device.open().map_err(Error::from)?;
        let (vid, pid) = (device_desc.vendor_id(), device_desc.product_id());
        let revision = bcd_device(&device_desc);
        let (quirks, hooks) = quirks::lookup(vid, pid, revision);

        let strip = quirks.strip_string_descriptor_nuls;
        let serial_number = read_string(&handle, device_desc.serial_number_string_index(), strip);
        if let Some(wanted) = wanted_serial(selector) {
            if serial_number.as_deref() != Some(wanted) {
                continue;
            }
        }

        let endpoints = collect_endpoints(&device, &location)?;
        debug!(
            "located USBTMC interface {} on {vid:04x}:{pid:04x} \
             (bulk-out {:#04x}, bulk-in {:#04x}, interrupt {:?})",
            location.interface_number,
            endpoints.bulk_out_ep.address,
            endpoints.bulk_in_ep.address,
            endpoints.interrupt_ep.map(|ep| ep.address),
        );

        let had_kernel_driver = match handle.kernel_driver_active(location.interface_number) {
            Ok(true) => {
                handle.detach_kernel_driver(location.interface_number).map_err(Error::from)?;
                true
            }
            Ok(false) => false,
            // Not every platform can answer; assume no driver and move on.
            Err(e) => {
                debug!("cannot query kernel driver state: {e}");
                false
            }
        };

        if let Err(e) = handle.set_active_configuration(location.config_number) {
            // Commonly fails when the configuration is already active.
            warn!("set_active_configuration failed: {e}");
        }

        let info = InterfaceInfo {
            vendor_id: vid,
            product_id: pid,
            revision,
            serial_number,
            manufacturer: read_string(&handle, device_desc.manufacturer_string_index(), strip),
            product: read_string(&handle, device_desc.product_string_index(), strip),
            bus: device.bus_number(),
            address: device.address(),
            interface_number: location.interface_number,
            interface_protocol: location.interface_protocol,
            endpoints,
        };

        let transport = RusbTransport::new(
            handle,
            location.interface_number,
            had_kernel_driver,
            Arc::clone(&context),
        );
        return Ok((transport, info, quirks, hooks));
    }

    if matched_non_usbtmc {
        Err(Error::NotUsbtmc)
    } else {
        Err(Error::NotFound)
    }
}
