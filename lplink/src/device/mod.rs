//! Device classification and candidate port selection.
//!
//! A Launchpad enumerates as two USB CDC ports that share one USB serial
//! number; only one of them is wired to the target UART. Selection keeps every
//! port of one board and leaves it to the probe to find the right one.

use log::{debug, info, trace};

use crate::{
    error::{Error, Result},
    port::PortInfo,
};

/// Texas Instruments USB vendor id.
pub const TI_VID: u16 = 0x0451;

/// XDS110 debug probe on the LP-MSPM0G3507.
pub const LAUNCHPAD_PID: u16 = 0xBEF3;

/// Known boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// LP-MSPM0G3507 Launchpad.
    Launchpad,
    /// Tiva C-Series Launchpad (EK-TM4C123GXL), not supported.
    TivaLaunchpad,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs.
const KNOWN_USB_DEVICES: &[(u16, u16, DeviceKind)] = &[
    (TI_VID, LAUNCHPAD_PID, DeviceKind::Launchpad),
    (0x1CBE, 0x00FD, DeviceKind::TivaLaunchpad),
    (TI_VID, 0x00FD, DeviceKind::TivaLaunchpad),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, known_pid, _)| vid == *known_vid && pid == *known_pid)
            .map_or(Self::Unknown, |(_, _, device)| *device)
    }

    /// Classify an enumerated port.
    #[must_use]
    pub fn of(port: &PortInfo) -> Self {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => Self::from_vid_pid(vid, pid),
            _ => Self::Unknown,
        }
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Launchpad => "LP-MSPM0G3507",
            Self::TivaLaunchpad => "Tiva C-Series Launchpad",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether this host can talk to the board.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Launchpad)
    }
}

/// Host operating system family, as far as port naming is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux (`/dev/ttyACM<n>`).
    Linux,
    /// Windows (`COM<n>`).
    Windows,
    /// macOS (`/dev/cu.usbmodem<serial><n>`).
    MacOs,
    /// Anything else.
    Other,
}

impl Platform {
    /// Platform this binary runs on.
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Other
        }
    }

    /// Whether port numbers follow plug-in order, so the lowest numbered board
    /// is a sensible default.
    pub fn has_stable_port_order(self) -> bool {
        matches!(self, Self::Linux | Self::Windows)
    }
}

/// Launchpad ports among `ports`, call-out nodes preferred, in natural order.
pub fn find_launchpads(ports: &[PortInfo]) -> Vec<PortInfo> {
    let mut matches: Vec<PortInfo> = ports
        .iter()
        .filter(|p| p.matches(TI_VID, LAUNCHPAD_PID))
        .cloned()
        .collect();

    // macOS lists each port twice, as tty.* and cu.*
    if matches.iter().any(|p| p.basename().starts_with("cu")) {
        matches.retain(|p| p.basename().starts_with("cu"));
    }

    matches.sort_by_key(PortInfo::sort_key);
    matches
}

/// Split sorted ports into boards by USB serial number.
///
/// Ports without a serial number form one group. Groups keep the order of
/// their first port.
pub fn group_by_board(ports: Vec<PortInfo>) -> Vec<Vec<PortInfo>> {
    let mut groups: Vec<Vec<PortInfo>> = Vec::new();
    for port in ports {
        match groups
            .iter_mut()
            .find(|group| group[0].serial_number == port.serial_number)
        {
            Some(group) => group.push(port),
            None => groups.push(vec![port]),
        }
    }
    groups
}

/// Pick the ports to probe.
///
/// Fails with [`Error::IncompatibleDeviceFound`] when only a Tiva Launchpad
/// is attached, [`Error::NoDeviceFound`] when nothing is attached and
/// [`Error::AmbiguousDevices`] when several boards are attached on a
/// platform without stable port numbers.
pub fn select_candidates(ports: &[PortInfo], platform: Platform) -> Result<Vec<PortInfo>> {
    let matches = find_launchpads(ports);
    if matches.is_empty() {
        if let Some(port) = ports
            .iter()
            .find(|p| DeviceKind::of(p) == DeviceKind::TivaLaunchpad)
        {
            return Err(Error::IncompatibleDeviceFound {
                port: port.name.clone(),
                name: DeviceKind::TivaLaunchpad.name(),
            });
        }
        return Err(Error::NoDeviceFound);
    }

    let mut groups = group_by_board(matches);
    if groups.len() > 1 {
        if !platform.has_stable_port_order() {
            return Err(Error::AmbiguousDevices {
                ports: groups
                    .iter()
                    .flatten()
                    .map(|p| p.name.clone())
                    .collect(),
            });
        }
        info!(
            "{} Launchpads found, using the one on {}",
            groups.len(),
            groups[0][0].name
        );
    }

    let candidates = groups.swap_remove(0);
    for port in &candidates {
        trace!("Candidate port: {}", port.name);
    }
    debug!("{} candidate port(s)", candidates.len());
    Ok(candidates)
}

/// Format a list of ports for display.
pub fn format_port_list(ports: &[PortInfo]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let kind = DeviceKind::of(port);
        let device_info = if kind.is_known() {
            format!(" [{}]", kind.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let serial_info = port
            .serial_number
            .as_ref()
            .map(|s| format!(" ({s})"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, serial_info));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launchpad(name: &str, serial: &str) -> PortInfo {
        PortInfo::new(name)
            .with_usb(TI_VID, LAUNCHPAD_PID)
            .with_serial_number(serial)
    }

    fn names(ports: &[PortInfo]) -> Vec<&str> {
        ports.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x0451, 0xBEF3), DeviceKind::Launchpad);
        assert_eq!(DeviceKind::from_vid_pid(0x1CBE, 0x00FD), DeviceKind::TivaLaunchpad);
        assert_eq!(DeviceKind::from_vid_pid(0x0451, 0x00FD), DeviceKind::TivaLaunchpad);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Unknown);
        assert!(DeviceKind::Launchpad.is_supported());
        assert!(DeviceKind::TivaLaunchpad.is_known());
        assert!(!DeviceKind::TivaLaunchpad.is_supported());
    }

    #[test]
    fn test_find_launchpads_filters_and_sorts() {
        let ports = vec![
            launchpad("/dev/ttyACM10", "A"),
            PortInfo::new("/dev/ttyS0"),
            launchpad("/dev/ttyACM2", "A"),
            PortInfo::new("/dev/ttyUSB0").with_usb(0x1A86, 0x7523),
        ];
        assert_eq!(
            names(&find_launchpads(&ports)),
            vec!["/dev/ttyACM2", "/dev/ttyACM10"]
        );
    }

    #[test]
    fn test_find_launchpads_prefers_call_out_nodes() {
        let ports = vec![
            launchpad("/dev/tty.usbmodemMG3500014", "MG350001"),
            launchpad("/dev/cu.usbmodemMG3500014", "MG350001"),
            launchpad("/dev/tty.usbmodemMG3500011", "MG350001"),
            launchpad("/dev/cu.usbmodemMG3500011", "MG350001"),
        ];
        assert_eq!(
            names(&find_launchpads(&ports)),
            vec!["/dev/cu.usbmodemMG3500011", "/dev/cu.usbmodemMG3500014"]
        );
    }

    #[test]
    fn test_select_no_device() {
        let ports = vec![PortInfo::new("/dev/ttyS0")];
        assert!(matches!(
            select_candidates(&ports, Platform::Linux),
            Err(Error::NoDeviceFound)
        ));
        assert!(matches!(
            select_candidates(&[], Platform::Linux),
            Err(Error::NoDeviceFound)
        ));
    }

    #[test]
    fn test_select_only_tiva() {
        let ports = vec![PortInfo::new("COM5").with_usb(0x1CBE, 0x00FD)];
        match select_candidates(&ports, Platform::Windows) {
            Err(Error::IncompatibleDeviceFound { port, name }) => {
                assert_eq!(port, "COM5");
                assert_eq!(name, "Tiva C-Series Launchpad");
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_select_one_board_two_ports() {
        let ports = vec![launchpad("COM4", "L1"), launchpad("COM3", "L1")];
        let candidates = select_candidates(&ports, Platform::MacOs).unwrap();
        assert_eq!(names(&candidates), vec!["COM3", "COM4"]);
    }

    #[test]
    fn test_select_two_boards_stable_order_keeps_lowest() {
        let ports = vec![
            launchpad("/dev/ttyACM2", "B"),
            launchpad("/dev/ttyACM3", "B"),
            launchpad("/dev/ttyACM0", "A"),
            launchpad("/dev/ttyACM1", "A"),
        ];
        let candidates = select_candidates(&ports, Platform::Linux).unwrap();
        assert_eq!(names(&candidates), vec!["/dev/ttyACM0", "/dev/ttyACM1"]);
    }

    #[test]
    fn test_select_two_boards_unstable_order_is_ambiguous() {
        let ports = vec![
            launchpad("/dev/cu.usbmodemA1", "A"),
            launchpad("/dev/cu.usbmodemB1", "B"),
        ];
        match select_candidates(&ports, Platform::MacOs) {
            Err(Error::AmbiguousDevices { ports }) => assert_eq!(ports.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ports_without_serial_number_share_a_group() {
        let ports = vec![
            PortInfo::new("COM3").with_usb(TI_VID, LAUNCHPAD_PID),
            PortInfo::new("COM4").with_usb(TI_VID, LAUNCHPAD_PID),
            PortInfo::new("COM5").with_usb(TI_VID, LAUNCHPAD_PID),
        ];
        let groups = group_by_board(ports);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn test_platform_port_order() {
        assert!(Platform::Linux.has_stable_port_order());
        assert!(Platform::Windows.has_stable_port_order());
        assert!(!Platform::MacOs.has_stable_port_order());
        assert!(!Platform::Other.has_stable_port_order());
    }

    #[test]
    fn test_format_port_list() {
        let ports = vec![
            launchpad("/dev/ttyACM0", "MG350001"),
            PortInfo::new("/dev/ttyUSB0").with_usb(0x1A86, 0x7523),
            PortInfo::new("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted[0], "/dev/ttyACM0 [LP-MSPM0G3507] (MG350001)");
        assert_eq!(formatted[1], "/dev/ttyUSB0 [VID:1A86 PID:7523]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
