//! Raw HCI socket radio for Linux.
//!
//! Talks to the adapter through a raw Bluetooth HCI socket, bypassing the
//! BlueZ daemon. Requires CAP_NET_RAW and CAP_NET_ADMIN or root.

use super::{FRAME_CHANNEL_BUFFER_SIZE, FrameResult, Radio, RawAdvertisement, ScanError};
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

// Adapter ioctls: _IOW('H', 201, int) and _IOW('H', 202, int)
const HCIDEVUP: u32 = 0x4004_48C9;
const HCIDEVDOWN: u32 = 0x4004_48CA;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_ACTIVE: u8 = 0x01;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// Scan interval and window, in 0.625 ms units. Equal values give a 100%
/// duty cycle.
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

/// Largest HCI event: 1 type + 1 code + 1 length + 255 parameters.
const HCI_MAX_EVENT_SIZE: usize = 258;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_all_events(&mut self) {
        self.event_mask = [u32::MAX, u32::MAX];
    }
}

/// LE Set Scan Parameters command
struct LeSetScanParametersCmd {
    scan_type: u8,
    interval: u16,
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

impl LeSetScanParametersCmd {
    fn to_bytes(&self) -> [u8; 7] {
        let interval = self.interval.to_le_bytes();
        let window = self.window.to_le_bytes();
        [
            self.scan_type,
            interval[0],
            interval[1],
            window[0],
            window[1],
            self.own_address_type,
            self.filter_policy,
        ]
    }
}

/// LE Set Scan Enable command
struct LeSetScanEnableCmd {
    enable: u8,
    filter_dup: u8,
}

impl LeSetScanEnableCmd {
    fn to_bytes(&self) -> [u8; 2] {
        [self.enable, self.filter_dup]
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Open a raw HCI socket
fn open_hci_socket(flags: c_int) -> io::Result<OwnedFd> {
    // libc directly, since nix doesn't support BTPROTO_HCI
    let fd = unsafe { libc::socket(AF_BLUETOOTH, SOCK_RAW | SOCK_CLOEXEC | flags, BTPROTO_HCI) };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> io::Result<()> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: HCI_CHANNEL_RAW,
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn device_ioctl(fd: &OwnedFd, request: u32, dev_id: u16) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, c_int::from(dev_id)) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn get_hci_filter(fd: &impl AsRawFd) -> io::Result<HciFilter> {
    let mut filter = HciFilter::new();
    let mut len = mem::size_of::<HciFilter>() as socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            &mut filter as *mut HciFilter as *mut c_void,
            &mut len,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(filter)
}

fn set_hci_filter(fd: &impl AsRawFd, filter: &HciFilter) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn send_hci_command(fd: &impl AsRawFd, packet: &[u8]) -> io::Result<()> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn read_hci_frame(fd: &impl AsRawFd, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// The adapter behind a raw HCI socket.
///
/// One socket carries both the scan commands and the event stream. Dropping
/// the radio disables scanning and restores the event filter if the
/// supervisor has not already done so.
pub struct HciRadio {
    dev_id: u16,
    socket: Option<Arc<AsyncFd<OwnedFd>>>,
    saved_filter: Option<HciFilter>,
    scanning: bool,
}

impl HciRadio {
    pub fn new(dev_id: u16) -> Self {
        Self {
            dev_id,
            socket: None,
            saved_filter: None,
            scanning: false,
        }
    }

    fn socket(&self) -> Result<&Arc<AsyncFd<OwnedFd>>, ScanError> {
        self.socket.as_ref().ok_or(ScanError::NotOpen)
    }

    fn command(
        &self,
        name: &'static str,
        ocf: u16,
        params: &[u8],
    ) -> Result<(), ScanError> {
        let packet = hci_command_packet(OGF_LE_CTL, ocf, params);
        debug!(command = name, dev_id = self.dev_id, "sending HCI command");
        send_hci_command(self.socket()?.get_ref(), &packet)
            .map_err(|source| ScanError::Command { name, source })
    }

    fn set_scan_enable(&mut self, enable: bool) -> Result<(), ScanError> {
        let cmd = LeSetScanEnableCmd {
            enable: u8::from(enable),
            filter_dup: 0x00, // report every advertisement
        };
        let name = if enable { "LE Set Scan Enable" } else { "LE Set Scan Disable" };
        self.command(name, OCF_LE_SET_SCAN_ENABLE, &cmd.to_bytes())?;
        self.scanning = enable;
        Ok(())
    }
}

impl Radio for HciRadio {
    fn dev_id(&self) -> u16 {
        self.dev_id
    }

    fn reset(&mut self) -> Result<(), ScanError> {
        let reset_err = |source| ScanError::Reset {
            dev_id: self.dev_id,
            source,
        };
        let ctl = open_hci_socket(0).map_err(reset_err)?;

        device_ioctl(&ctl, HCIDEVDOWN, self.dev_id).map_err(reset_err)?;
        match device_ioctl(&ctl, HCIDEVUP, self.dev_id) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {}
            Err(e) => return Err(reset_err(e)),
        }

        info!("Bluetooth adapter hci{} reset", self.dev_id);
        Ok(())
    }

    fn open(&mut self) -> Result<(), ScanError> {
        let open_err = |source| ScanError::Open {
            dev_id: self.dev_id,
            source,
        };
        // SOCK_NONBLOCK is required for AsyncFd to work properly
        let fd = open_hci_socket(libc::SOCK_NONBLOCK).map_err(open_err)?;
        bind_hci_socket(&fd, self.dev_id).map_err(open_err)?;
        let socket = AsyncFd::new(fd).map_err(open_err)?;

        self.socket = Some(Arc::new(socket));
        info!("Opened Bluetooth adapter hci{}", self.dev_id);
        Ok(())
    }

    fn install_event_filter(&mut self) -> Result<(), ScanError> {
        let socket = Arc::clone(self.socket()?);
        let previous = get_hci_filter(socket.get_ref()).map_err(ScanError::Filter)?;

        let mut filter = HciFilter::new();
        filter.set_ptype(HCI_EVENT_PKT);
        filter.set_all_events();
        set_hci_filter(socket.get_ref(), &filter).map_err(ScanError::Filter)?;

        // keep the first capture if called twice
        self.saved_filter.get_or_insert(previous);
        debug!(dev_id = self.dev_id, "HCI event filter installed");
        Ok(())
    }

    fn restore_event_filter(&mut self) -> Result<(), ScanError> {
        let Some(previous) = self.saved_filter else {
            return Ok(());
        };
        set_hci_filter(self.socket()?.get_ref(), &previous).map_err(ScanError::Filter)?;
        self.saved_filter = None;
        debug!(dev_id = self.dev_id, "HCI event filter restored");
        Ok(())
    }

    fn set_scan_parameters(&mut self) -> Result<(), ScanError> {
        let params = LeSetScanParametersCmd {
            scan_type: LE_SCAN_ACTIVE,
            interval: SCAN_INTERVAL,
            window: SCAN_WINDOW,
            own_address_type: LE_PUBLIC_ADDRESS,
            filter_policy: FILTER_POLICY_ACCEPT_ALL,
        };
        self.command(
            "LE Set Scan Parameters",
            OCF_LE_SET_SCAN_PARAMETERS,
            &params.to_bytes(),
        )
    }

    fn enable_scan(&mut self) -> Result<(), ScanError> {
        self.set_scan_enable(true)
    }

    fn disable_scan(&mut self) -> Result<(), ScanError> {
        self.set_scan_enable(false)
    }

    fn start_reader(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FrameResult>, ScanError> {
        let socket = Arc::clone(self.socket()?);
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);
        tokio::spawn(read_frames(socket, tx, cancel));
        Ok(rx)
    }
}

impl Drop for HciRadio {
    fn drop(&mut self) {
        if self.scanning
            && let Err(e) = self.disable_scan()
        {
            warn!("Failed to disable scanning on hci{}: {}", self.dev_id, e);
        }
        if let Err(e) = self.restore_event_filter() {
            warn!("Failed to restore event filter on hci{}: {}", self.dev_id, e);
        }
    }
}

/// Advertisement reader: forwards every frame long enough to carry an
/// advertiser address until cancelled or the socket fails.
async fn read_frames(
    socket: Arc<AsyncFd<OwnedFd>>,
    tx: mpsc::Sender<FrameResult>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; HCI_MAX_EVENT_SIZE];

    loop {
        let ready = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Advertisement reader cancelled");
                return;
            }
            ready = socket.readable() => ready,
        };

        let mut guard = match ready {
            Ok(guard) => guard,
            Err(e) => {
                let _ = tx.send(Err(ScanError::Read(e))).await;
                return;
            }
        };

        // Drain all available packets before waiting again
        loop {
            let n = match guard.try_io(|inner| read_hci_frame(inner, &mut buf)) {
                Ok(Ok(0)) => {
                    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "HCI socket closed");
                    let _ = tx.send(Err(ScanError::Read(eof))).await;
                    return;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    let _ = tx.send(Err(ScanError::Read(e))).await;
                    return;
                }
                Err(_would_block) => break,
            };

            let Some(frame) = RawAdvertisement::parse(&buf[..n]) else {
                trace!(len = n, "dropping short HCI event");
                continue;
            };

            if tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
    }
}
