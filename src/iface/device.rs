//! Raw Ethernet frame devices
//!
//! A [`Device`] is where the event loop reads frames from and writes frames
//! to. [`TapDevice`] opens a Linux tap interface; [`QueueDevice`] connects
//! two stacks in memory.

use std::io;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

use tracing::{debug, trace};
use tun_tap::{Iface, Mode};

use crate::error::DeviceError;
use crate::link::ethernet::ETHERNET_HEADER_LEN;

pub trait Device {
    /// Next frame if one is waiting; never blocks
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, DeviceError>;

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError>;
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        (**self).read_frame()
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        (**self).write_frame(frame)
    }
}

/// Linux tap interface in non-blocking mode
pub struct TapDevice {
    iface: Iface,
    buf: Vec<u8>,
    max_frame: usize,
}

impl TapDevice {
    /// Open (or create) the tap interface `name`; the host side still has
    /// to be addressed and brought up
    pub fn open(name: &str, mtu: usize) -> Result<Self, DeviceError> {
        let iface = Iface::without_packet_info(name, Mode::Tap)?;
        iface.set_non_blocking()?;
        let max_frame = mtu + ETHERNET_HEADER_LEN;
        debug!(name = iface.name(), mtu, "tap device opened");
        Ok(TapDevice {
            iface,
            buf: vec![0u8; max_frame + 4],
            max_frame,
        })
    }

    pub fn name(&self) -> &str {
        self.iface.name()
    }
}

impl Device for TapDevice {
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        match self.iface.recv(&mut self.buf) {
            Ok(nbytes) => {
                trace!(nbytes, "frame received");
                Ok(Some(self.buf[..nbytes].to_vec()))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        if frame.len() > self.max_frame {
            return Err(DeviceError::FrameTooLarge(frame.len()));
        }
        self.iface.send(frame)?;
        Ok(())
    }
}

/// In-memory device; frames written to one end of a [`QueueDevice::pair`]
/// are read from the other
#[derive(Debug)]
pub struct QueueDevice {
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
}

impl QueueDevice {
    pub fn pair() -> (QueueDevice, QueueDevice) {
        let (a_tx, b_rx) = channel();
        let (b_tx, a_rx) = channel();
        (
            QueueDevice { rx: a_rx, tx: a_tx },
            QueueDevice { rx: b_rx, tx: b_tx },
        )
    }
}

impl Device for QueueDevice {
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        // A vanished peer is a cable pulled out: the frame is lost.
        let _ = self.tx.send(frame.to_vec());
        Ok(())
    }
}
