//! Packet I/O.
//!
//! Reads and writes are single-packet and non-blocking at the host level.
//! [`Interface::blocking_read`] layers the event bridge on top: it parks until
//! the host signals traffic, then drains with non-blocking reads, looping on
//! spurious or already-consumed wakeups.

use crate::error::{ErrorKind, Result, VmnetError, classify};
use crate::interface::Interface;

/// Result of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<'a> {
    /// Nothing is queued. Not an error.
    Empty,
    /// One packet, as the prefix of the caller's buffer.
    Data(&'a mut [u8]),
}

impl<'a> ReadOutcome<'a> {
    /// Returns the packet, if any.
    #[must_use]
    pub fn into_data(self) -> Option<&'a mut [u8]> {
        match self {
            Self::Data(data) => Some(data),
            Self::Empty => None,
        }
    }
}

/// Decodes a signed native transfer status.
///
/// Positive values are byte counts, zero means no data, negative values
/// carry `-status`.
///
/// # Errors
///
/// Returns the classified status for negative values.
pub fn decode_transfer(raw: isize) -> std::result::Result<usize, ErrorKind> {
    if raw >= 0 {
        Ok(raw.unsigned_abs())
    } else {
        let code = u32::try_from(raw.unsigned_abs()).unwrap_or(u32::MAX);
        Err(classify(code))
    }
}

impl Interface {
    /// Reads one packet without blocking.
    ///
    /// `buf` must hold at least [`max_packet_size`](Self::max_packet_size)
    /// bytes. On success the packet is returned as `buf[..len]`.
    ///
    /// # Errors
    ///
    /// - [`VmnetError::BufferTooSmall`] if `buf` is shorter than the maximum
    ///   packet size
    /// - [`VmnetError::Native`] if the host read fails
    pub fn read<'a>(&self, buf: &'a mut [u8]) -> Result<ReadOutcome<'a>> {
        self.ensure_running()?;
        let required = self.max_packet_size();
        if buf.len() < required {
            return Err(VmnetError::BufferTooSmall {
                len: buf.len(),
                required,
            });
        }

        match decode_transfer(self.native.read(buf))? {
            0 => Ok(ReadOutcome::Empty),
            len => {
                let len = len.min(buf.len());
                tracing::trace!(name = %self.name(), len, "packet read");
                Ok(ReadOutcome::Data(&mut buf[..len]))
            }
        }
    }

    /// Writes one packet.
    ///
    /// Not guaranteed to be non-blocking; the host may apply backpressure.
    ///
    /// # Errors
    ///
    /// - [`VmnetError::Native`] with [`ErrorKind::PacketTooBig`] if `bytes`
    ///   exceeds the maximum packet size. Nothing is sent in that case.
    /// - [`VmnetError::Native`] for any other host failure
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.ensure_running()?;
        if bytes.len() > self.max_packet_size() {
            return Err(VmnetError::Native(ErrorKind::PacketTooBig));
        }

        let written = decode_transfer(self.native.write(bytes))?;
        tracing::trace!(name = %self.name(), len = written, "packet written");
        Ok(written)
    }

    /// Blocks until a packet arrives and reads it.
    ///
    /// Never reports an empty queue: wakeups that find nothing to read are
    /// absorbed and the call waits again. Host errors are returned at once
    /// and never retried.
    ///
    /// # Errors
    ///
    /// - [`VmnetError::EventsNotInstalled`] if
    ///   [`install_event_bridge`](Self::install_event_bridge) was not called
    /// - [`VmnetError::Stopped`] if the interface is stopped, including while
    ///   this call is blocked
    /// - any error from [`read`](Self::read)
    pub fn blocking_read<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8]> {
        loop {
            self.wait_for_packets()?;
            // Re-borrow per iteration so only the successful read escapes.
            let len = match self.read(&mut *buf)? {
                ReadOutcome::Data(data) => data.len(),
                ReadOutcome::Empty => continue,
            };
            return Ok(&mut buf[..len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::interface::InterfaceConfig;
    use crate::sim::SimulatedHost;

    fn setup() -> (Arc<SimulatedHost>, Interface) {
        let host = Arc::new(SimulatedHost::new());
        let iface = Interface::create_with(host.clone(), InterfaceConfig::shared()).unwrap();
        (host, iface)
    }

    #[test]
    fn test_decode_transfer() {
        assert_eq!(decode_transfer(64), Ok(64));
        assert_eq!(decode_transfer(0), Ok(0));
        assert_eq!(decode_transfer(-1006), Err(ErrorKind::PacketTooBig));
        assert_eq!(decode_transfer(-9999), Err(ErrorKind::Unknown(9999)));
    }

    #[test]
    fn test_read_empty() {
        let (_host, iface) = setup();
        let mut buf = vec![0u8; iface.max_packet_size()];
        assert_eq!(iface.read(&mut buf).unwrap(), ReadOutcome::Empty);
    }

    #[test]
    fn test_read_returns_prefix_view() {
        let (host, iface) = setup();
        let port = host.port(iface.uuid()).unwrap();
        port.inject(vec![0xAB; 60]);

        let mut buf = vec![0u8; iface.max_packet_size()];
        let data = iface.read(&mut buf).unwrap().into_data().unwrap();
        assert_eq!(data.len(), 60);
        assert!(data.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_read_rejects_short_buffer() {
        let (_host, iface) = setup();
        let mut buf = [0u8; 64];
        let err = iface.read(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            VmnetError::BufferTooSmall {
                len: 64,
                required: 1518
            }
        ));
    }

    #[test]
    fn test_write_delivers_to_peer() {
        let (host, iface) = setup();
        let port = host.port(iface.uuid()).unwrap();

        assert_eq!(iface.write(&[1, 2, 3, 4]).unwrap(), 4);
        assert_eq!(port.take_sent(), vec![vec![1u8, 2, 3, 4]]);
    }

    #[test]
    fn test_write_too_big_leaves_state_untouched() {
        let (host, iface) = setup();
        let port = host.port(iface.uuid()).unwrap();

        let oversized = vec![0u8; iface.max_packet_size() + 1];
        let err = iface.write(&oversized).unwrap_err();
        assert!(err.is_native(ErrorKind::PacketTooBig));
        assert!(port.take_sent().is_empty());

        let exact = vec![0u8; iface.max_packet_size()];
        assert_eq!(iface.write(&exact).unwrap(), exact.len());
    }

    #[test]
    fn test_blocking_read_waits_for_delivery() {
        let (host, iface) = setup();
        iface.install_event_bridge().unwrap();
        let port = host.port(iface.uuid()).unwrap();

        let injector = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            port.inject(vec![7; 42]);
        });

        let mut buf = vec![0u8; iface.max_packet_size()];
        let data = iface.blocking_read(&mut buf).unwrap();
        assert_eq!(data, &[7u8; 42][..]);
        injector.join().unwrap();
    }

    #[test]
    fn test_blocking_read_skips_drained_wakeup() {
        let (host, iface) = setup();
        iface.install_event_bridge().unwrap();
        let port = host.port(iface.uuid()).unwrap();

        // Deliver and drain before blocking_read runs: the pending wakeup
        // finds an empty queue and must be absorbed.
        port.inject(vec![1; 10]);
        host.flush();
        let mut buf = vec![0u8; iface.max_packet_size()];
        assert!(iface.read(&mut buf).unwrap().into_data().is_some());
        assert!(iface.events().has_pending());

        let late = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            port.inject(vec![2; 20]);
        });

        let data = iface.blocking_read(&mut buf).unwrap();
        assert_eq!(data, &[2u8; 20][..]);
        late.join().unwrap();
    }

    #[test]
    fn test_stop_releases_blocked_reader() {
        let (_host, iface) = setup();
        iface.install_event_bridge().unwrap();
        let iface = Arc::new(iface);

        let (tx, rx) = std::sync::mpsc::channel();
        let reader = {
            let iface = Arc::clone(&iface);
            thread::spawn(move || {
                let mut buf = vec![0u8; iface.max_packet_size()];
                let result = iface.blocking_read(&mut buf).map(|frame| frame.len());
                tx.send(result).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(30));
        iface.stop().unwrap();

        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reader still blocked after stop");
        assert!(matches!(result, Err(VmnetError::Stopped)));
        reader.join().unwrap();
    }

    #[test]
    fn test_blocking_read_requires_bridge() {
        let (_host, iface) = setup();
        let mut buf = vec![0u8; iface.max_packet_size()];
        assert!(matches!(
            iface.blocking_read(&mut buf),
            Err(VmnetError::EventsNotInstalled)
        ));
    }

    #[test]
    fn test_io_after_stop() {
        let (_host, iface) = setup();
        iface.stop().unwrap();
        let mut buf = vec![0u8; iface.max_packet_size()];
        assert!(matches!(iface.read(&mut buf), Err(VmnetError::Stopped)));
        assert!(matches!(iface.write(&[0u8; 4]), Err(VmnetError::Stopped)));
    }
}
