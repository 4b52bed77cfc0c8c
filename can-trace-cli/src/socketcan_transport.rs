//! SocketCAN transport (Linux only)
//!
//! Bitrate and bus state are owned by the kernel interface (`ip link set can0
//! type can bitrate 250000`), so the requested bitrate is only logged.
//! Listen-only connections refuse to transmit.

use can_trace_engine::{
    Bitrate, Connector, Frame, Transport, TransportError, TransportErrorKind,
};
use socketcan::{
    CanDataFrame, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as _, Id, Socket,
    StandardId,
};
use std::io;
use std::time::{Duration, Instant};

// errno values reported by the CAN netdevice layer
const ENODEV: i32 = 19;
const EIO: i32 = 5;
const ENETDOWN: i32 = 100;
const ENOBUFS: i32 = 105;

/// Opens raw CAN sockets on a named interface
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketCanConnector;

impl Connector for SocketCanConnector {
    fn connect(
        &self,
        channel: &str,
        bitrate: Bitrate,
        listen_only: bool,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let socket = CanSocket::open(channel).map_err(|e| map_io_error(&e, channel))?;
        log::info!(
            "Opened SocketCAN interface {} (expects {} configured on the link{})",
            channel,
            bitrate,
            if listen_only { ", listen-only" } else { "" }
        );
        Ok(Box::new(SocketCanTransport {
            socket: Some(socket),
            channel: channel.to_string(),
            listen_only,
            read_timeout: None,
            opened_at: Instant::now(),
        }))
    }
}

pub struct SocketCanTransport {
    socket: Option<CanSocket>,
    channel: String,
    listen_only: bool,
    read_timeout: Option<Duration>,
    opened_at: Instant,
}

impl SocketCanTransport {
    fn socket(&self) -> Result<&CanSocket, TransportError> {
        self.socket.as_ref().ok_or_else(TransportError::closed)
    }
}

impl Transport for SocketCanTransport {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if self.listen_only {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                format!("{} is open listen-only", self.channel),
            ));
        }
        let outgoing = to_socket_frame(frame)?;
        self.socket()?
            .write_frame(&outgoing)
            .map_err(|e| map_io_error(&e, &self.channel))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        if self.read_timeout != Some(timeout) {
            self.socket()?
                .set_read_timeout(timeout)
                .map_err(|e| map_io_error(&e, &self.channel))?;
            self.read_timeout = Some(timeout);
        }

        let received = match self.socket()?.read_frame() {
            Ok(received) => received,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(e) => return Err(map_io_error(&e, &self.channel)),
        };

        match received {
            CanFrame::Data(data) => {
                let timestamp = self.opened_at.elapsed().as_secs_f64();
                Frame::with_format(
                    timestamp,
                    data.raw_id() & 0x1FFF_FFFF,
                    data.is_extended(),
                    data.data(),
                )
                .map(Some)
                .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))
            }
            CanFrame::Remote(_) => Ok(None),
            CanFrame::Error(_) => {
                log::debug!("Error frame on {}", self.channel);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("Closed SocketCAN interface {}", self.channel);
        }
    }
}

fn to_socket_frame(frame: &Frame) -> Result<CanDataFrame, TransportError> {
    let id = if frame.is_extended() {
        ExtendedId::new(frame.identifier()).map(Id::Extended)
    } else {
        u16::try_from(frame.identifier())
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    };
    id.and_then(|id| CanDataFrame::new(id, frame.data()))
        .ok_or_else(|| {
            TransportError::new(
                TransportErrorKind::Other,
                format!("cannot encode frame {:08X}", frame.identifier()),
            )
        })
}

fn map_io_error(err: &io::Error, channel: &str) -> TransportError {
    let kind = match (err.kind(), err.raw_os_error()) {
        (io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut, _) => TransportErrorKind::Timeout,
        (_, Some(ENOBUFS)) => TransportErrorKind::Timeout,
        (_, Some(ENETDOWN)) => TransportErrorKind::BusOff,
        (_, Some(EIO)) => TransportErrorKind::UsbIo,
        (io::ErrorKind::PermissionDenied, _) => TransportErrorKind::PermissionDenied,
        (io::ErrorKind::NotFound, _) | (_, Some(ENODEV)) => TransportErrorKind::DeviceNotFound,
        _ => TransportErrorKind::Other,
    };
    TransportError::new(kind, format!("{}: {}", channel, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use socketcan::Frame as _;

    #[test]
    fn test_error_classification() {
        let cases = [
            (io::Error::from_raw_os_error(ENOBUFS), TransportErrorKind::Timeout),
            (io::Error::from_raw_os_error(ENETDOWN), TransportErrorKind::BusOff),
            (io::Error::from_raw_os_error(EIO), TransportErrorKind::UsbIo),
            (io::Error::from_raw_os_error(ENODEV), TransportErrorKind::DeviceNotFound),
            (
                io::Error::from(io::ErrorKind::PermissionDenied),
                TransportErrorKind::PermissionDenied,
            ),
            (io::Error::from(io::ErrorKind::WouldBlock), TransportErrorKind::Timeout),
            (io::Error::from(io::ErrorKind::InvalidData), TransportErrorKind::Other),
        ];
        for (err, expected) in cases {
            assert_eq!(map_io_error(&err, "can0").kind, expected, "{}", err);
        }
    }

    #[test]
    fn test_frame_encoding() {
        let standard = Frame::new(0.0, 0x123, vec![1, 2, 3]).unwrap();
        let encoded = to_socket_frame(&standard).unwrap();
        assert_eq!(encoded.raw_id(), 0x123);
        assert!(!encoded.is_extended());
        assert_eq!(encoded.data(), &[1, 2, 3]);

        let extended = Frame::with_format(0.0, 0x100, true, vec![]).unwrap();
        assert!(to_socket_frame(&extended).unwrap().is_extended());
    }

    #[test]
    fn test_missing_interface() {
        let err = SocketCanConnector
            .connect("nosuchcan42", Bitrate::Kbps250, true)
            .err()
            .unwrap();
        assert!(!err.is_transient());
    }
}
