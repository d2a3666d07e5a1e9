//! Serial port reader

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::spec::{Parity, SerialSpec};
use super::{HostError, HostInner, Transport};

pub(super) fn run(host: &HostInner, spec: SerialSpec) -> Result<(), HostError> {
    let timeout = Duration::from_millis(host.config.serial.read_timeout_ms);
    let serial_err = |source| HostError::Serial {
        port: spec.port.clone(),
        source,
    };
    let mut port = serialport::new(&spec.port, spec.baud)
        .data_bits(data_bits(spec.data_bits))
        .parity(match spec.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        })
        .stop_bits(if spec.stop_bits == 2 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        })
        .timeout(timeout)
        .open()
        .map_err(serial_err)?;
    let writer = port.try_clone().map_err(serial_err)?;

    if host.exiting() {
        return Ok(());
    }
    host.connected(
        Transport::Serial(Arc::new(Mutex::new(writer))),
        &format!("{} {} baud", spec.port, spec.baud),
    );

    let mut buf = [0u8; 4096];
    while !host.exiting() {
        match port.read(&mut buf) {
            // a read timeout is an idle tick
            Ok(0) => continue,
            Ok(n) => host.deliver(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(HostError::Read(e)),
        }
    }
    Ok(())
}

fn data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}
