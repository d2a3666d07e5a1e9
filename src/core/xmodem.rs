//! XMODEM sender
//!
//! 128-byte blocks, CRC-16 when the receiver starts with 'C' and the
//! classic additive checksum when it starts with NAK. Receiver bytes come
//! from the host's tap channel, so this runs over any transport.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
pub const CRC_START: u8 = b'C';
const PAD: u8 = 0x1A;

pub const BLOCK_SIZE: usize = 128;
const MAX_RETRIES: usize = 10;

#[derive(Error, Debug)]
pub enum XmodemError {
    #[error("receiver did not start")]
    NoStart,
    #[error("block {0} rejected {1} times")]
    Retries(u8, usize),
    #[error("transfer cancelled by receiver")]
    Cancelled,
    #[error("timed out waiting for receiver")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
}

/// CRC-16/XMODEM (poly 0x1021, init 0)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Frame one block, padding short data with SUB
pub fn block(seq: u8, data: &[u8], crc: bool) -> Vec<u8> {
    let mut payload = [PAD; BLOCK_SIZE];
    let n = data.len().min(BLOCK_SIZE);
    payload[..n].copy_from_slice(&data[..n]);

    let mut frame = Vec::with_capacity(BLOCK_SIZE + 5);
    frame.extend_from_slice(&[SOH, seq, !seq]);
    frame.extend_from_slice(&payload);
    if crc {
        frame.extend_from_slice(&crc16(&payload).to_be_bytes());
    } else {
        frame.push(payload.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)));
    }
    frame
}

struct Link<'a> {
    rx: &'a Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    timeout: Duration,
}

impl Link<'_> {
    fn next_byte(&mut self) -> Result<u8, XmodemError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(b) = self.pending.pop_front() {
                return Ok(b);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(XmodemError::Timeout);
            }
            match self.rx.recv_timeout(left) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => return Err(XmodemError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(XmodemError::Closed),
            }
        }
    }

    /// Next ACK, NAK or CAN, skipping line noise
    fn next_reply(&mut self) -> Result<u8, XmodemError> {
        loop {
            match self.next_byte()? {
                b @ (ACK | NAK | CAN) => return Ok(b),
                other => debug!("xmodem: ignoring 0x{:02x}", other),
            }
        }
    }
}

/// Send `data` to an XMODEM receiver. `out` writes to the connection,
/// `rx` delivers what the receiver sends back. Returns the bytes sent.
pub fn send(
    data: &[u8],
    out: &mut dyn FnMut(&[u8]) -> Result<(), String>,
    rx: &Receiver<Vec<u8>>,
    timeout: Duration,
    progress: &mut dyn FnMut(usize),
) -> Result<usize, XmodemError> {
    let mut link = Link {
        rx,
        pending: VecDeque::new(),
        timeout,
    };

    let crc = loop {
        match link.next_byte() {
            Ok(CRC_START) => break true,
            Ok(NAK) => break false,
            Ok(CAN) => return Err(XmodemError::Cancelled),
            Ok(_) => continue,
            Err(XmodemError::Timeout) => return Err(XmodemError::NoStart),
            Err(e) => return Err(e),
        }
    };
    info!("xmodem: sending {} bytes ({})", data.len(), if crc { "crc" } else { "checksum" });

    let mut seq: u8 = 1;
    let mut sent = 0;
    for chunk in data.chunks(BLOCK_SIZE) {
        let frame = block(seq, chunk, crc);
        let mut tries = 0;
        loop {
            out(&frame).map_err(XmodemError::Write)?;
            match link.next_reply()? {
                ACK => break,
                CAN => return Err(XmodemError::Cancelled),
                _ => {
                    tries += 1;
                    if tries >= MAX_RETRIES {
                        return Err(XmodemError::Retries(seq, tries));
                    }
                    debug!("xmodem: block {} resent", seq);
                }
            }
        }
        sent += chunk.len();
        progress(sent);
        seq = seq.wrapping_add(1);
    }

    for _ in 0..MAX_RETRIES {
        out(&[EOT]).map_err(XmodemError::Write)?;
        match link.next_reply()? {
            ACK => {
                info!("xmodem: done, {} bytes", sent);
                return Ok(sent);
            }
            CAN => return Err(XmodemError::Cancelled),
            _ => continue,
        }
    }
    Err(XmodemError::Retries(seq, MAX_RETRIES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_block_layout() {
        let frame = block(2, b"hi", true);
        assert_eq!(frame.len(), 3 + BLOCK_SIZE + 2);
        assert_eq!(&frame[..5], &[SOH, 2, 0xFD, b'h', b'i']);
        assert_eq!(frame[5], PAD);
        let crc = crc16(&frame[3..3 + BLOCK_SIZE]);
        assert_eq!(&frame[3 + BLOCK_SIZE..], &crc.to_be_bytes());

        let plain = block(1, &[1, 2], false);
        assert_eq!(plain.len(), 3 + BLOCK_SIZE + 1);
        let sum = 3u8.wrapping_add(PAD.wrapping_mul((BLOCK_SIZE - 2) as u8));
        assert_eq!(*plain.last().unwrap(), sum);
    }

    /// Receiver that NAKs the first copy of block 1, then ACKs everything
    fn receiver(frames: mpsc::Receiver<Vec<u8>>, replies: mpsc::Sender<Vec<u8>>) -> thread::JoinHandle<(Vec<u8>, usize)> {
        thread::spawn(move || {
            replies.send(vec![b'x', CRC_START]).unwrap();
            let mut data = Vec::new();
            let mut seen = 0;
            let mut nak_sent = false;
            for frame in frames {
                seen += 1;
                if frame == [EOT] {
                    replies.send(vec![ACK]).unwrap();
                    break;
                }
                let payload = &frame[3..3 + BLOCK_SIZE];
                let crc = u16::from_be_bytes([frame[3 + BLOCK_SIZE], frame[4 + BLOCK_SIZE]]);
                assert_eq!(crc, crc16(payload));
                if frame[1] == 1 && !nak_sent {
                    nak_sent = true;
                    replies.send(vec![NAK]).unwrap();
                    continue;
                }
                data.extend_from_slice(payload);
                replies.send(vec![ACK]).unwrap();
            }
            (data, seen)
        })
    }

    #[test]
    fn test_send_with_retry() {
        let (frame_tx, frame_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let handle = receiver(frame_rx, reply_tx);

        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let mut last = 0;
        let sent = send(
            &data,
            &mut |frame| frame_tx.send(frame.to_vec()).map_err(|e| e.to_string()),
            &reply_rx,
            Duration::from_secs(5),
            &mut |n| last = n,
        )
        .unwrap();
        drop(frame_tx);

        let (received, frames) = handle.join().unwrap();
        assert_eq!(sent, 300);
        assert_eq!(last, 300);
        // three blocks, one resend, one EOT
        assert_eq!(frames, 5);
        assert_eq!(&received[..300], &data[..]);
        assert!(received[300..].iter().all(|&b| b == PAD));
    }

    #[test]
    fn test_cancel_before_start() {
        let (reply_tx, reply_rx) = mpsc::channel();
        reply_tx.send(vec![CAN]).unwrap();
        let err = send(b"x", &mut |_| Ok(()), &reply_rx, Duration::from_secs(1), &mut |_| {}).unwrap_err();
        assert!(matches!(err, XmodemError::Cancelled));
    }

    #[test]
    fn test_no_receiver() {
        let (_reply_tx, reply_rx) = mpsc::channel::<Vec<u8>>();
        let err = send(b"x", &mut |_| Ok(()), &reply_rx, Duration::from_millis(50), &mut |_| {}).unwrap_err();
        assert!(matches!(err, XmodemError::NoStart));
    }
}
