use alloc::sync::Arc;
use core::task::Waker;

use crate::stream::{Direction, Error, Readiness, Stream, Waitable, WriteFlags};
use crate::wire::Ipv4Address;

use super::{pending, ConnectionInfo, Shared, TcpState};

/// The application handle of a connection.
///
/// Dropping the handle closes the stream.
pub struct TcpStream {
    shared: Arc<Shared>,
    closed: bool,
}

impl TcpStream {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        TcpStream { shared, closed: false }
    }

    /// The current state of the connection.
    pub fn state(&self) -> TcpState {
        self.shared.tcb.lock().state
    }

    /// A snapshot of the connection.
    pub fn info(&self) -> ConnectionInfo {
        self.shared.tcb.lock().info()
    }

    /// Why the connection ended, if it did not end in an orderly close.
    pub fn error(&self) -> Option<Error> {
        self.shared.tcb.lock().error
    }

    /// Our address.
    pub fn local_addr(&self) -> Ipv4Address {
        self.shared.endpoints.local_addr
    }

    /// Our port.
    pub fn local_port(&self) -> u16 {
        self.shared.endpoints.local_port
    }

    /// The address of the peer.
    pub fn remote_addr(&self) -> Ipv4Address {
        self.shared.endpoints.remote_addr
    }

    /// The port of the peer.
    pub fn remote_port(&self) -> u16 {
        self.shared.endpoints.remote_port
    }

    fn waitable(&self, direction: Direction, minimum: usize) -> Waitable {
        Waitable::new(self.shared.clone(), direction, minimum)
    }

    #[cfg(feature = "std")]
    fn block(&self, direction: Direction, minimum: usize) -> Result<(), Error> {
        self.waitable(direction, minimum).wait();
        Ok(())
    }

    #[cfg(not(feature = "std"))]
    fn block(&self, _: Direction, _: usize) -> Result<(), Error> {
        Err(Error::WouldBlock)
    }
}

impl Stream for TcpStream {
    fn read(&mut self, buf: &mut [u8], minimum: usize) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let minimum = minimum.max(1).min(buf.len());
        loop {
            let (count, reopen) = {
                let mut tcb = self.shared.tcb.lock();
                let readable = tcb.readable();
                if readable == 0 && tcb.is_eof() {
                    return Err(tcb.error.unwrap_or(Error::NotConnected));
                }

                if readable >= minimum || tcb.is_eof() {
                    let count = readable.min(buf.len());
                    let rd = tcb.rcv.rd;
                    tcb.rx.read_at(rd.as_u32(), &mut buf[..count]);
                    tcb.rcv.rd += count;
                    (count, tcb.window_closed && !tcb.rx_starved())
                } else {
                    (0, false)
                }
            };

            if count > 0 {
                if reopen {
                    self.shared.request(pending::WINDOW);
                }
                return Ok(count);
            }

            self.block(Direction::Read, minimum)?;
        }
    }

    fn write(&mut self, buf: &[u8], flags: WriteFlags) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        if buf.is_empty() {
            self.shared.request(pending::FLUSH);
            return Ok(0);
        }

        let mut written = 0;
        loop {
            let count = {
                let mut tcb = self.shared.tcb.lock();
                if !tcb.can_write() {
                    if written > 0 {
                        return Ok(written);
                    }
                    return Err(tcb.error.unwrap_or(Error::NotConnected));
                }

                let count = tcb.tx_free().min(buf.len() - written);
                let wr = tcb.snd.wr;
                tcb.tx.write_at(wr.as_u32(), &buf[written..written + count]);
                tcb.snd.wr += count;
                count
            };

            if count > 0 {
                written += count;
                self.shared.request(pending::WRITE);
            }

            let done = written == buf.len()
                || flags.contains(WriteFlags::NO_WAIT)
                || (written > 0 && !flags.contains(WriteFlags::ALL));
            if done {
                return Ok(written);
            }

            self.block(Direction::Write, 1)?;
        }
    }

    fn poll(&self, direction: Direction) -> Option<Waitable> {
        if self.closed || self.shared.is_ready(direction, 1) {
            None
        } else {
            Some(self.waitable(direction, 1))
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.tcb.lock().app_closed = true;
        self.shared.request(pending::CLOSE);
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        Stream::close(self)
    }
}

impl Readiness for Shared {
    fn is_ready(&self, direction: Direction, minimum: usize) -> bool {
        let tcb = self.tcb.lock();
        match direction {
            Direction::Read => tcb.readable() >= minimum.max(1) || tcb.is_eof(),
            Direction::Write => tcb.tx_free() > 0 || !tcb.can_write(),
        }
    }

    fn register(&self, direction: Direction, waker: &Waker) {
        match direction {
            Direction::Read => self.readers.register(waker),
            Direction::Write => self.writers.register(waker),
        }
    }
}
