//! OS signals as pollable descriptors.
//!
//! Handlers only write a byte into a non-blocking socket pair, the
//! scheduler polls the read ends next to its message pumps.

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::low_level::pipe;
use signal_hook::SigId;
use tracing::{debug, info};

/// What arrived since the last drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvents {
    pub stop: bool,
    pub reload: bool,
}

pub struct Signals {
    stop: UnixStream,
    reload: UnixStream,
    ids: Vec<SigId>,
}

fn channel() -> io::Result<(UnixStream, UnixStream)> {
    let (reader, writer) = UnixStream::pair()?;
    reader.set_nonblocking(true)?;
    writer.set_nonblocking(true)?;
    Ok((reader, writer))
}

impl Signals {
    /// Route SIGTERM and SIGINT to the stop descriptor, SIGHUP to reload.
    pub fn install() -> io::Result<Self> {
        let (stop, stop_writer) = channel()?;
        let (reload, reload_writer) = channel()?;

        let ids = vec![
            pipe::register(SIGTERM, stop_writer.try_clone()?)?,
            pipe::register(SIGINT, stop_writer)?,
            pipe::register(SIGHUP, reload_writer)?,
        ];
        debug!("installed signal handlers");

        Ok(Self { stop, reload, ids })
    }

    pub fn fds(&self) -> [RawFd; 2] {
        [self.stop.as_raw_fd(), self.reload.as_raw_fd()]
    }

    /// Read everything pending on both descriptors.
    pub fn drain(&mut self) -> SignalEvents {
        let events = SignalEvents {
            stop: drain(&mut self.stop),
            reload: drain(&mut self.reload),
        };
        if events.stop {
            info!("caught termination signal");
        }
        if events.reload {
            info!("caught SIGHUP, reloading configuration");
        }
        events
    }
}

impl Drop for Signals {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

fn drain(stream: &mut UnixStream) -> bool {
    let mut buf = [0u8; 16];
    let mut any = false;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return any,
            Ok(_) => any = true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return any,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hangup_requests_reload() {
        let mut signals = Signals::install().unwrap();
        assert_eq!(signals.drain(), SignalEvents::default());

        signal_hook::low_level::raise(SIGHUP).unwrap();
        let events = signals.drain();
        assert!(events.reload);
        assert!(!events.stop);
    }
}
