//! Control-plane messages and the coalescing pump that carries them.
//!
//! A [`MessagePump`] lets any thread, including a realtime audio callback,
//! wake the control thread without blocking. The payload is a single byte
//! naming the [`Message`] kind. Each kind has an in-flight flag: while one
//! instance of a kind is unconfirmed, further sends of that kind are
//! swallowed, so a burst of identical server events costs the control thread
//! one wakeup.
//!
//! ```text
//! producer thread                         control thread
//!     │ send(kind)                             │
//!     │  flag[kind] false→true ──┐             │ poll(fd)
//!     │  write one byte ─────────┼──► pipe ───►│ get() → kind
//!     │                          │             │ ...handle...
//!     │ send(kind) again         │             │ confirm(kind)
//!     │  flag already set        │             │  flag[kind] → false
//!     │  → Coalesced             └─────────────┘
//! ```
//!
//! An I/O error other than `WouldBlock` closes that end for good. After that
//! `send` reports [`Delivery::Closed`] (do not retry) and `get` yields
//! nothing.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error};

/// One control-plane event kind. Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Message {
    Exited = 0,
    PortRegistered = 1,
    PortDeregistered = 2,
    PortConnected = 3,
    PortDisconnected = 4,
    SampleRateChanged = 5,
    ConnectionsUpdated = 6,
    CheckClients = 7,
}

impl Message {
    pub const COUNT: usize = 8;

    pub const ALL: [Message; Message::COUNT] = [
        Message::Exited,
        Message::PortRegistered,
        Message::PortDeregistered,
        Message::PortConnected,
        Message::PortDisconnected,
        Message::SampleRateChanged,
        Message::ConnectionsUpdated,
        Message::CheckClients,
    ];

    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Message::Exited => "exited",
            Message::PortRegistered => "port registered",
            Message::PortDeregistered => "port deregistered",
            Message::PortConnected => "port connected",
            Message::PortDisconnected => "port disconnected",
            Message::SampleRateChanged => "sample rate changed",
            Message::ConnectionsUpdated => "connections updated",
            Message::CheckClients => "check clients",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful [`MessagePump::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The byte was written.
    Sent,
    /// An unconfirmed message of the same kind is already pending.
    Coalesced,
    /// The pump is broken. Nothing was sent and retrying will not help.
    Closed,
}

/// The pipe is full. The flag was rolled back, so sending again later works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message pump is full, try again")]
pub struct PumpBusy;

/// Non-blocking, coalescing byte pipe from any thread to the control thread.
pub struct MessagePump {
    name: String,
    reader: Option<UnixStream>,
    writer: Option<UnixStream>,
    read_open: AtomicBool,
    write_open: AtomicBool,
    in_flight: [AtomicBool; Message::COUNT],
}

impl MessagePump {
    /// Create a pump. If the pipe cannot be made the pump starts closed and
    /// the owner keeps running without its wakeups.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let pair = UnixStream::pair().and_then(|(reader, writer)| {
            reader.set_nonblocking(true)?;
            writer.set_nonblocking(true)?;
            Ok((reader, writer))
        });

        match pair {
            Ok((reader, writer)) => Self::from_parts(name, Some(reader), Some(writer)),
            Err(e) => {
                error!("{}: cannot create message pipe: {}", name, e);
                Self::from_parts(name, None, None)
            }
        }
    }

    /// A pump that never delivers anything.
    pub fn closed(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), None, None)
    }

    fn from_parts(name: String, reader: Option<UnixStream>, writer: Option<UnixStream>) -> Self {
        Self {
            read_open: AtomicBool::new(reader.is_some()),
            write_open: AtomicBool::new(writer.is_some()),
            name,
            reader,
            writer,
            in_flight: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor the control thread polls for readability.
    pub fn fd(&self) -> Option<RawFd> {
        if self.read_open.load(Ordering::Acquire) {
            self.reader.as_ref().map(|r| r.as_raw_fd())
        } else {
            None
        }
    }

    pub fn is_closed(&self) -> bool {
        !self.read_open.load(Ordering::Acquire) || !self.write_open.load(Ordering::Acquire)
    }

    /// Notify the control thread. Safe to call from a realtime callback.
    pub fn send(&self, msg: Message) -> Result<Delivery, PumpBusy> {
        if !self.write_open.load(Ordering::Acquire) {
            return Ok(Delivery::Closed);
        }
        let Some(mut writer) = self.writer.as_ref() else {
            return Ok(Delivery::Closed);
        };

        let flag = &self.in_flight[msg.index()];
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Delivery::Coalesced);
        }

        loop {
            match writer.write(&[msg as u8]) {
                Ok(1) => return Ok(Delivery::Sent),
                Ok(_) => {
                    self.close_write(msg, "pipe accepted no data");
                    return Ok(Delivery::Closed);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    flag.store(false, Ordering::Release);
                    return Err(PumpBusy);
                }
                Err(e) => {
                    self.close_write(msg, &e.to_string());
                    return Ok(Delivery::Closed);
                }
            }
        }
    }

    fn close_write(&self, msg: Message, reason: &str) {
        if self.write_open.swap(false, Ordering::AcqRel) {
            error!("{}: closing message pipe after writing {}: {}", self.name, msg, reason);
        }
    }

    /// Next pending message, if any. Control thread only.
    pub fn get(&self) -> Option<Message> {
        if !self.read_open.load(Ordering::Acquire) {
            return None;
        }
        let mut reader = self.reader.as_ref()?;

        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte) {
                Ok(1) => match Message::from_u8(byte[0]) {
                    Some(msg) => return Some(msg),
                    None => {
                        error!("{}: dropping unknown message byte {}", self.name, byte[0]);
                        continue;
                    }
                },
                Ok(_) => {
                    self.close_read("writer hung up");
                    return None;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    self.close_read(&e.to_string());
                    return None;
                }
            }
        }
    }

    fn close_read(&self, reason: &str) {
        if self.read_open.swap(false, Ordering::AcqRel) {
            error!("{}: closing message pipe: {}", self.name, reason);
        }
    }

    /// Allow the next `send(msg)` through.
    pub fn confirm(&self, msg: Message) {
        self.in_flight[msg.index()].store(false, Ordering::Release);
    }
}

impl fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePump")
            .field("name", &self.name)
            .field("read_open", &self.read_open.load(Ordering::Relaxed))
            .field("write_open", &self.write_open.load(Ordering::Relaxed))
            .finish()
    }
}

/// A component that owns a pump and wants a say in what confirmation does.
pub trait MessageSource {
    fn pump(&self) -> &MessagePump;

    fn get_message(&self) -> Option<Message> {
        self.pump().get()
    }

    /// Clear the in-flight flag, then run [`after_confirm`](Self::after_confirm).
    fn confirm_message(&self, msg: Message) {
        self.pump().confirm(msg);
        self.after_confirm(msg);
    }

    /// Hook run after every confirmation.
    fn after_confirm(&self, msg: Message) {
        debug!("{}: confirmed {}", self.pump().name(), msg);
    }
}

impl MessageSource for MessagePump {
    fn pump(&self) -> &MessagePump {
        self
    }
}
