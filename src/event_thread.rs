//! Dedicated event threads
//!
//! Polls a line-oriented file descriptor with mio on its own thread and hands
//! every complete line to a handler. A mio `Waker` registered on the same
//! poll acts as the shutdown pipe, so a blocked wait returns as soon as the
//! owner asks the thread to stop.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

const SOURCE: Token = Token(0);
const SHUTDOWN: Token = Token(1);

/// Longest line kept before it is discarded as garbage
const MAX_LINE: usize = 4096;

/// Non-blocking reader that splits its input into lines
#[derive(Debug)]
pub struct LineSource<R> {
    reader: R,
    pending: Vec<u8>,
}

impl LineSource<File> {
    /// Open a FIFO or character device without waiting for a writer
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("Failed to open event source {:?}", path))?;
        Ok(Self::from_nonblocking(file))
    }
}

impl<R: Read + AsRawFd> LineSource<R> {
    /// Wrap `reader`, switching its descriptor to non-blocking mode
    pub fn new(reader: R) -> io::Result<Self> {
        set_nonblocking(reader.as_raw_fd())?;
        Ok(Self::from_nonblocking(reader))
    }

    fn from_nonblocking(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    /// Read everything available, pushing complete lines into `lines`
    ///
    /// Returns `false` once the writer side is closed.
    fn drain(&mut self, lines: &mut Vec<String>) -> io::Result<bool> {
        let mut buf = [0u8; 512];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    self.split_lines(lines);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn split_lines(&mut self, lines: &mut Vec<String>) {
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..end]);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        if self.pending.len() > MAX_LINE {
            warn!(bytes = self.pending.len(), "Discarding overlong event line");
            self.pending.clear();
        }
    }
}

impl<R: AsRawFd> AsRawFd for LineSource<R> {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we borrow for the duration of the call
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A background thread blocked on one event source
///
/// Dropping the handle wakes the thread and joins it.
#[derive(Debug)]
pub struct EventThread {
    name: String,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    /// Deliver each line read from `source` to `handler`
    pub fn spawn<R, F>(name: impl Into<String>, mut source: LineSource<R>, mut handler: F) -> Result<Self>
    where
        R: Read + AsRawFd + Send + 'static,
        F: FnMut(&str) + Send + 'static,
    {
        let name = name.into();
        let poll = Poll::new().context("Failed to create mio Poll")?;
        let waker = Arc::new(Waker::new(poll.registry(), SHUTDOWN).context("Failed to create shutdown waker")?);

        let fd = source.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), SOURCE, Interest::READABLE)
            .context("Failed to register event source with mio")?;

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                run(poll, &thread_name, None, |registry, readable| {
                    if !readable {
                        return;
                    }
                    let mut lines = Vec::new();
                    let open = match source.drain(&mut lines) {
                        Ok(open) => open,
                        Err(e) => {
                            warn!(thread = %thread_name, "Event source read failed: {}", e);
                            false
                        }
                    };
                    for line in &lines {
                        handler(line);
                    }
                    if !open {
                        debug!(thread = %thread_name, "Event source closed");
                        let fd = source.as_raw_fd();
                        let _ = registry.deregister(&mut SourceFd(&fd));
                    }
                })
            })
            .with_context(|| format!("Failed to spawn {name} thread"))?;

        info!(thread = %name, "Event thread started");
        Ok(Self {
            name,
            waker,
            handle: Some(handle),
        })
    }

    /// Call `tick` once per `period` until shut down
    ///
    /// Used where no hardware refresh source exists.
    pub fn spawn_ticker<F>(name: impl Into<String>, period: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let poll = Poll::new().context("Failed to create mio Poll")?;
        let waker = Arc::new(Waker::new(poll.registry(), SHUTDOWN).context("Failed to create shutdown waker")?);

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                run(poll, &thread_name, Some(period), |_, readable| {
                    if !readable {
                        tick();
                    }
                })
            })
            .with_context(|| format!("Failed to spawn {name} thread"))?;

        info!(thread = %name, ?period, "Ticker thread started");
        Ok(Self {
            name,
            waker,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake the thread and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = self.waker.wake() {
            warn!(thread = %self.name, "Failed to wake event thread: {}", e);
            return;
        }
        if handle.join().is_err() {
            warn!(thread = %self.name, "Event thread panicked");
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll until the shutdown token fires
///
/// `on_event` gets `true` for source readiness and `false` when a periodic
/// deadline passed.
fn run<F>(mut poll: Poll, name: &str, period: Option<Duration>, mut on_event: F)
where
    F: FnMut(&mio::Registry, bool),
{
    let mut events = Events::with_capacity(8);
    let mut deadline = period.map(|p| Instant::now() + p);
    loop {
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(thread = %name, "Event poll failed: {}", e);
            return;
        }

        for event in events.iter() {
            match event.token() {
                SHUTDOWN => {
                    debug!(thread = %name, "Event thread shutting down");
                    return;
                }
                SOURCE => on_event(poll.registry(), true),
                _ => {}
            }
        }

        if let (Some(period), Some(due)) = (period, deadline) {
            let now = Instant::now();
            if now >= due {
                on_event(poll.registry(), false);
                // Skip missed periods instead of bursting
                let mut next = due + period;
                while next <= now {
                    next += period;
                }
                deadline = Some(next);
            }
        }
    }
}
