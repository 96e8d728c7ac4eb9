//! Release list for the handles opened on behalf of one process.
//!
//! Entries are pushed as each endpoint opens, so a setup that fails halfway
//! can still close everything it opened. Releasing drains the list: the
//! second release finds nothing to close.

use crate::io::fifo::Fifo;
use crate::io::relay::StreamRole;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;

/// What a released handle was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Write end held on the stdin fifo so it never reports end-of-stream early.
    StdinKeepAlive,
    /// Shim-held write end of a fifo.
    FifoWriter(StreamRole),
    /// Shim-held read end of a fifo.
    FifoReader(StreamRole),
    /// Shim-side end of a container pipe.
    ContainerPipe(StreamRole),
    /// Pseudo-terminal master.
    ConsoleMaster,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::StdinKeepAlive => f.write_str("stdin keep-alive"),
            ResourceKind::FifoWriter(role) => write!(f, "{} fifo writer", role),
            ResourceKind::FifoReader(role) => write!(f, "{} fifo reader", role),
            ResourceKind::ContainerPipe(role) => write!(f, "{} container pipe", role),
            ResourceKind::ConsoleMaster => f.write_str("console master"),
        }
    }
}

/// A handle owned by the release list. Dropping it closes it.
#[derive(Debug)]
pub enum Handle {
    Fifo(Fifo),
    File(File),
}

impl From<Fifo> for Handle {
    fn from(fifo: Fifo) -> Self {
        Handle::Fifo(fifo)
    }
}

impl From<File> for Handle {
    fn from(file: File) -> Self {
        Handle::File(file)
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<(ResourceKind, Handle)>,
    released: bool,
}

/// Ordered set of handles to close exactly once.
#[derive(Default)]
pub struct ReleaseList {
    inner: Mutex<Inner>,
}

impl ReleaseList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `handle`.
    ///
    /// After the list has been released the handle is closed immediately.
    pub fn push(&self, kind: ResourceKind, handle: impl Into<Handle>) {
        let handle = handle.into();
        let mut inner = self.inner.lock();
        if inner.released {
            drop(inner);
            tracing::debug!(resource = %kind, "closing handle registered after release");
            drop(handle);
            return;
        }
        inner.entries.push((kind, handle));
    }

    /// Remove and close the first entry of `kind`, if any.
    pub fn release_one(&self, kind: ResourceKind) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            let index = inner.entries.iter().position(|(k, _)| *k == kind);
            index.map(|i| inner.entries.remove(i))
        };
        match entry {
            Some((kind, handle)) => {
                drop(handle);
                tracing::debug!(resource = %kind, "released");
                true
            }
            None => false,
        }
    }

    /// Move every entry of `staged` into this list, keeping their order.
    pub fn absorb(&self, staged: ReleaseList) {
        let entries = std::mem::take(&mut staged.inner.lock().entries);
        for (kind, handle) in entries {
            self.push(kind, handle);
        }
    }

    /// Close every handle and report what was closed.
    ///
    /// Close errors are ignored. Later calls release nothing.
    pub fn release_all(&self) -> Vec<ResourceKind> {
        let entries = {
            let mut inner = self.inner.lock();
            inner.released = true;
            std::mem::take(&mut inner.entries)
        };
        let mut released = Vec::with_capacity(entries.len());
        for (kind, handle) in entries {
            drop(handle);
            tracing::debug!(resource = %kind, "released");
            released.push(kind);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.inner.lock().entries.iter().map(|(k, _)| *k).collect()
    }
}

impl fmt::Debug for ReleaseList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseList")
            .field("kinds", &self.kinds())
            .field("released", &self.is_released())
            .finish()
    }
}
