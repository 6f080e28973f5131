use std::fs;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::stream::Transport;

/// Opaque server handle passed to handler callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ServerToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        ServerToken { index, generation }
    }

    /// Returns the slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Per-listener state tracked by the event loop.
pub(crate) struct ServerState {
    /// Listening descriptor. `None` means closed.
    pub fd: Option<RawFd>,
    pub kind: Transport,
    /// Bound filesystem path, unlinked again on close.
    pub unix_path: Option<PathBuf>,
    pub active: bool,
    pub generation: u32,
    /// Streams accepted from this listener and still open.
    pub connections: u32,
    /// Accept cap. 0 = unlimited.
    pub max_connections: u32,
}

impl ServerState {
    fn new() -> Self {
        ServerState {
            fd: None,
            kind: Transport::Tcp,
            unix_path: None,
            active: false,
            generation: 0,
            connections: 0,
            max_connections: 0,
        }
    }
}

/// Manages server slots with a free list, mirroring the stream table.
pub(crate) struct ServerTable {
    slots: Vec<ServerState>,
    free_list: Vec<u32>,
}

impl ServerTable {
    pub fn new(max_servers: u32) -> Self {
        let mut slots = Vec::with_capacity(max_servers as usize);
        for _ in 0..max_servers {
            slots.push(ServerState::new());
        }
        let free_list: Vec<u32> = (0..max_servers).rev().collect();
        ServerTable { slots, free_list }
    }

    pub fn allocate(&mut self, kind: Transport) -> Option<u32> {
        let idx = self.free_list.pop()?;
        let slot = &mut self.slots[idx as usize];
        slot.kind = kind;
        slot.unix_path = None;
        slot.connections = 0;
        slot.max_connections = 0;
        slot.active = true;
        Some(idx)
    }

    pub fn release(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        if !slot.active {
            return;
        }
        debug_assert!(slot.fd.is_none(), "releasing a server with a live fd");
        slot.active = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(idx);
    }

    pub fn get(&self, token: ServerToken) -> Option<&ServerState> {
        let slot = self.slots.get(token.index as usize)?;
        if !slot.active || slot.generation != token.generation {
            return None;
        }
        Some(slot)
    }

    pub fn get_mut(&mut self, token: ServerToken) -> Option<&mut ServerState> {
        let slot = self.slots.get_mut(token.index as usize)?;
        if !slot.active || slot.generation != token.generation {
            return None;
        }
        Some(slot)
    }

    pub fn slot(&self, idx: u32) -> &ServerState {
        &self.slots[idx as usize]
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut ServerState {
        &mut self.slots[idx as usize]
    }

    pub fn token(&self, idx: u32) -> ServerToken {
        ServerToken::new(idx, self.slots[idx as usize].generation)
    }

    pub fn max_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn active_indices(&self) -> Vec<u32> {
        (0..self.max_slots())
            .filter(|&i| self.slots[i as usize].active)
            .collect()
    }
}

/// Clear a UNIX listen path before bind.
///
/// Absent: bind directly. A regular file (a stale marker): unlink first.
/// Anything else occupying the path is refused without touching it.
pub(crate) fn prepare_unix_path(path: &Path) -> Result<(), Error> {
    match fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
        Ok(meta) => {
            let ft = meta.file_type();
            if ft.is_file() || ft.is_socket() {
                fs::remove_file(path).map_err(Error::Io)
            } else {
                Err(Error::PathNotFile(path.to_path_buf()))
            }
        }
    }
}
