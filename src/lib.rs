//! # The lodefs write-ahead journal
//!
//! Every btree update in lodefs lands in the journal before it lands
//! anywhere else.  This crate is the running write path of that journal:
//! concurrent space reservation inside the open entry, sealing and rotation
//! of entries, batched writes onto rotating per-device journal buckets, and
//! durability signalling to waiters.  Journal read/replay at mount time lives
//! elsewhere; this crate only promises that what it acknowledged is on disk
//! in the layout replay expects.
//!
//! ## Design constraints
//!
//! The invariants that keep the design tractable:
//! - reservation state lives in one 64-bit word; the fast path is a single
//!   compare-and-swap and never blocks or allocates
//! - exactly two in-memory buffers rotate; memory use is bounded by twice the
//!   maximum entry size
//! - entries carry strictly increasing sequence numbers, are dispatched in
//!   order, and at most one write is in flight at a time
//! - an entry fits contiguously in one journal bucket, on every device it is
//!   written to
//! - an entry stays pinned until its contents have been folded into the main
//!   tree; the oldest pinned sequence bounds all space reclamation
//! - a fatal I/O error halts the journal permanently; halt is one-way
//!
//! ## Data flow
//!
//! A writer calls [`Journal::res_get`], which carves `[offset, offset+u64s)`
//! out of the open entry body with a CAS and hands back a [`Reservation`].
//! The writer packs its key chunks in with [`Journal::entry_write`] and
//! releases with [`Journal::res_put`].  When the entry fills (or the write
//! delay elapses, or a flush demands it), `buf_switch` seals it: the
//! reservation word flips to the other buffer, the sequence number advances,
//! and once the last reservation on the sealed buffer is released the writer
//! driver picks it up.  The driver places the entry on every read-write
//! device's bucket ring, writes it out, publishes the new on-disk horizon,
//! releases pins, and wakes waiters.
//!
//! ## On-disk layout
//!
//! The bit-exact entry set format lives next to its validating decoder
//! ([`decode_jset`]).  Within a device the journal occupies a circular list
//! of buckets whose order is recorded in the superblock; each bucket holds
//! one or more whole entries, and a bucket is reused only once every entry in
//! it has aged past the reclamation horizon.
//!
//! ## What this crate is not
//!
//! Not a general-purpose log: entries are u64-granular key chunks, not blobs.
//! Not ACID beyond what a linear sequence of durable entries provides.  The
//! btree, the allocator, the superblock and the extent layer are external
//! collaborators reached through the [`Allocator`], [`SuperBlock`],
//! [`RootSource`] and [`BlockDev`] traits.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

mod buf;
mod common;
mod device;
mod entry;
mod io;
mod journal;
mod pin;
mod state;
mod writer;

#[cfg(test)]
mod tests;

pub use self::{
    common::{BuildError, JournalConfig, JournalConfigBuilder},
    device::{
        AllocError, Allocator, DeviceError, OpenBucket, Reserve, SbError, SuperBlock,
    },
    entry::{
        decode_jset, jset_u64s, BtreeId, BtreeRoot, Jset, JsetEntry, JsetEntryKind, JsetStatus,
        NoRoots, RootSource, BKEY_EXTENT_U64S_MAX, JSET_ENTRY_HEADER_U64S, JSET_HEADER_U64S,
    },
    io::{BlockDev, FileBlockDev},
    journal::{Journal, JournalError, Reservation},
    pin::{FlushFn, PinHandle},
};
