//! Version objects, tuple headers, and the chain-index seam.
//!
//! A version is one contiguous allocation: the [`Object`] prelude
//! (`size` + `next` link + [`TupleHeader`]) followed by the record
//! payload. Chains run newest-to-oldest through `next`; the head of each
//! chain is owned by the index layer and reached through [`ChainIndex`].

use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};

use verso_types::{Lsn, Oid, Xid};

// ---------------------------------------------------------------------------
// Tagged clsn word
// ---------------------------------------------------------------------------

/// MSB of a `clsn` word: the low 63 bits are the installing transaction's
/// xid, not yet a commit stamp.
pub const INSTALLER_TAG: u64 = 1 << 63;

/// Encode a pre-commit installer word for `clsn`.
#[inline]
#[must_use]
pub const fn encode_installer(xid: Xid) -> u64 {
    INSTALLER_TAG | xid.get()
}

/// Whether a `clsn` word still names its installer.
#[inline]
#[must_use]
pub const fn is_installer(word: u64) -> bool {
    word & INSTALLER_TAG != 0
}

/// The installing xid of a tagged `clsn` word.
#[inline]
#[must_use]
pub const fn installer_xid(word: u64) -> Xid {
    Xid::new(word & !INSTALLER_TAG)
}

// ---------------------------------------------------------------------------
// Persistent-reader marker
// ---------------------------------------------------------------------------

/// Writer exclusion bit (MSB) of the persistent-reader marker.
pub const MARKER_LOCK: u8 = 0x80;

/// Untracked-old-read bit (LSB) of the persistent-reader marker.
pub const MARKER_MARK: u8 = 0x01;

// ---------------------------------------------------------------------------
// TupleHeader
// ---------------------------------------------------------------------------

/// Per-version record header.
///
/// `clsn` holds either the creator's commit stamp or its installer word
/// (see [`encode_installer`]); an installer word has the MSB set, so the
/// reclamation test `clsn < trim_lsn` can never judge an uncommitted
/// version reclaimable. `sstamp` starts at `u64::MAX` (no successor yet).
#[repr(C)]
#[derive(Debug)]
pub struct TupleHeader {
    /// Commit stamp of the creating transaction, or its installer word.
    pub clsn: AtomicU64,
    /// Highest commit stamp known to have read this version.
    pub xstamp: AtomicU64,
    /// Predecessor stamp recorded by readers and the creator.
    pub pstamp: AtomicU64,
    /// Commit stamp bound of the overwriting transaction.
    pub sstamp: AtomicU64,
    /// One bit per reader slot currently holding an untracked read.
    pub rl_bitmap: AtomicU64,
    /// Persistent-reader marker; valid values 0x00, 0x01, 0x80, 0x81.
    pub persistent_reader: AtomicU8,
    _pad: [u8; 3],
    data_len: u32,
}

impl TupleHeader {
    fn new_installed(installer: Xid, data_len: u32) -> Self {
        Self {
            clsn: AtomicU64::new(encode_installer(installer)),
            xstamp: AtomicU64::new(0),
            pstamp: AtomicU64::new(0),
            sstamp: AtomicU64::new(u64::MAX),
            rl_bitmap: AtomicU64::new(0),
            persistent_reader: AtomicU8::new(0),
            _pad: [0; 3],
            data_len,
        }
    }

    /// Payload length in bytes.
    #[inline]
    #[must_use]
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// Raw `clsn` word (SeqCst: pairs with installer/commit publication).
    #[inline]
    #[must_use]
    pub fn clsn_word(&self) -> u64 {
        self.clsn.load(Ordering::SeqCst)
    }

    /// The commit stamp, if this version has committed.
    #[must_use]
    pub fn commit_stamp(&self) -> Option<Lsn> {
        let word = self.clsn_word();
        if is_installer(word) {
            None
        } else {
            Some(Lsn::from_word(word))
        }
    }

    /// Publish the final commit stamp over the installer word.
    pub fn set_commit_stamp(&self, lsn: Lsn) {
        self.clsn.store(lsn.offset(), Ordering::SeqCst);
    }

    /// Current marker byte.
    #[inline]
    #[must_use]
    pub fn marker(&self) -> u8 {
        self.persistent_reader.load(Ordering::SeqCst)
    }

    /// Reader side: set `MARK`, requiring `LOCK` clear.
    ///
    /// Returns `false` when a committing writer has already locked the
    /// marker; the reader must abort its transaction.
    pub fn try_mark_persistent(&self) -> bool {
        let mut cur = self.persistent_reader.load(Ordering::SeqCst);
        loop {
            if cur & MARKER_LOCK != 0 {
                return false;
            }
            if cur & MARKER_MARK != 0 {
                return true;
            }
            match self.persistent_reader.compare_exchange(
                cur,
                cur | MARKER_MARK,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Writer side: set `LOCK`, fencing out new old-version readers.
    /// Returns the marker value observed before the lock.
    pub fn lock_marker(&self) -> u8 {
        self.persistent_reader.fetch_or(MARKER_LOCK, Ordering::SeqCst)
    }

    /// Raise `xstamp` to at least `to`.
    pub fn raise_xstamp(&self, to: u64) {
        self.xstamp.fetch_max(to, Ordering::SeqCst);
    }

    /// Raise `pstamp` to at least `to`.
    pub fn raise_pstamp(&self, to: u64) {
        self.pstamp.fetch_max(to, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

/// Allocation granularity; keeps every version 16-byte aligned in the
/// bump ring.
pub const OBJECT_ALIGN: u64 = 16;

/// One version: object prelude + tuple header + payload.
#[repr(C)]
pub struct Object {
    /// Total byte length of this allocation, headers included.
    size: u64,
    /// Link to the prior (older) version.
    next: AtomicPtr<Object>,
    tuple: TupleHeader,
}

impl Object {
    /// Bytes needed for a version carrying `data_len` payload bytes,
    /// rounded to [`OBJECT_ALIGN`].
    #[must_use]
    pub fn alloc_size(data_len: usize) -> u64 {
        let raw = std::mem::size_of::<Self>() as u64 + data_len as u64;
        (raw + OBJECT_ALIGN - 1) & !(OBJECT_ALIGN - 1)
    }

    /// Write a fresh version into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must point to at least [`Object::alloc_size`]`(data.len())`
    /// writable bytes, 8-byte aligned, owned by the caller until the
    /// returned pointer is published into a chain.
    pub unsafe fn initialize(
        dst: *mut u8,
        next: *mut Object,
        installer: Xid,
        data: &[u8],
    ) -> *mut Object {
        let obj = dst.cast::<Object>();
        obj.write(Object {
            size: Self::alloc_size(data.len()),
            next: AtomicPtr::new(next),
            tuple: TupleHeader::new_installed(installer, data.len() as u32),
        });
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            dst.add(std::mem::size_of::<Self>()),
            data.len(),
        );
        obj
    }

    /// Total allocation size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Link to the prior version.
    #[inline]
    pub fn next(&self) -> &AtomicPtr<Object> {
        &self.next
    }

    /// The record header.
    #[inline]
    pub fn tuple(&self) -> &TupleHeader {
        &self.tuple
    }

    /// The record payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: initialize() placed data_len bytes immediately after the
        // header, and the allocation is immutable once published.
        unsafe {
            std::slice::from_raw_parts(
                (self as *const Self).cast::<u8>().add(std::mem::size_of::<Self>()),
                self.tuple.data_len() as usize,
            )
        }
    }
}

// ---------------------------------------------------------------------------
// ChainIndex seam + OidTable
// ---------------------------------------------------------------------------

/// The slice of the index layer the core consumes: chain heads by oid.
///
/// The core never mutates index structure; it only reads heads and CASes
/// them during installation, abort unlinking, and reclamation.
pub trait ChainIndex: Send + Sync {
    /// Exclusive upper bound of allocated oids (oid 0 is never used).
    fn oid_count(&self) -> u64;

    /// Current chain head for `oid`, or null.
    fn head(&self, oid: Oid) -> *mut Object;

    /// CAS the chain head for `oid`.
    fn cas_head(&self, oid: Oid, old: *mut Object, new: *mut Object) -> bool;
}

/// Fixed-capacity oid → head vector.
///
/// Stands in for the external index's tuple vector; tests and the
/// reclaim daemon drive chains through it.
pub struct OidTable {
    heads: Vec<AtomicPtr<Object>>,
    next_oid: AtomicU64,
}

impl OidTable {
    /// A table able to hold `capacity` oids (1-based).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut heads = Vec::with_capacity(capacity + 1);
        heads.resize_with(capacity + 1, || AtomicPtr::new(std::ptr::null_mut()));
        Self {
            heads,
            next_oid: AtomicU64::new(1),
        }
    }

    /// Hand out the next unused oid, or `None` when the table is full.
    #[must_use]
    pub fn allocate_oid(&self) -> Option<Oid> {
        let oid = self.next_oid.fetch_add(1, Ordering::AcqRel);
        if (oid as usize) < self.heads.len() {
            Some(Oid::new(oid))
        } else {
            None
        }
    }
}

impl ChainIndex for OidTable {
    fn oid_count(&self) -> u64 {
        self.next_oid
            .load(Ordering::Acquire)
            .min(self.heads.len() as u64)
    }

    fn head(&self, oid: Oid) -> *mut Object {
        self.heads[oid.get() as usize].load(Ordering::SeqCst)
    }

    fn cas_head(&self, oid: Oid, old: *mut Object, new: *mut Object) -> bool {
        self.heads[oid.get() as usize]
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl std::fmt::Debug for OidTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidTable")
            .field("capacity", &(self.heads.len() - 1))
            .field("next_oid", &self.next_oid.load(Ordering::Relaxed))
            .finish()
    }
}
