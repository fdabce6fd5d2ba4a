//! Shared buffer header layout

use crate::element::ElementType;
use bitflags::bitflags;
use shmlog_common::consts::CACHE_LINE_SIZE;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};

/// Magic bytes identifying a shmlog buffer: `"SHMLOGB\0"`.
pub const BUFFER_MAGIC: [u8; 8] = *b"SHMLOGB\0";

/// Header layout revision. Bumped whenever the field layout changes.
pub const LAYOUT_REVISION: u32 = 1;

/// Maximum number of dimensions a buffer shape may have.
pub const MAX_DIMS: usize = 8;

/// Byte offset of the element data within the mapping.
pub const HEADER_SIZE: usize = size_of::<BufferHeader>();

bitflags! {
    /// Lifecycle state bits stored in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFlags: u32 {
        /// Header fully written by the creator.
        const INITIALIZED = 0x0001;
        /// Region explicitly destroyed; every access must fail.
        const DESTROYED   = 0x0002;
    }
}

/// Buffer header, 128 bytes, cache-line aligned.
///
/// Immutable fields are written once by the creator before `INITIALIZED`
/// is published with release ordering. `state` and `attach_count` are the
/// only fields touched after creation.
#[repr(C, align(64))]
pub struct BufferHeader {
    /// Must equal [`BUFFER_MAGIC`].
    pub magic: [u8; 8],
    /// Must equal [`LAYOUT_REVISION`].
    pub revision: u32,
    /// [`ElementType`] code.
    pub element_type: u32,
    /// Number of used entries in `dims`.
    pub ndim: u32,
    /// [`StateFlags`] bits.
    pub state: AtomicU32,
    /// Number of handles currently attached, across all processes.
    pub attach_count: AtomicU32,
    /// Process that created the region.
    pub creator_pid: u32,
    /// Product of all dimensions.
    pub element_count: u64,
    /// Shape, row-major.
    pub dims: [u64; MAX_DIMS],
    _reserved: [u8; 24],
}

const_assert_eq!(size_of::<BufferHeader>(), 128);
const_assert_eq!(align_of::<BufferHeader>(), CACHE_LINE_SIZE);

impl BufferHeader {
    /// Build a header for a new region. `shape` must already be validated.
    pub fn new(element_type: ElementType, shape: &[usize], creator_pid: u32) -> Self {
        let mut dims = [0u64; MAX_DIMS];
        for (slot, &dim) in dims.iter_mut().zip(shape) {
            *slot = dim as u64;
        }
        Self {
            magic: BUFFER_MAGIC,
            revision: LAYOUT_REVISION,
            element_type: element_type.code(),
            ndim: shape.len() as u32,
            state: AtomicU32::new(0),
            attach_count: AtomicU32::new(0),
            creator_pid,
            element_count: shape.iter().product::<usize>() as u64,
            dims,
            _reserved: [0; 24],
        }
    }

    /// True when magic and revision identify a buffer this crate can read.
    pub fn is_valid(&self) -> bool {
        self.magic == BUFFER_MAGIC
            && self.revision == LAYOUT_REVISION
            && (self.ndim as usize) <= MAX_DIMS
    }

    /// Current state flags.
    #[inline]
    pub fn flags(&self) -> StateFlags {
        StateFlags::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Set `flag` in the state word.
    #[inline]
    pub fn set_flag(&self, flag: StateFlags) {
        self.state.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Shape recorded in the header.
    pub fn shape(&self) -> Vec<usize> {
        let ndim = (self.ndim as usize).min(MAX_DIMS);
        self.dims[..ndim].iter().map(|&d| d as usize).collect()
    }

    /// Element type recorded in the header, if the code is known.
    pub fn element_type(&self) -> Option<ElementType> {
        ElementType::from_code(self.element_type)
    }

    /// Human-readable layout, used in mismatch errors.
    pub fn describe(&self) -> String {
        let ty = self
            .element_type()
            .map_or_else(|| format!("type#{}", self.element_type), |t| t.to_string());
        format!("{ty}{:?}", self.shape())
    }

    /// Register one more attached handle. Returns the previous count.
    pub fn attach(&self) -> u32 {
        self.attach_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Unregister an attached handle. Never underflows.
    pub fn detach(&self) -> u32 {
        self.attach_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0)
    }
}

/// Format a layout the same way [`BufferHeader::describe`] does.
pub fn describe_layout(element_type: ElementType, shape: &[usize]) -> String {
    format!("{element_type}{shape:?}")
}
