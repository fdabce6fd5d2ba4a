//! Named, fixed-shape shared buffers

use crate::element::{Element, ElementType};
use crate::error::{ShmError, ShmResult};
use crate::lock::{RegionLock, RegionLockGuard};
use crate::platform;
use crate::segment::{BufferHeader, HEADER_SIZE, MAX_DIMS, StateFlags, describe_layout};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use shmlog_common::consts::{DEFAULT_LOCK_TIMEOUT_MS, SHM_MAX_NAME_LEN};
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut, Range, RangeFrom, RangeFull, RangeInclusive, RangeTo};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

/// Everything needed to create or attach a buffer.
///
/// Passed explicitly at every call site; there is no ambient registry of
/// buffers.
///
/// ```toml
/// name = "frame_counter"
/// shape = [4, 2]
/// element_type = "u32"
/// lock_timeout_ms = 250
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSpec {
    /// Host-wide unique name of the region.
    pub name: String,
    /// Row-major shape.
    pub shape: Vec<usize>,
    /// Element type.
    pub element_type: ElementType,
    /// Bound on lock acquisition.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl BufferSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>, element_type: ElementType) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
            element_type,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }

    /// Spec whose element type is taken from `T`.
    pub fn of<T: Element>(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        Self::new(name, shape, T::TYPE)
    }

    /// Replace the lock acquisition bound.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Number of elements described by the shape.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the element data in bytes, header excluded.
    pub fn byte_size(&self) -> usize {
        self.element_count() * self.element_type.size()
    }

    /// Check name and shape constraints.
    pub fn validate(&self) -> ShmResult<()> {
        let invalid = |reason: String| Err(ShmError::InvalidSpec { reason });

        if self.name.is_empty() {
            return invalid("name cannot be empty".to_string());
        }
        if self.name.len() > SHM_MAX_NAME_LEN {
            return invalid(format!("name longer than {SHM_MAX_NAME_LEN} bytes"));
        }
        if self.name.contains(['/', '\0']) {
            return invalid(format!("name {:?} contains '/' or NUL", self.name));
        }
        if self.shape.is_empty() {
            return invalid("shape needs at least one dimension".to_string());
        }
        if self.shape.len() > MAX_DIMS {
            return invalid(format!("shape has more than {MAX_DIMS} dimensions"));
        }
        if self.shape.contains(&0) {
            return invalid(format!("shape {:?} has a zero-sized dimension", self.shape));
        }
        let bytes = self
            .shape
            .iter()
            .try_fold(self.element_type.size(), |acc, &d| acc.checked_mul(d));
        if bytes.is_none_or(|b| b.checked_add(HEADER_SIZE).is_none()) {
            return invalid(format!("shape {:?} is too large", self.shape));
        }
        Ok(())
    }

    /// Row-major flat index of `coords`.
    pub fn flat_index(&self, coords: &[usize]) -> ShmResult<usize> {
        if coords.len() != self.shape.len() {
            return Err(ShmError::InvalidSpec {
                reason: format!(
                    "expected {} coordinates, got {}",
                    self.shape.len(),
                    coords.len()
                ),
            });
        }
        let mut flat = 0;
        for (&c, &dim) in coords.iter().zip(&self.shape) {
            if c >= dim {
                return Err(ShmError::OutOfBounds { index: c, len: dim });
            }
            flat = flat * dim + c;
        }
        Ok(flat)
    }

    fn validate_for<T: Element>(&self) -> ShmResult<()> {
        self.validate()?;
        if self.element_type != T::TYPE {
            return Err(ShmError::InvalidSpec {
                reason: format!(
                    "spec declares {} but the handle is typed {}",
                    self.element_type,
                    T::TYPE
                ),
            });
        }
        Ok(())
    }
}

/// Element or contiguous range address within a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    /// One element.
    Index(usize),
    /// `start..end`, open-ended when `end` is `None`.
    Range { start: usize, end: Option<usize> },
}

impl Span {
    /// Resolve against a buffer of `len` elements.
    pub fn resolve(self, len: usize) -> ShmResult<Range<usize>> {
        let (start, end) = match self {
            Span::Index(i) if i >= len => return Err(ShmError::OutOfBounds { index: i, len }),
            Span::Index(i) => (i, i + 1),
            Span::Range { start, end } => (start, end.unwrap_or(len)),
        };
        if end > len {
            return Err(ShmError::OutOfBounds { index: end, len });
        }
        if start > end {
            return Err(ShmError::OutOfBounds { index: start, len });
        }
        Ok(start..end)
    }
}

impl From<usize> for Span {
    fn from(i: usize) -> Self {
        Span::Index(i)
    }
}

impl From<Range<usize>> for Span {
    fn from(r: Range<usize>) -> Self {
        Span::Range {
            start: r.start,
            end: Some(r.end),
        }
    }
}

impl From<RangeInclusive<usize>> for Span {
    fn from(r: RangeInclusive<usize>) -> Self {
        Span::Range {
            start: *r.start(),
            end: Some(r.end().saturating_add(1)),
        }
    }
}

impl From<RangeFrom<usize>> for Span {
    fn from(r: RangeFrom<usize>) -> Self {
        Span::Range {
            start: r.start,
            end: None,
        }
    }
}

impl From<RangeTo<usize>> for Span {
    fn from(r: RangeTo<usize>) -> Self {
        Span::Range {
            start: 0,
            end: Some(r.end),
        }
    }
}

impl From<RangeFull> for Span {
    fn from(_: RangeFull) -> Self {
        Span::Range {
            start: 0,
            end: None,
        }
    }
}

/// One attachment: the open backing file and its mapping.
struct Mapping {
    file: File,
    mmap: MmapMut,
}

impl Mapping {
    fn header(&self) -> &BufferHeader {
        unsafe { &*(self.mmap.as_ptr() as *const BufferHeader) }
    }

    fn data_ptr<T: Element>(&self) -> *mut T {
        // The mapping is page aligned and the header is a multiple of 64
        // bytes, so the data is aligned for every element type.
        unsafe { self.mmap.as_ptr().add(HEADER_SIZE) as *mut T }
    }
}

/// Handle to a named, fixed-shape shared buffer.
///
/// Every handle owns its own attachment. Dropping a handle detaches it but
/// never removes the region; only [`SharedBuffer::destroy`] does.
///
/// Access with `with_lock == false` is not synchronised with other writers.
/// The caller must serialise such access itself.
pub struct SharedBuffer<T: Element> {
    spec: BufferSpec,
    path: PathBuf,
    mapping: Option<Mapping>,
    lock: RegionLock,
    creator: bool,
    destroyed: bool,
    _marker: PhantomData<T>,
}

impl<T: Element> SharedBuffer<T> {
    /// Create a new zero-filled region and attach to it.
    ///
    /// With `replace == false` an existing region under the same name fails
    /// with `Allocation`. With `replace == true` the stale region is marked
    /// destroyed and unlinked first.
    pub fn create(spec: &BufferSpec, replace: bool) -> ShmResult<Self> {
        spec.validate_for::<T>()?;
        let path = platform::segment_path(&spec.name);

        if replace && unlink_region(&path)? {
            warn!(buffer = %spec.name, "replaced existing shared buffer");
        }

        let total = HEADER_SIZE + spec.byte_size();
        let (file, mut mmap) =
            platform::create_segment_mmap(&path, total).map_err(|e| ShmError::Allocation {
                name: spec.name.clone(),
                reason: if e.kind() == io::ErrorKind::AlreadyExists {
                    "region already exists".to_string()
                } else {
                    e.to_string()
                },
            })?;

        let header = BufferHeader::new(T::TYPE, &spec.shape, platform::get_current_pid());
        unsafe {
            std::ptr::write(mmap.as_mut_ptr() as *mut BufferHeader, header);
        }

        let mapping = Mapping { file, mmap };
        mapping.header().attach();
        mapping.header().set_flag(StateFlags::INITIALIZED);

        info!(
            buffer = %spec.name,
            layout = %describe_layout(T::TYPE, &spec.shape),
            bytes = total,
            "created shared buffer"
        );

        Ok(Self::from_mapping(spec, path, mapping, true))
    }

    /// Create a region initialised with a copy of `prototype`.
    pub fn create_from(spec: &BufferSpec, prototype: &[T], replace: bool) -> ShmResult<Self> {
        spec.validate_for::<T>()?;
        if prototype.len() != spec.element_count() {
            return Err(ShmError::LengthMismatch {
                expected: spec.element_count(),
                actual: prototype.len(),
            });
        }
        let buffer = Self::create(spec, replace)?;
        buffer.write(.., prototype, false)?;
        Ok(buffer)
    }

    /// Attach to an existing region whose layout must match `spec`.
    pub fn connect(spec: &BufferSpec) -> ShmResult<Self> {
        spec.validate_for::<T>()?;
        let path = platform::segment_path(&spec.name);
        let not_found = || ShmError::NotFound {
            name: spec.name.clone(),
        };

        let (file, mmap) = match platform::attach_segment_mmap(&path, HEADER_SIZE) {
            Ok(Some(pair)) => pair,
            Ok(None) => return Err(not_found()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let mapping = Mapping { file, mmap };
        let header = mapping.header();
        let flags = header.flags();

        if flags.contains(StateFlags::DESTROYED) {
            return Err(ShmError::UseAfterDestroy {
                name: spec.name.clone(),
            });
        }
        if !flags.contains(StateFlags::INITIALIZED) {
            return Err(not_found());
        }

        let expected = describe_layout(T::TYPE, &spec.shape);
        let mismatch = |found: String| ShmError::LayoutMismatch {
            name: spec.name.clone(),
            expected: expected.clone(),
            found,
        };
        if !header.is_valid() {
            return Err(mismatch("unrecognised header".to_string()));
        }
        if header.element_type() != Some(T::TYPE) || header.shape() != spec.shape {
            return Err(mismatch(header.describe()));
        }
        if mapping.mmap.len() < HEADER_SIZE + spec.byte_size() {
            return Err(mismatch(format!("truncated region of {} bytes", mapping.mmap.len())));
        }

        let previous = header.attach();
        debug!(buffer = %spec.name, attached = previous + 1, "connected to shared buffer");

        Ok(Self::from_mapping(spec, path, mapping, false))
    }

    fn from_mapping(spec: &BufferSpec, path: PathBuf, mapping: Mapping, creator: bool) -> Self {
        Self {
            lock: RegionLock::new(spec.lock_timeout()),
            spec: spec.clone(),
            path,
            mapping: Some(mapping),
            creator,
            destroyed: false,
            _marker: PhantomData,
        }
    }

    /// True if a region named `name` is present on this host.
    pub fn exists(name: &str) -> bool {
        platform::segment_path(name).exists()
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.spec.shape
    }

    pub fn element_type(&self) -> ElementType {
        T::TYPE
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    /// Path of the backing object.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.spec.element_count()
    }

    /// Always false: zero-sized shapes are rejected at creation.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the element data in bytes.
    pub fn byte_size(&self) -> usize {
        self.spec.byte_size()
    }

    /// True if this handle created the region.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// True while this handle is attached and the region is not destroyed.
    pub fn is_attached(&self) -> bool {
        self.live().is_ok()
    }

    /// Row-major flat index of `coords`.
    pub fn flat_index(&self, coords: &[usize]) -> ShmResult<usize> {
        self.spec.flat_index(coords)
    }

    /// Number of handles attached across all processes.
    pub fn attach_count(&self) -> ShmResult<u32> {
        Ok(self
            .live()?
            .header()
            .attach_count
            .load(std::sync::atomic::Ordering::Acquire))
    }

    /// Process that created the region.
    pub fn creator_pid(&self) -> ShmResult<u32> {
        Ok(self.live()?.header().creator_pid)
    }

    /// Whether the creating process is still running.
    pub fn creator_alive(&self) -> ShmResult<bool> {
        Ok(platform::is_process_alive(self.creator_pid()?))
    }

    fn live(&self) -> ShmResult<&Mapping> {
        let Some(mapping) = &self.mapping else {
            let name = self.spec.name.clone();
            return Err(if self.destroyed {
                ShmError::UseAfterDestroy { name }
            } else {
                ShmError::Detached { name }
            });
        };
        if mapping.header().flags().contains(StateFlags::DESTROYED) {
            return Err(ShmError::UseAfterDestroy {
                name: self.spec.name.clone(),
            });
        }
        Ok(mapping)
    }

    fn maybe_lock<'a>(
        &'a self,
        mapping: &'a Mapping,
        with_lock: bool,
    ) -> ShmResult<Option<RegionLockGuard<'a>>> {
        if !with_lock {
            return Ok(None);
        }
        let guard = self.lock.acquire(&mapping.file, &self.spec.name)?;
        // Destruction may have happened while we waited.
        if mapping.header().flags().contains(StateFlags::DESTROYED) {
            return Err(ShmError::UseAfterDestroy {
                name: self.spec.name.clone(),
            });
        }
        Ok(Some(guard))
    }

    /// Read one element.
    pub fn get(&self, index: usize, with_lock: bool) -> ShmResult<T> {
        let mapping = self.live()?;
        if index >= self.len() {
            return Err(ShmError::OutOfBounds {
                index,
                len: self.len(),
            });
        }
        let _guard = self.maybe_lock(mapping, with_lock)?;
        Ok(unsafe { mapping.data_ptr::<T>().add(index).read() })
    }

    /// Write one element.
    pub fn set(&self, index: usize, value: T, with_lock: bool) -> ShmResult<()> {
        let mapping = self.live()?;
        if index >= self.len() {
            return Err(ShmError::OutOfBounds {
                index,
                len: self.len(),
            });
        }
        let _guard = self.maybe_lock(mapping, with_lock)?;
        unsafe { mapping.data_ptr::<T>().add(index).write(value) };
        Ok(())
    }

    /// Copy out an element or contiguous range.
    pub fn read(&self, span: impl Into<Span>, with_lock: bool) -> ShmResult<Vec<T>> {
        let mapping = self.live()?;
        let range = span.into().resolve(self.len())?;
        let _guard = self.maybe_lock(mapping, with_lock)?;
        let values = unsafe {
            std::slice::from_raw_parts(mapping.data_ptr::<T>().add(range.start), range.len())
        };
        Ok(values.to_vec())
    }

    /// Overwrite an element or contiguous range with `values`.
    pub fn write(&self, span: impl Into<Span>, values: &[T], with_lock: bool) -> ShmResult<()> {
        let mapping = self.live()?;
        let range = span.into().resolve(self.len())?;
        if values.len() != range.len() {
            return Err(ShmError::LengthMismatch {
                expected: range.len(),
                actual: values.len(),
            });
        }
        let _guard = self.maybe_lock(mapping, with_lock)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                values.as_ptr(),
                mapping.data_ptr::<T>().add(range.start),
                values.len(),
            );
        }
        Ok(())
    }

    /// Lock the region and borrow the whole buffer mutably.
    ///
    /// The lock is released when the guard drops, including on unwind.
    pub fn lock(&self) -> ShmResult<BufferGuard<'_, T>> {
        let mapping = self.live()?;
        let guard = self.maybe_lock(mapping, true)?;
        let data =
            unsafe { std::slice::from_raw_parts_mut(mapping.data_ptr::<T>(), self.len()) };
        Ok(BufferGuard {
            data,
            _lock: guard,
        })
    }

    /// Run `f` with exclusive access to the whole buffer.
    pub fn with_exclusive<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> ShmResult<R> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    /// Detach this handle. The region stays alive. Safe to call twice.
    pub fn disconnect(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            let previous = mapping.header().detach();
            debug!(
                buffer = %self.spec.name,
                remaining = previous.saturating_sub(1),
                "disconnected from shared buffer"
            );
        }
    }

    /// Mark the region destroyed, unlink it and detach.
    ///
    /// Other handles observe `UseAfterDestroy` on their next access. Calling
    /// `destroy` again on the same handle is a no-op. A region already
    /// destroyed through another handle is only detached from.
    pub fn destroy(&mut self) -> ShmResult<()> {
        if self.destroyed {
            return Ok(());
        }
        match self.mapping.take() {
            Some(mapping) => {
                let header = mapping.header();
                let already = header.flags().contains(StateFlags::DESTROYED);
                header.set_flag(StateFlags::DESTROYED);
                let remaining = header.detach().saturating_sub(1);
                drop(mapping);
                if !already {
                    platform::remove_segment_file(&self.path)?;
                }
                if remaining > 0 {
                    warn!(
                        buffer = %self.spec.name,
                        remaining,
                        "destroyed shared buffer while handles were still attached"
                    );
                }
            }
            None => {
                unlink_region(&self.path)?;
            }
        }
        self.destroyed = true;
        info!(buffer = %self.spec.name, "destroyed shared buffer");
        Ok(())
    }
}

impl<T: Element> Drop for SharedBuffer<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<T: Element> std::fmt::Debug for SharedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("name", &self.spec.name)
            .field("shape", &self.spec.shape)
            .field("element_type", &T::TYPE)
            .field("attached", &self.mapping.is_some())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Mark an existing region destroyed (when its header is readable) and
/// unlink it. Returns `false` if nothing was there.
fn unlink_region(path: &Path) -> ShmResult<bool> {
    match platform::attach_segment_mmap(path, HEADER_SIZE) {
        Ok(Some((_file, mmap))) => {
            let header = unsafe { &*(mmap.as_ptr() as *const BufferHeader) };
            if header.is_valid() {
                header.set_flag(StateFlags::DESTROYED);
            }
        }
        Ok(None) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    Ok(platform::remove_segment_file(path)?)
}

/// Remove the region named `name`, if any, without attaching a typed handle.
///
/// Used to clean up after a crashed owner. Attached handles observe
/// `UseAfterDestroy`.
pub fn remove_region(name: &str) -> ShmResult<bool> {
    unlink_region(&platform::segment_path(name))
}

/// Exclusive view of a whole buffer, holding the region lock.
pub struct BufferGuard<'a, T: Element> {
    data: &'a mut [T],
    _lock: Option<RegionLockGuard<'a>>,
}

impl<T: Element> Deref for BufferGuard<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<T: Element> DerefMut for BufferGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(BufferSpec::of::<u8>("ok", vec![1]).validate().is_ok());

        for bad in [
            BufferSpec::of::<u8>("", vec![1]),
            BufferSpec::of::<u8>("a/b", vec![1]),
            BufferSpec::of::<u8>("x".repeat(SHM_MAX_NAME_LEN + 1), vec![1]),
            BufferSpec::of::<u8>("empty_shape", Vec::new()),
            BufferSpec::of::<u8>("zero_dim", vec![3, 0]),
            BufferSpec::of::<u8>("too_many_dims", vec![1; MAX_DIMS + 1]),
            BufferSpec::of::<u64>("overflow", vec![usize::MAX, 2]),
        ] {
            assert!(
                matches!(bad.validate(), Err(ShmError::InvalidSpec { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_spec_sizes() {
        let spec = BufferSpec::of::<f32>("sizes", vec![2, 3, 4]);
        assert_eq!(spec.element_count(), 24);
        assert_eq!(spec.byte_size(), 96);
    }

    #[test]
    fn test_spec_deserialize_default_timeout() {
        let spec: BufferSpec =
            toml::from_str("name = \"a\"\nshape = [2]\nelement_type = \"i64\"").unwrap();
        assert_eq!(spec.element_type, ElementType::I64);
        assert_eq!(spec.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
    }

    #[test]
    fn test_flat_index_row_major() {
        let spec = BufferSpec::of::<u8>("idx", vec![2, 3, 4]);
        assert_eq!(spec.flat_index(&[0, 0, 0]).unwrap(), 0);
        assert_eq!(spec.flat_index(&[0, 0, 3]).unwrap(), 3);
        assert_eq!(spec.flat_index(&[0, 1, 0]).unwrap(), 4);
        assert_eq!(spec.flat_index(&[1, 2, 3]).unwrap(), 23);
        assert!(matches!(
            spec.flat_index(&[2, 0, 0]),
            Err(ShmError::OutOfBounds { index: 2, len: 2 })
        ));
        assert!(matches!(
            spec.flat_index(&[1, 1]),
            Err(ShmError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn test_span_resolution() {
        assert_eq!(Span::from(3).resolve(10).unwrap(), 3..4);
        assert_eq!(Span::from(2..5).resolve(10).unwrap(), 2..5);
        assert_eq!(Span::from(2..=5).resolve(10).unwrap(), 2..6);
        assert_eq!(Span::from(7..).resolve(10).unwrap(), 7..10);
        assert_eq!(Span::from(..4).resolve(10).unwrap(), 0..4);
        assert_eq!(Span::from(..).resolve(10).unwrap(), 0..10);
        assert_eq!(Span::from(10..).resolve(10).unwrap(), 10..10);

        assert!(matches!(
            Span::from(10).resolve(10),
            Err(ShmError::OutOfBounds { index: 10, len: 10 })
        ));
        assert!(Span::from(5..11).resolve(10).is_err());
        assert!(Span::Range { start: 6, end: Some(4) }.resolve(10).is_err());
    }
}
