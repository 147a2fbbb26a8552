//! Allocation storage: intrusive singly linked lists of heap nodes.
//!
//! Every allocation is a [`Node`]: a one-word header (the `next` link) followed
//! by a payload aligned to `ALIGN`. Nodes move between three owners:
//!
//! - a thread-local [`Producer`], which appends without locking,
//! - the global [`ObjectFactoryStorage`], which producers splice into under a
//!   spinlock,
//! - a [`Consumer`], which the sweeper fills with nodes it unlinked from storage.
//!
//! A node is in exactly one list at a time. Moving it is a pointer splice, never
//! a copy, and every list keeps the invariant that `last` is `None` iff the
//! list is empty.

use std::alloc::{handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::alloc::{align_up, is_aligned, is_valid_alignment, AlignedAllocator, ByteAllocator};
use crate::spin::{SpinLock, SpinLockGuard};

// ============================================================================
// Node
// ============================================================================

/// Header of a heap allocation. The payload follows at [`Node::DATA_OFFSET`].
///
/// The payload size is not known to the type; it is fixed when the node is
/// created and is only meaningful to whoever constructed the payload.
#[repr(C)]
pub struct Node<const ALIGN: usize> {
    next: Option<NonNull<Node<ALIGN>>>,
}

impl<const ALIGN: usize> Node<ALIGN> {
    /// Offset of the payload from the start of the node.
    pub const DATA_OFFSET: usize = align_up(mem::size_of::<Self>(), ALIGN);

    /// Size and alignment of the allocation backing a node with a payload of
    /// `data_size` bytes.
    #[must_use]
    pub const fn size_and_alignment_for_data_size(data_size: usize) -> (usize, usize) {
        let data_size_aligned = align_up(data_size, ALIGN);
        let total_alignment = if mem::align_of::<Self>() > ALIGN {
            mem::align_of::<Self>()
        } else {
            ALIGN
        };
        let total_size = align_up(Self::DATA_OFFSET + data_size_aligned, total_alignment);
        (total_size, total_alignment)
    }

    fn create<A: ByteAllocator>(data_size: usize) -> Option<NodePtr<ALIGN>> {
        let (total_size, total_alignment) = Self::size_and_alignment_for_data_size(data_size);
        debug_assert!(
            Self::DATA_OFFSET + data_size <= total_size,
            "total size {total_size} is not enough to fit data {data_size} at offset {}",
            Self::DATA_OFFSET
        );
        let ptr = A::alloc(total_size, total_alignment)?;
        assert!(
            is_aligned(ptr.as_ptr(), total_alignment),
            "Allocator returned pointer {ptr:p} unaligned to {total_alignment}"
        );
        let node = ptr.cast::<Self>();
        // SAFETY: freshly allocated, sized and aligned for at least one `Node`.
        unsafe { node.as_ptr().write(Self { next: None }) };
        Some(NodePtr(node))
    }

    /// # Safety
    ///
    /// `node` must have been created by `create::<A>` and be linked nowhere.
    unsafe fn destroy<A: ByteAllocator>(node: NonNull<Self>) {
        // `Node` and its payloads are trivially destructible.
        // SAFETY: guaranteed by the caller.
        unsafe { A::free(node.cast::<u8>()) };
    }
}

/// Pointer to a live [`Node`].
///
/// A `NodePtr` does not own the node; the list holding it does. It is valid for
/// as long as that list keeps the node.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct NodePtr<const ALIGN: usize>(NonNull<Node<ALIGN>>);

impl<const ALIGN: usize> Clone for NodePtr<ALIGN> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<const ALIGN: usize> Copy for NodePtr<ALIGN> {}

impl<const ALIGN: usize> NodePtr<ALIGN> {
    /// Returns the payload address. Always aligned to `ALIGN`.
    #[inline]
    #[must_use]
    pub fn data(self) -> NonNull<u8> {
        // SAFETY: the payload lies inside the node's allocation.
        let ptr = unsafe { self.0.cast::<u8>().add(Node::<ALIGN>::DATA_OFFSET) };
        debug_assert!(
            is_aligned(ptr.as_ptr(), ALIGN),
            "Data={ptr:p} is not aligned to {ALIGN}"
        );
        ptr
    }

    /// Recovers the node owning the payload at `data`.
    ///
    /// # Safety
    ///
    /// `data` must be the payload address of a live node.
    #[inline]
    #[must_use]
    pub unsafe fn from_data(data: NonNull<u8>) -> Self {
        // SAFETY: caller guarantees `data` sits `DATA_OFFSET` past a node header.
        let node = Self(unsafe { data.sub(Node::<ALIGN>::DATA_OFFSET) }.cast::<Node<ALIGN>>());
        assert!(node.data() == data, "Node layout has broken");
        node
    }

    /// Raw pointer to the node header.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut Node<ALIGN> {
        self.0.as_ptr()
    }
}

// ============================================================================
// NodeList - the shared linkage of Producer, Storage and Consumer
// ============================================================================

struct NodeList<const ALIGN: usize> {
    root: Option<NonNull<Node<ALIGN>>>,
    last: Option<NonNull<Node<ALIGN>>>,
    size: usize,
}

// SAFETY: a list exclusively owns its nodes; nothing else aliases them.
unsafe impl<const ALIGN: usize> Send for NodeList<ALIGN> {}

impl<const ALIGN: usize> NodeList<ALIGN> {
    const fn new() -> Self {
        Self {
            root: None,
            last: None,
            size: 0,
        }
    }

    #[inline]
    fn assert_correct(&self) {
        match self.last {
            None => {
                assert!(self.root.is_none(), "last must not be null");
                debug_assert_eq!(self.size, 0);
            }
            Some(last) => {
                assert!(self.root.is_some(), "root must not be null");
                // SAFETY: `last` is owned by this list.
                assert!(unsafe { (*last.as_ptr()).next.is_none() }, "last must not have next");
            }
        }
    }

    const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// # Safety
    ///
    /// `node` must be unlinked and not owned by any other list.
    unsafe fn push_back(&mut self, node: NonNull<Node<ALIGN>>) {
        self.assert_correct();
        // SAFETY: `node` is unlinked; `last` belongs to this list.
        unsafe {
            debug_assert!((*node.as_ptr()).next.is_none());
            match self.last {
                None => self.root = Some(node),
                Some(last) => (*last.as_ptr()).next = Some(node),
            }
        }
        self.last = Some(node);
        self.size += 1;
        self.assert_correct();
    }

    /// Moves all of `other` onto the tail of `self` in O(1).
    fn splice_back(&mut self, other: &mut Self) {
        self.assert_correct();
        other.assert_correct();
        let Some(other_root) = other.root.take() else {
            return;
        };
        match self.last {
            None => self.root = Some(other_root),
            // SAFETY: `last` belongs to this list.
            Some(last) => unsafe { (*last.as_ptr()).next = Some(other_root) },
        }
        self.last = other.last.take();
        self.size += mem::replace(&mut other.size, 0);
        self.assert_correct();
        other.assert_correct();
    }

    /// Unlinks the node after `previous` (or the root if `previous` is `None`).
    /// Returns the unlinked node and the node that now follows `previous`.
    ///
    /// # Safety
    ///
    /// `previous`, if any, must belong to this list and have a successor.
    unsafe fn extract_after(
        &mut self,
        previous: Option<NonNull<Node<ALIGN>>>,
    ) -> (NonNull<Node<ALIGN>>, Option<NonNull<Node<ALIGN>>>) {
        assert!(self.root.is_some(), "Must not be empty");
        self.assert_correct();

        // SAFETY: all nodes touched below are owned by this list.
        let (node, next) = unsafe {
            match previous {
                None => {
                    let node = self.root.take().unwrap_unchecked();
                    self.root = (*node.as_ptr()).next.take();
                    if self.root.is_none() {
                        self.last = None;
                    }
                    (node, self.root)
                }
                Some(previous) => {
                    let node = (*previous.as_ptr())
                        .next
                        .take()
                        .expect("extracting past the end of the list");
                    let next = (*node.as_ptr()).next.take();
                    (*previous.as_ptr()).next = next;
                    if next.is_none() {
                        self.last = Some(previous);
                    }
                    (node, next)
                }
            }
        };
        self.size -= 1;
        self.assert_correct();
        (node, next)
    }

    fn iter(&self) -> Iter<'_, ALIGN> {
        Iter {
            next: self.root,
            _marker: PhantomData,
        }
    }

    /// Frees every node without recursion.
    ///
    /// # Safety
    ///
    /// All nodes must have been allocated by `A`.
    unsafe fn free_all<A: ByteAllocator>(&mut self) {
        let mut next = self.root.take();
        self.last = None;
        self.size = 0;
        while let Some(node) = next {
            // SAFETY: the list owned `node`; it is unlinked before being freed.
            unsafe {
                next = (*node.as_ptr()).next.take();
                Node::destroy::<A>(node);
            }
        }
    }
}

/// Forward iterator over the nodes of one list.
pub struct Iter<'a, const ALIGN: usize> {
    next: Option<NonNull<Node<ALIGN>>>,
    _marker: PhantomData<&'a Node<ALIGN>>,
}

impl<const ALIGN: usize> Iterator for Iter<'_, ALIGN> {
    type Item = NodePtr<ALIGN>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        // SAFETY: the borrowed list keeps `node` alive and linked.
        self.next = unsafe { (*node.as_ptr()).next };
        Some(NodePtr(node))
    }
}

#[cold]
#[inline(never)]
fn out_of_memory(data_size: usize, alignment: usize) -> ! {
    eprintln!("[GC] Out of memory trying to allocate {data_size} bytes. Aborting.");
    #[cfg(feature = "tracing")]
    crate::tracing::internal::log_oom(data_size);
    let layout =
        Layout::from_size_align(data_size.max(1), alignment).unwrap_or(Layout::new::<u8>());
    handle_alloc_error(layout)
}

// ============================================================================
// ObjectFactoryStorage - the global list
// ============================================================================

/// Global allocation list assembled from published [`Producer`]s.
pub struct ObjectFactoryStorage<const ALIGN: usize, A: ByteAllocator = AlignedAllocator> {
    list: SpinLock<NodeList<ALIGN>>,
    _allocator: PhantomData<A>,
}

impl<const ALIGN: usize, A: ByteAllocator> ObjectFactoryStorage<ALIGN, A> {
    /// Creates an empty storage.
    ///
    /// # Panics
    ///
    /// Fails to compile (or panics in const evaluation) if `ALIGN` is not a
    /// power of two.
    #[must_use]
    pub const fn new() -> Self {
        const {
            assert!(is_valid_alignment(ALIGN), "ALIGN is not a valid alignment");
        }
        Self {
            list: SpinLock::new(NodeList::new()),
            _allocator: PhantomData,
        }
    }

    /// Locks the storage for iteration. Publishing blocks until the returned
    /// view is dropped.
    pub fn lock_for_iter(&self) -> Iterable<'_, ALIGN, A> {
        Iterable {
            guard: self.list.lock(),
            _allocator: PhantomData,
        }
    }

    /// Number of published nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.lock().size
    }

    /// Returns `true` if nothing has been published (or everything was swept).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Frees every node without running finalizers.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_for_tests(&self) {
        let mut list = self.list.lock();
        // SAFETY: every node in storage was allocated by `A`.
        unsafe { list.free_all::<A>() };
    }
}

impl<const ALIGN: usize, A: ByteAllocator> Default for ObjectFactoryStorage<ALIGN, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const ALIGN: usize, A: ByteAllocator> Drop for ObjectFactoryStorage<ALIGN, A> {
    fn drop(&mut self) {
        // SAFETY: every node in storage was allocated by `A`.
        unsafe { self.list.get_mut().free_all::<A>() };
    }
}

// ============================================================================
// Producer - thread-local append-only queue
// ============================================================================

/// Unsynchronized queue of fresh nodes owned by one thread.
///
/// Nodes become visible to the collector only after [`Producer::publish`].
/// Dropping a producer publishes it.
pub struct Producer<const ALIGN: usize, A: ByteAllocator = AlignedAllocator> {
    owner: Arc<ObjectFactoryStorage<ALIGN, A>>,
    list: NodeList<ALIGN>,
}

impl<const ALIGN: usize, A: ByteAllocator> Producer<ALIGN, A> {
    /// Creates an empty producer publishing into `owner`.
    #[must_use]
    pub const fn new(owner: Arc<ObjectFactoryStorage<ALIGN, A>>) -> Self {
        Self {
            owner,
            list: NodeList::new(),
        }
    }

    /// Number of unpublished nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.list.size
    }

    /// Returns `true` if there is nothing to publish.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Appends a node with room for `data_size` payload bytes, or returns
    /// `None` if the allocator is exhausted. The list is untouched on failure.
    ///
    /// The payload content is unspecified.
    pub fn try_insert(&mut self, data_size: usize) -> Option<NodePtr<ALIGN>> {
        let node = Node::<ALIGN>::create::<A>(data_size)?;
        // SAFETY: the node was just created and is linked nowhere.
        unsafe { self.list.push_back(node.0) };
        Some(node)
    }

    /// Appends a node with room for `data_size` payload bytes.
    ///
    /// Allocation failure is fatal: the process aborts.
    pub fn insert(&mut self, data_size: usize) -> NodePtr<ALIGN> {
        match self.try_insert(data_size) {
            Some(node) => node,
            None => out_of_memory(data_size, ALIGN),
        }
    }

    /// Appends a node holding `value`.
    ///
    /// # Panics
    ///
    /// Panics if `T` needs a stricter alignment than `ALIGN`.
    pub fn insert_value<T: Copy>(&mut self, value: T) -> NodePtr<ALIGN> {
        assert!(
            mem::align_of::<T>() <= ALIGN,
            "Cannot insert type with alignment bigger than ALIGN"
        );
        let node = self.insert(mem::size_of::<T>());
        // SAFETY: the payload is sized and aligned for `T`.
        unsafe { node.data().cast::<T>().as_ptr().write(value) };
        node
    }

    /// Splices the local queue onto the tail of the owning storage.
    ///
    /// A no-op on an empty producer: the storage lock is not taken.
    pub fn publish(&mut self) {
        self.list.assert_correct();
        if self.list.is_empty() {
            return;
        }
        let mut global = self.owner.list.lock();
        global.splice_back(&mut self.list);
        debug_assert!(self.list.is_empty());
    }

    /// Iterates the unpublished nodes in insertion order.
    pub fn iter(&self) -> Iter<'_, ALIGN> {
        self.list.iter()
    }

    /// Frees the unpublished nodes.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_for_tests(&mut self) {
        // SAFETY: every node in this list was allocated by `A`.
        unsafe { self.list.free_all::<A>() };
    }
}

impl<const ALIGN: usize, A: ByteAllocator> Drop for Producer<ALIGN, A> {
    fn drop(&mut self) {
        self.publish();
    }
}

// ============================================================================
// Consumer - nodes unlinked from storage
// ============================================================================

/// Nodes extracted from storage, awaiting finalization. Dropping a consumer
/// frees its nodes.
pub struct Consumer<const ALIGN: usize, A: ByteAllocator = AlignedAllocator> {
    list: NodeList<ALIGN>,
    _allocator: PhantomData<A>,
}

impl<const ALIGN: usize, A: ByteAllocator> Consumer<ALIGN, A> {
    /// Creates an empty consumer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            list: NodeList::new(),
            _allocator: PhantomData,
        }
    }

    /// Number of nodes held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.list.size
    }

    /// Returns `true` if no nodes are held.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Iterates the held nodes in the order they were inserted.
    pub fn iter(&self) -> Iter<'_, ALIGN> {
        self.list.iter()
    }

    /// Appends all of `other` after the nodes of `self` in O(1).
    pub fn merge_with(&mut self, mut other: Self) {
        self.list.splice_back(&mut other.list);
    }

    fn insert(&mut self, node: NonNull<Node<ALIGN>>) {
        // SAFETY: `node` was just extracted from storage.
        unsafe { self.list.push_back(node) };
    }
}

impl<const ALIGN: usize, A: ByteAllocator> Default for Consumer<ALIGN, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const ALIGN: usize, A: ByteAllocator> Drop for Consumer<ALIGN, A> {
    fn drop(&mut self) {
        // SAFETY: nodes come from storage, which allocates through `A`.
        unsafe { self.list.free_all::<A>() };
    }
}

// ============================================================================
// Iterable - locked view of the storage
// ============================================================================

/// Lock-holding view of an [`ObjectFactoryStorage`]. Unlocks on drop.
pub struct Iterable<'a, const ALIGN: usize, A: ByteAllocator> {
    guard: SpinLockGuard<'a, NodeList<ALIGN>>,
    _allocator: PhantomData<A>,
}

impl<const ALIGN: usize, A: ByteAllocator> Iterable<'_, ALIGN, A> {
    /// Number of nodes in storage.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guard.size
    }

    /// Returns `true` if storage is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    /// Read-only iteration.
    pub fn iter(&self) -> Iter<'_, ALIGN> {
        self.guard.iter()
    }

    /// Cursor positioned at the first node, supporting in-place removal.
    pub fn cursor(&mut self) -> Cursor<'_, ALIGN, A> {
        let current = self.guard.root;
        Cursor {
            list: &mut self.guard,
            previous: None,
            current,
            _allocator: PhantomData,
        }
    }
}

/// Mutable position inside a locked storage.
pub struct Cursor<'b, const ALIGN: usize, A: ByteAllocator> {
    list: &'b mut NodeList<ALIGN>,
    // Kept so the current node can be unlinked in O(1).
    previous: Option<NonNull<Node<ALIGN>>>,
    current: Option<NonNull<Node<ALIGN>>>,
    _allocator: PhantomData<A>,
}

impl<const ALIGN: usize, A: ByteAllocator> Cursor<'_, ALIGN, A> {
    /// The node under the cursor, or `None` past the end.
    #[must_use]
    pub fn current(&self) -> Option<NodePtr<ALIGN>> {
        self.current.map(NodePtr)
    }

    /// Steps to the next node.
    pub fn advance(&mut self) {
        if let Some(current) = self.current {
            self.previous = Some(current);
            // SAFETY: `current` is owned by the locked list.
            self.current = unsafe { (*current.as_ptr()).next };
        }
    }

    /// Unlinks and frees the current node, then steps to its successor.
    ///
    /// # Panics
    ///
    /// Panics if the cursor is past the end.
    pub fn erase_and_advance(&mut self) {
        assert!(self.current.is_some(), "erase past the end of storage");
        // SAFETY: `previous` is owned by the list and has `current` as successor.
        let (node, next) = unsafe { self.list.extract_after(self.previous) };
        self.current = next;
        // SAFETY: the node was unlinked above and came from `A`.
        unsafe { Node::destroy::<A>(node) };
    }

    /// Unlinks the current node into `consumer`, then steps to its successor.
    ///
    /// # Panics
    ///
    /// Panics if the cursor is past the end.
    pub fn move_and_advance(&mut self, consumer: &mut Consumer<ALIGN, A>) {
        assert!(self.current.is_some(), "move past the end of storage");
        // SAFETY: `previous` is owned by the list and has `current` as successor.
        let (node, next) = unsafe { self.list.extract_after(self.previous) };
        self.current = next;
        consumer.insert(node);
    }
}
