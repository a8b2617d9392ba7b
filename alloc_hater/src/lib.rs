//! A small library for ~~hating on~~ evaluating the correctness of size-based
//! allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

/// Limit on generated request sizes, expressed in bits.
const SIZE_LIMIT_BITS: u8 = 16;

/// A request size which implements `Arbitrary`.
///
/// Sizes are skewed towards small values: the bit width is chosen first, then
/// a value below it.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let bits = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1 << bits);

        Ok(ArbSize(size))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate at least this many bytes.
    Alloc(usize),
    /// Free an outstanding block, chosen by index modulo the number of blocks.
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
pub trait Subject {
    type AllocError;

    /// Allocates a block of at least `size` bytes.
    ///
    /// Returns `Ok(None)` if the subject serves zero-size requests with no
    /// block at all.
    fn allocate(&mut self, size: usize) -> Result<Option<NonNull<[u8]>>, Self::AllocError>;

    /// Deallocates the block pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::AllocError>;

    /// Checks the subject's internal bookkeeping while `outstanding` blocks are
    /// allocated.
    fn check(&self, outstanding: usize) -> bool {
        let _ = outstanding;
        true
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region, as long as the requested size.
    ptr: NonNull<[u8]>,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until it is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, id: u64) -> Block {
        let mut b = Block { ptr, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the start of the block.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        paint(self.as_uninit_slice_mut(), id);
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

/// Why an evaluation failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// A block's contents changed while it was allocated.
    Overwritten,
    /// The subject rejected the deallocation of a block it handed out.
    DeallocRejected,
    /// The subject's bookkeeping check failed.
    Inconsistent,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
    pub failure: Failure,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    /// Returns the subject, consuming the evaluator.
    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;

            let failure = match op {
                AllocatorOp::Alloc(size) => match self.subject.allocate(size) {
                    Ok(Some(ptr)) => {
                        // Only the requested length is painted; the rest of the
                        // block is the allocator's business.
                        let ptr = NonNull::slice_from_raw_parts(ptr.cast(), size);
                        blocks.push(unsafe { Block::init(ptr, op_id) });
                        None
                    }
                    Ok(None) | Err(_) => None,
                },

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    None => None,
                    Some(block) if !block.verify() => Some(Failure::Overwritten),
                    Some(mut block) => {
                        block.paint(op_id);

                        match unsafe { self.subject.deallocate(block.as_ptr()) } {
                            Ok(()) => None,
                            Err(_) => Some(Failure::DeallocRejected),
                        }
                    }
                },
            };

            let failure =
                failure.or_else(|| (!self.subject.check(blocks.len())).then_some(Failure::Inconsistent));

            if let Some(failure) = failure {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                    failure,
                });
            }

            completed.push(op);
        }

        for block in blocks {
            let failure = if !block.verify() {
                Some(Failure::Overwritten)
            } else {
                match unsafe { self.subject.deallocate(block.as_ptr()) } {
                    Ok(()) => None,
                    Err(_) => Some(Failure::DeallocRejected),
                }
            };

            if let Some(failure) = failure {
                return Err(Failed {
                    completed,
                    failed_op: None,
                    failure,
                });
            }
        }

        if !self.subject.check(0) {
            return Err(Failed {
                completed,
                failed_op: None,
                failure: Failure::Inconsistent,
            });
        }

        Ok(())
    }
}
