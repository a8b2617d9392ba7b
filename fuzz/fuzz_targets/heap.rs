#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use bucket_heap::SMALL_PAGE_SIZE;
use bucket_heap_hater::HeapSubject;
use libfuzzer_sys::fuzz_target;

const MAX_PAGE_MULTIPLE: usize = 16;
const MAX_OBJECT_SHIFT: u32 = 16;

#[derive(Clone, Debug)]
struct Args {
    page_size: usize,
    min_object_size: usize,
    max_object_size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let page_size = SMALL_PAGE_SIZE * (1 + usize::arbitrary(un)? % MAX_PAGE_MULTIPLE);
        let max_object_size = 1 << (u32::arbitrary(un)? % MAX_OBJECT_SHIFT);
        let min_object_size = usize::arbitrary(un)? % (max_object_size + 1);
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            page_size,
            min_object_size,
            max_object_size,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args {
        page_size,
        min_object_size,
        max_object_size,
        ops,
    } = args;

    let heap = match HeapSubject::with_sizes(page_size, min_object_size, max_object_size) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(heap);
    eval.evaluate(ops).unwrap();
});
