//! Shape invariants under randomized geometry.
//!
//! These treat the shape layer as authoritative for coverage: leaf ranges
//! must tile the content exactly, every offset must map into the leaf that
//! contains it, and the heap algebra must be self-inverse.

use proptest::prelude::*;
use verifetch_core::Shape;

prop_compose! {
    // Wide geometry for properties that don't iterate over every leaf.
    fn arb_geometry()(
        chunk_log2 in 0u32..=21,
        content_length in 1u64..=(1 << 24),
    ) -> (u64, u64) {
        (content_length, 1u64 << chunk_log2)
    }
}

prop_compose! {
    // Small geometry (≤ 4096 leaves) for per-leaf / per-node loops.
    fn arb_small_geometry()(
        chunk_log2 in 0u32..=8,
        content_length in 1u64..=4096,
    ) -> (u64, u64) {
        (content_length, 1u64 << chunk_log2)
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    // leaf_count = ceil(len / chunk) and the leaf ranges tile the content.
    #[test]
    fn leaf_ranges_tile_content((len, chunk) in arb_small_geometry()) {
        let s = Shape::new(len, chunk).unwrap();
        prop_assert_eq!(s.leaf_count(), len.div_ceil(chunk));
        prop_assert!(s.leaf_count() >= 1);

        let mut covered = 0u64;
        let mut expected_start = 0u64;
        for leaf in 0..s.leaf_count() {
            let r = s.range_for_leaf(leaf).unwrap();
            prop_assert_eq!(r.start, expected_start, "ranges must be contiguous");
            prop_assert!(r.end > r.start, "ranges must be non-empty");
            covered += r.end - r.start;
            expected_start = r.end;
        }
        prop_assert_eq!(covered, len);
    }

    // leaf_for_offset agrees with range_for_leaf.
    #[test]
    fn offset_maps_into_containing_leaf(
        (len, chunk) in arb_geometry(),
        frac in 0.0f64..1.0,
    ) {
        let s = Shape::new(len, chunk).unwrap();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let offset = (((len - 1) as f64) * frac) as u64;

        let leaf = s.leaf_for_offset(offset).unwrap();
        let r = s.range_for_leaf(leaf).unwrap();
        prop_assert!(r.contains(&offset));
    }

    // leaves_for_range covers exactly the touched leaves.
    #[test]
    fn range_query_covers_touched_leaves(
        (len, chunk) in arb_geometry(),
        offset in 0u64..=(1 << 24),
        n in 1u64..=(1 << 16),
    ) {
        let s = Shape::new(len, chunk).unwrap();
        let leaves = s.leaves_for_range(offset, n);

        if offset >= len {
            prop_assert!(leaves.is_empty());
        } else {
            let end = (offset + n).min(len);
            prop_assert_eq!(leaves.start, s.leaf_for_offset(offset).unwrap());
            prop_assert_eq!(leaves.end, s.leaf_for_offset(end - 1).unwrap() + 1);
        }
    }

    // cap_leaf is the least power of two ≥ leaf_count; node counts follow.
    #[test]
    fn cap_and_node_counts((len, chunk) in arb_geometry()) {
        let s = Shape::new(len, chunk).unwrap();
        prop_assert!(s.cap_leaf().is_power_of_two());
        prop_assert!(s.cap_leaf() >= s.leaf_count());
        prop_assert!(s.cap_leaf() / 2 < s.leaf_count());
        prop_assert_eq!(s.node_count(), 2 * s.cap_leaf() - 1);
        prop_assert_eq!(s.offset_to_first_leaf(), s.cap_leaf() - 1);
    }

    // Heap parent/children/sibling are mutually consistent.
    #[test]
    fn heap_algebra_roundtrip((len, chunk) in arb_small_geometry()) {
        let s = Shape::new(len, chunk).unwrap();
        for node in 0..s.node_count() {
            if let Some((l, r)) = s.children(node) {
                prop_assert_eq!(Shape::parent(l), Some(node));
                prop_assert_eq!(Shape::parent(r), Some(node));
                prop_assert_eq!(Shape::sibling(l), Some(r));
                prop_assert_eq!(Shape::sibling(r), Some(l));
            }
        }
    }
}
