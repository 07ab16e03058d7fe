mod common;

use maple_tree::{MapleTree, TreeFlags};
use proptest::prelude::*;

use crate::common::value;

/// Reference model: a sorted list of disjoint `(first, last, tag)` ranges.
#[derive(Default)]
struct Model {
    ranges: Vec<(usize, usize, usize)>,
}

impl Model {
    fn store(&mut self, first: usize, last: usize, tag: Option<usize>) {
        let mut next = Vec::with_capacity(self.ranges.len() + 2);
        for &(lo, hi, t) in &self.ranges {
            if hi < first || lo > last {
                next.push((lo, hi, t));
                continue;
            }
            // Clip the survivors of an overlapped range.
            if lo < first {
                next.push((lo, first - 1, t));
            }
            if hi > last {
                next.push((last + 1, hi, t));
            }
        }
        if let Some(tag) = tag {
            next.push((first, last, tag));
        }
        next.sort_unstable();
        self.ranges = next;
    }

    fn load(&self, key: usize) -> Option<usize> {
        self.ranges
            .iter()
            .find(|&&(lo, hi, _)| lo <= key && key <= hi)
            .map(|&(_, _, t)| t)
    }

    fn erase(&mut self, key: usize) -> Option<usize> {
        let hit = self
            .ranges
            .iter()
            .copied()
            .find(|&(lo, hi, _)| lo <= key && key <= hi);
        if let Some((lo, hi, t)) = hit {
            self.store(lo, hi, None);
            Some(t)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Store { first: usize, width: usize, tag: usize },
    EraseRange { first: usize, width: usize },
    Erase { key: usize },
}

fn ops(count: usize) -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        4 => (0usize..4000, 1usize..64, 1usize..512)
            .prop_map(|(first, width, tag)| Op::Store { first, width, tag }),
        1 => (0usize..4000, 1usize..256)
            .prop_map(|(first, width)| Op::EraseRange { first, width }),
        2 => (0usize..4100).prop_map(|key| Op::Erase { key }),
    ];
    proptest::collection::vec(op, 1..count)
}

fn run(ops: Vec<Op>, flags: TreeFlags) {
    let tree: MapleTree<u8> = MapleTree::new_with(flags);
    let mut model = Model::default();

    for op in ops {
        match op {
            Op::Store { first, width, tag } => {
                let last = first + width - 1;
                tree.store_range(first, last, value!(tag)).unwrap();
                model.store(first, last, Some(tag));
            }
            Op::EraseRange { first, width } => {
                let last = first + width - 1;
                tree.store_range(first, last, None).unwrap();
                model.store(first, last, None);
            }
            Op::Erase { key } => {
                let expect = model.erase(key);
                let got = tree.erase(key).map(|ptr| ptr.as_ptr() as usize >> 8);
                assert_eq!(got, expect);
            }
        }
        tree.assert_valid();
    }

    // Every model boundary, probed one key around it.
    for &(lo, hi, _) in &model.ranges {
        for key in [lo.saturating_sub(1), lo, hi, hi + 1] {
            assert_eq!(
                tree.load(key).map(|ptr| ptr.as_ptr() as usize >> 8),
                model.load(key),
                "probe at {key}"
            );
        }
    }

    // Full in-order agreement.
    let found: Vec<_> = tree
        .iter()
        .map(|(range, ptr)| (*range.start(), *range.end(), ptr.as_ptr() as usize >> 8))
        .collect();
    let mut expected = model.ranges.clone();
    // The tree keeps adjacent equal-tagged stores as separate entries only
    // if they were stored separately; the model does too, so order and
    // content must agree exactly.
    expected.sort_unstable();
    assert_eq!(found, expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn matches_the_model(ops in ops(200)) {
        run(ops, TreeFlags::new());
    }

    #[test]
    fn matches_the_model_in_rcu_mode(ops in ops(200)) {
        run(ops, TreeFlags::new().with(TreeFlags::USE_RCU, true));
    }

    #[test]
    fn matches_the_model_with_gap_tracking(ops in ops(200)) {
        run(ops, TreeFlags::new().with(TreeFlags::ALLOC_RANGE, true));
    }

    #[test]
    fn alloc_always_returns_the_lowest_fit(
        seeds in proptest::collection::vec((0usize..2000, 1usize..32, 1usize..250), 1..40),
        requests in proptest::collection::vec(1usize..64, 1..20),
    ) {
        let tree: MapleTree<u8> =
            MapleTree::new_with(TreeFlags::new().with(TreeFlags::ALLOC_RANGE, true));
        let mut model = Model::default();
        for (first, width, tag) in seeds {
            let last = first + width - 1;
            tree.store_range(first, last, value!(tag)).unwrap();
            model.store(first, last, Some(tag));
        }
        tree.assert_valid();

        for (round, size) in requests.into_iter().enumerate() {
            // Brute-force the lowest fit against the model.
            let expect = (0usize..4000).find(|&start| {
                (start..start + size).all(|key| model.load(key).is_none())
            });
            match tree.alloc(0, 4000 + size, size, value!(round + 1)) {
                Ok(index) => {
                    prop_assert_eq!(Some(index), expect);
                    model.store(index, index + size - 1, Some(round + 1));
                }
                Err(_) => prop_assert!(expect.is_none()),
            }
            tree.assert_valid();
        }
    }
}
