use super::*;
use assert_matches::assert_matches;

fn fork(left: MixedHashTree, right: MixedHashTree) -> MixedHashTree {
    MixedHashTree::Fork(Box::new((left, right)))
}

fn labeled(label: &str, subtree: MixedHashTree) -> MixedHashTree {
    MixedHashTree::Labeled(Label::from(label), Box::new(subtree))
}

fn leaf(value: &str) -> MixedHashTree {
    MixedHashTree::Leaf(value.as_bytes().to_vec())
}

fn path(segments: &[&str]) -> Path {
    Path::new(segments.iter().map(|s| Label::from(*s)).collect())
}

/// The reference tree from the public interface specification.
fn spec_example_tree() -> MixedHashTree {
    fork(
        fork(
            labeled(
                "a",
                fork(
                    fork(labeled("x", leaf("hello")), MixedHashTree::Empty),
                    labeled("y", leaf("world")),
                ),
            ),
            labeled("b", leaf("good")),
        ),
        fork(labeled("c", MixedHashTree::Empty), labeled("d", leaf("morning"))),
    )
}

/// The same tree with the `a/x`, `b`, and `c` subtrees pruned away.
fn spec_example_tree_pruned() -> MixedHashTree {
    let full = spec_example_tree();
    let prune = |p: &[&str]| -> MixedHashTree {
        match full.lookup_subtree(&path(p)) {
            SubtreeLookupStatus::Found(subtree) => MixedHashTree::Pruned(subtree.digest()),
            other => panic!("expected subtree at {p:?}, got {other:?}"),
        }
    };
    let pruned_b = prune(&["b"]);
    let pruned_c = match &full {
        MixedHashTree::Fork(top) => match &top.1 {
            MixedHashTree::Fork(bottom) => MixedHashTree::Pruned(bottom.0.digest()),
            _ => unreachable!(),
        },
        _ => unreachable!(),
    };
    let pruned_ax = match full.lookup_subtree(&path(&["a"])) {
        SubtreeLookupStatus::Found(MixedHashTree::Fork(inner)) => {
            MixedHashTree::Pruned(inner.0.digest())
        }
        other => panic!("unexpected shape under a: {other:?}"),
    };
    fork(
        fork(
            labeled("a", fork(pruned_ax, labeled("y", leaf("world")))),
            labeled("b", pruned_b),
        ),
        fork(pruned_c, labeled("d", leaf("morning"))),
    )
}

mod digest {
    use super::*;

    #[test]
    fn should_reproduce_the_specification_root_digest() {
        assert_eq!(
            hex::encode(spec_example_tree().digest().as_bytes()),
            "eb5c5b2195e62d996b84c9bcc8259d19a83786a2f59e0878cec84c811f669aa0"
        );
    }

    #[test]
    fn should_keep_the_root_digest_stable_under_pruning() {
        assert_eq!(spec_example_tree().digest(), spec_example_tree_pruned().digest());
    }

    #[test]
    fn should_distinguish_fork_child_order() {
        let ab = fork(labeled("a", leaf("1")), labeled("b", leaf("2")));
        let ba = fork(labeled("b", leaf("2")), labeled("a", leaf("1")));
        assert_ne!(ab.digest(), ba.digest());
    }

    #[test]
    fn should_distinguish_leaf_from_labeled_empty() {
        assert_ne!(leaf("").digest(), labeled("", MixedHashTree::Empty).digest());
        assert_ne!(leaf("").digest(), MixedHashTree::Empty.digest());
    }
}

mod lookup {
    use super::*;

    #[test]
    fn should_find_present_values() {
        let tree = spec_example_tree();
        assert_matches!(tree.lookup_path(&path(&["a", "x"])), LookupStatus::Found(v) if v == b"hello");
        assert_matches!(tree.lookup_path(&path(&["a", "y"])), LookupStatus::Found(v) if v == b"world");
        assert_matches!(tree.lookup_path(&path(&["b"])), LookupStatus::Found(v) if v == b"good");
        assert_matches!(tree.lookup_path(&path(&["d"])), LookupStatus::Found(v) if v == b"morning");
    }

    #[test]
    fn should_find_values_that_survive_pruning() {
        let tree = spec_example_tree_pruned();
        assert_matches!(tree.lookup_path(&path(&["a", "y"])), LookupStatus::Found(v) if v == b"world");
        assert_matches!(tree.lookup_path(&path(&["d"])), LookupStatus::Found(v) if v == b"morning");
    }

    #[test]
    fn should_prove_absence_between_visible_labels() {
        let tree = spec_example_tree();
        assert_matches!(tree.lookup_path(&path(&["aa"])), LookupStatus::Absent);
        assert_matches!(tree.lookup_path(&path(&["z"])), LookupStatus::Absent);
        assert_matches!(tree.lookup_path(&path(&["a", "xx"])), LookupStatus::Absent);
    }

    #[test]
    fn should_prove_absence_in_unpruned_gaps_of_a_pruned_tree() {
        // Top level flattens to [a, b, Pruned, d]: the a..b gap is fully
        // visible while the b..d gap hides behind the pruned node.
        let tree = spec_example_tree_pruned();
        assert_matches!(tree.lookup_path(&path(&["aa"])), LookupStatus::Absent);
        assert_matches!(tree.lookup_path(&path(&["c"])), LookupStatus::Unknown);
    }

    #[test]
    fn should_report_unknown_for_pruned_subtrees() {
        let tree = spec_example_tree_pruned();
        assert_matches!(tree.lookup_path(&path(&["a", "x"])), LookupStatus::Unknown);
        assert_matches!(tree.lookup_path(&path(&["b"])), LookupStatus::Unknown);
    }

    #[test]
    fn should_error_when_descending_into_a_leaf() {
        let tree = spec_example_tree();
        assert_matches!(
            tree.lookup_path(&path(&["b", "deeper"])),
            LookupStatus::Error(LookupError::UnexpectedLeaf)
        );
    }

    #[test]
    fn should_error_when_the_path_ends_on_an_interior_node() {
        let tree = spec_example_tree();
        assert_matches!(
            tree.lookup_path(&path(&["a"])),
            LookupStatus::Error(LookupError::NotALeaf)
        );
    }

    #[test]
    fn should_treat_labeled_empty_as_absent_value() {
        let tree = spec_example_tree();
        assert_matches!(tree.lookup_path(&path(&["c"])), LookupStatus::Absent);
    }

    #[test]
    fn should_flatten_labelled_children_in_order() {
        let tree = spec_example_tree();
        let labels: Vec<&Label> = tree.flatten_forks().into_iter().map(|(l, _)| l).collect();
        assert_eq!(
            labels,
            vec![&Label::from("a"), &Label::from("b"), &Label::from("c"), &Label::from("d")]
        );
    }
}

mod encoding {
    use super::*;

    #[test]
    fn should_round_trip_through_cbor() {
        for tree in [
            MixedHashTree::Empty,
            spec_example_tree(),
            spec_example_tree_pruned(),
        ] {
            let bytes = serde_cbor::to_vec(&tree).expect("failed to encode tree");
            let decoded: MixedHashTree =
                serde_cbor::from_slice(&bytes).expect("failed to decode tree");
            assert_eq!(tree, decoded);
        }
    }

    #[test]
    fn should_preserve_label_bytes_exactly() {
        let raw_label: Vec<u8> = vec![0x00, 0xff, 0x10, 0x80];
        let tree = MixedHashTree::Labeled(
            Label::from(raw_label.clone()),
            Box::new(MixedHashTree::Leaf(vec![0xde, 0xad])),
        );
        let bytes = serde_cbor::to_vec(&tree).expect("failed to encode tree");
        let decoded: MixedHashTree = serde_cbor::from_slice(&bytes).expect("failed to decode tree");
        assert_eq!(decoded.digest(), tree.digest());
        match decoded {
            MixedHashTree::Labeled(label, _) => assert_eq!(label.as_bytes(), &raw_label[..]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn should_reject_malformed_digests() {
        // [4, 31-byte string]
        let mut bytes = vec![0x82, 0x04, 0x58, 31];
        bytes.extend_from_slice(&[0u8; 31]);
        assert!(serde_cbor::from_slice::<MixedHashTree>(&bytes).is_err());
    }

    #[test]
    fn should_reject_unknown_variant_tags() {
        let bytes = vec![0x81, 0x05];
        assert!(serde_cbor::from_slice::<MixedHashTree>(&bytes).is_err());
    }
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn arb_tree() -> impl Strategy<Value = MixedHashTree> {
        let leaf_strategy = prop_oneof![
            Just(MixedHashTree::Empty),
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(MixedHashTree::Leaf),
        ];
        leaf_strategy.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone()).prop_map(|(l, r)| MixedHashTree::Fork(Box::new((l, r)))),
                (proptest::collection::vec(any::<u8>(), 1..8), inner)
                    .prop_map(|(l, t)| MixedHashTree::Labeled(Label::from(l), Box::new(t))),
            ]
        })
    }

    proptest! {
        #[test]
        fn digest_depends_only_on_shape(tree in arb_tree()) {
            prop_assert_eq!(tree.digest(), tree.clone().digest());
        }

        #[test]
        fn swapping_distinct_fork_children_changes_the_digest(
            left in arb_tree(),
            right in arb_tree(),
        ) {
            prop_assume!(left.digest() != right.digest());
            let ab = MixedHashTree::Fork(Box::new((left.clone(), right.clone())));
            let ba = MixedHashTree::Fork(Box::new((right, left)));
            prop_assert_ne!(ab.digest(), ba.digest());
        }

        #[test]
        fn cbor_round_trip_preserves_digest(tree in arb_tree()) {
            let bytes = serde_cbor::to_vec(&tree).unwrap();
            let decoded: MixedHashTree = serde_cbor::from_slice(&bytes).unwrap();
            prop_assert_eq!(tree.digest(), decoded.digest());
        }
    }
}
