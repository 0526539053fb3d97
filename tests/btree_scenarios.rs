//! End-to-end scenarios over the public engine API.

use treefile::{
    Btree, BtreeConfig, BtreePayload, FilePager, InsertFlags, MemPager, AutoVacuum, TreeKind,
};

fn memory_btree(page_size: u32) -> Btree {
    let pager = Box::new(MemPager::new(page_size).unwrap());
    Btree::open(pager, BtreeConfig::default()).unwrap()
}

#[test]
fn test_thousand_inserts_grow_and_collapse_height() {
    let mut bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let mut cur = bt.cursor(1, true).unwrap();

    let mut last_height = 1;
    for i in 1..=1000i64 {
        cur.insert(
            &BtreePayload::table(i, format!("row{:04}", i).into_bytes()),
            InsertFlags::empty(),
        )
        .unwrap();
        // Height only ever grows during an insert-only workload.
        let height = bt.tree_height(1).unwrap();
        assert!(height >= last_height, "height shrank at row {}", i);
        last_height = height;
    }
    assert!(
        last_height >= 2,
        "1000 rows on 512-byte pages must have split the root"
    );

    // In-order traversal yields strictly increasing rowids.
    let mut prev = 0i64;
    let mut more = cur.first().unwrap();
    let mut count = 0;
    while more {
        let rowid = cur.rowid().unwrap();
        assert!(rowid > prev);
        prev = rowid;
        count += 1;
        more = cur.next().unwrap();
    }
    assert_eq!(count, 1000);
    drop(cur);
    bt.commit().unwrap();

    let check = bt.integrity_check(&[1], 0).unwrap();
    assert!(check.is_ok, "findings: {:?}", check.errors);

    // Rough fill check: 1000 rows of ~12-byte cells cannot occupy more
    // than ~120 pages if every non-rightmost page keeps at least the
    // minimum fill fraction.
    assert!(
        bt.page_count().unwrap() < 120,
        "tree is too sparse: {} pages",
        bt.page_count().unwrap()
    );

    // Deleting back down to one row collapses the tree to one level.
    bt.begin_trans(true).unwrap();
    assert_eq!(bt.delete_range(1, 2, 1000).unwrap(), 999);
    bt.commit().unwrap();
    assert_eq!(bt.tree_height(1).unwrap(), 1);

    let mut cur = bt.cursor(1, false).unwrap();
    assert!(cur.first().unwrap());
    assert_eq!(cur.rowid().unwrap(), 1);
    assert!(!cur.next().unwrap());
    drop(cur);

    let check = bt.integrity_check(&[1], 0).unwrap();
    assert!(check.is_ok, "findings: {:?}", check.errors);
}

#[test]
fn test_large_payload_overflow_chain_length() {
    let page_size = 4096u32;
    let payload_len = 100_000u32;
    let mut bt = memory_btree(page_size);
    bt.begin_trans(true).unwrap();
    let mut cur = bt.cursor(1, true).unwrap();

    let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    cur.insert(&BtreePayload::table(1, payload.clone()), InsertFlags::empty())
        .unwrap();
    drop(cur);
    bt.commit().unwrap();

    // Reproduce the local-payload rule to get the exact chain length:
    // local = minLocal + (payload - minLocal) % (usable - 4), clamped
    // to maxLocal.
    let usable = page_size;
    let max_local = usable - 35;
    let min_local = (usable - 12) * 32 / 255 - 23;
    let surplus = min_local + (payload_len - min_local) % (usable - 4);
    let local = if surplus <= max_local { surplus } else { min_local };
    let expected_chain = (payload_len - local).div_ceil(usable - 4);

    // The file is exactly the root plus the chain.
    assert_eq!(bt.page_count().unwrap(), 1 + expected_chain);

    let mut cur = bt.cursor(1, false).unwrap();
    assert_eq!(cur.table_moveto(1, false).unwrap(), 0);
    assert_eq!(cur.payload_size().unwrap(), payload_len);
    assert_eq!(cur.payload().unwrap(), payload);
    // Sliced reads cross the inline/overflow boundary correctly.
    let slice = cur.payload_slice(local - 10, 40).unwrap();
    assert_eq!(slice, &payload[(local - 10) as usize..(local + 30) as usize]);
    drop(cur);

    let check = bt.integrity_check(&[1], 0).unwrap();
    assert!(check.is_ok, "findings: {:?}", check.errors);

    // Deleting the row frees the whole chain back to the freelist.
    bt.begin_trans(true).unwrap();
    assert_eq!(bt.delete_range(1, 1, 1).unwrap(), 1);
    bt.commit().unwrap();
    assert_eq!(
        bt.get_meta(treefile::btree::META_FREE_PAGE_COUNT).unwrap(),
        expected_chain
    );
    let check = bt.integrity_check(&[1], 0).unwrap();
    assert!(check.is_ok, "findings: {:?}", check.errors);
}

#[test]
fn test_drop_tree_then_reopen_passes_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trees.db");

    {
        let pager = Box::new(FilePager::open(&path, 1024).unwrap());
        let mut bt = Btree::open(pager, BtreeConfig::default()).unwrap();
        bt.begin_trans(true).unwrap();
        let root = bt.create_tree(TreeKind::Table).unwrap();
        let mut cur = bt.cursor(root, true).unwrap();
        for i in 1..=500 {
            cur.insert(
                &BtreePayload::table(i, vec![(i % 200) as u8; 48]),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        drop(cur);
        bt.commit().unwrap();

        bt.begin_trans(true).unwrap();
        bt.drop_tree(root).unwrap();
        bt.commit().unwrap();
    }

    let pager = Box::new(FilePager::open(&path, 4096).unwrap());
    let bt = Btree::open(pager, BtreeConfig::default()).unwrap();
    assert_eq!(bt.page_size(), 1024);
    let check = bt.integrity_check(&[1], 0).unwrap();
    assert!(check.is_ok, "findings: {:?}", check.errors);
    // All pages are accounted for by the freelist plus page 1.
    let free = bt.get_meta(treefile::btree::META_FREE_PAGE_COUNT).unwrap();
    assert_eq!(free + 1, bt.page_count().unwrap());
}

#[test]
fn test_file_backed_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rows.db");

    {
        let pager = Box::new(FilePager::open(&path, 512).unwrap());
        let mut bt = Btree::open(pager, BtreeConfig::default()).unwrap();
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        for i in 1..=300 {
            cur.insert(
                &BtreePayload::table(i, format!("persisted {}", i).into_bytes()),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        drop(cur);
        bt.commit().unwrap();
    }

    let pager = Box::new(FilePager::open(&path, 512).unwrap());
    let bt = Btree::open(pager, BtreeConfig::default()).unwrap();
    let mut cur = bt.cursor(1, false).unwrap();
    assert_eq!(cur.table_moveto(150, false).unwrap(), 0);
    assert_eq!(cur.payload().unwrap(), b"persisted 150");
    let mut count = 0;
    let mut more = cur.first().unwrap();
    while more {
        count += 1;
        more = cur.next().unwrap();
    }
    assert_eq!(count, 300);
}

#[test]
fn test_mixed_insert_delete_churn_stays_consistent() {
    let mut bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let mut cur = bt.cursor(1, true).unwrap();

    // Interleave inserts and deletes so pages split, merge, and refill.
    for round in 0..6i64 {
        for i in 0..200 {
            let rowid = round * 1000 + (i * 37) % 997;
            cur.insert(
                &BtreePayload::table(rowid, vec![(rowid % 251) as u8; 25]),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        drop(cur);
        bt.delete_range(1, round * 1000 + 100, round * 1000 + 600)
            .unwrap();
        cur = bt.cursor(1, true).unwrap();
    }
    drop(cur);
    bt.commit().unwrap();

    let check = bt.integrity_check(&[1], 0).unwrap();
    assert!(check.is_ok, "findings: {:?}", check.errors);

    // Traversal is still strictly ordered.
    let mut cur = bt.cursor(1, false).unwrap();
    let mut prev = i64::MIN;
    let mut more = cur.first().unwrap();
    while more {
        let rowid = cur.rowid().unwrap();
        assert!(rowid > prev);
        prev = rowid;
        more = cur.next().unwrap();
    }
}

#[test]
fn test_index_tree_reverse_scan_and_delete() {
    let mut bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let root = bt.create_tree(TreeKind::Index).unwrap();
    let mut cur = bt.cursor(root, true).unwrap();

    let mut keys: Vec<String> = (0..300).map(|i| format!("key-{:05}", (i * 61) % 997)).collect();
    for key in &keys {
        cur.insert(
            &BtreePayload::index(key.clone().into_bytes()),
            InsertFlags::empty(),
        )
        .unwrap();
    }
    keys.sort();
    keys.dedup();

    // Reverse traversal sees the keys in descending order.
    let mut seen = Vec::new();
    let mut more = cur.last().unwrap();
    while more {
        seen.push(String::from_utf8(cur.payload().unwrap()).unwrap());
        more = cur.prev().unwrap();
    }
    let mut descending = keys.clone();
    descending.reverse();
    assert_eq!(seen, descending);

    // Delete every other key, including ones that sit on interior
    // pages, then re-verify order and structure.
    for key in keys.iter().step_by(2) {
        assert_eq!(cur.index_moveto(key.as_bytes()).unwrap(), 0);
        cur.delete().unwrap();
    }
    let survivors: Vec<String> = keys.iter().skip(1).step_by(2).cloned().collect();
    let mut seen = Vec::new();
    let mut more = cur.first().unwrap();
    while more {
        seen.push(String::from_utf8(cur.payload().unwrap()).unwrap());
        more = cur.next().unwrap();
    }
    assert_eq!(seen, survivors);
    drop(cur);
    bt.commit().unwrap();

    let check = bt.integrity_check(&[1, root], 0).unwrap();
    assert!(check.is_ok, "findings: {:?}", check.errors);
}

#[test]
fn test_auto_vacuum_reopen_keeps_pointer_map_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vacuum.db");

    {
        let pager = Box::new(FilePager::open(&path, 512).unwrap());
        let config = BtreeConfig {
            auto_vacuum: AutoVacuum::Full,
            ..BtreeConfig::default()
        };
        let mut bt = Btree::open(pager, config).unwrap();
        bt.begin_trans(true).unwrap();
        let root = bt.create_tree(TreeKind::Table).unwrap();
        let mut cur = bt.cursor(root, true).unwrap();
        for i in 1..=400 {
            cur.insert(
                &BtreePayload::table(i, vec![0x77; 50]),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        drop(cur);
        bt.commit().unwrap();

        bt.begin_trans(true).unwrap();
        bt.delete_range(root, 1, 350).unwrap();
        bt.commit().unwrap();

        let check = bt.integrity_check(&[1, root], 0).unwrap();
        assert!(check.is_ok, "findings: {:?}", check.errors);
        // FULL auto-vacuum leaves no free pages behind after commit.
        assert_eq!(bt.get_meta(treefile::btree::META_FREE_PAGE_COUNT).unwrap(), 0);
    }

    let pager = Box::new(FilePager::open(&path, 512).unwrap());
    let bt = Btree::open(pager, BtreeConfig::default()).unwrap();
    assert_eq!(bt.auto_vacuum_mode(), AutoVacuum::Full);
    let check = bt.integrity_check(&[1], 1000).unwrap();
    // Tree 2's root is not in the checked list, so its pages show as
    // unchecked; restrict to structural findings by checking page 1's
    // tree only on a file whose other tree is intact.
    assert!(
        check.errors.iter().all(|e| e.contains("never used")),
        "unexpected findings: {:?}",
        check.errors
    );
}
