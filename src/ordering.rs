use crate::key::Key;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Order in which a record stream yields its records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordOrder {
    /// Whatever order is cheapest to read: grouped by where the records are stored.
    Unordered,
    /// Parents before children. Needs a graph; stores without one fall back to `Unordered`.
    Topological,
    /// Per key prefix, children before parents, with prefixes in sorted order. This is the
    /// order that compresses best when the stream is inserted into another store.
    GroupCompress,
    /// Exactly the order keys were requested in, repeats included.
    AsRequested,
}

/// Sort the keys of `parent_map` so that every key comes after all of its parents that are also
/// in the map. Parents missing from the map are ignored. The result is deterministic.
pub fn topo_sort(parent_map: &HashMap<Key, Vec<Key>>) -> Vec<Key> {
    let mut roots: Vec<&Key> = parent_map.keys().collect();
    roots.sort();

    let mut out = Vec::with_capacity(parent_map.len());
    let mut seen: HashSet<&Key> = HashSet::with_capacity(parent_map.len());
    // Each frame is a key and how many of its parents have been visited.
    let mut stack: Vec<(&Key, usize)> = Vec::new();
    for root in roots {
        if !seen.insert(root) {
            continue;
        }
        stack.push((root, 0));
        while let Some((key, next)) = stack.last_mut() {
            let parents = &parent_map[*key];
            if let Some(parent) = parents.get(*next) {
                *next += 1;
                if let Some((parent, _)) = parent_map.get_key_value(parent) {
                    if seen.insert(parent) {
                        stack.push((parent, 0));
                    }
                }
            } else {
                out.push((*key).clone());
                stack.pop();
            }
        }
    }
    out
}

/// Order keys for best compression: group them by prefix, sort the prefixes, and within each
/// prefix put children before their parents, so the newest text of a file is stored first.
pub fn sort_gc_optimal(parent_map: &HashMap<Key, Vec<Key>>) -> Vec<Key> {
    let mut per_prefix: BTreeMap<&[String], HashMap<Key, Vec<Key>>> = BTreeMap::new();
    for (key, parents) in parent_map.iter() {
        per_prefix
            .entry(key.prefix())
            .or_default()
            .insert(key.clone(), parents.clone());
    }
    let mut out = Vec::with_capacity(parent_map.len());
    for map in per_prefix.values() {
        let mut sorted = topo_sort(map);
        sorted.reverse();
        out.extend(sorted);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn k(parts: &[&str]) -> Key {
        Key::new(parts.iter().copied()).unwrap()
    }

    #[test]
    fn topo_parents_first() {
        let mut map = HashMap::new();
        map.insert(k(&["c"]), vec![k(&["b"]), k(&["a"])]);
        map.insert(k(&["b"]), vec![k(&["a"])]);
        map.insert(k(&["a"]), vec![k(&["ghost"])]);
        map.insert(k(&["d"]), vec![k(&["c"])]);
        let sorted = topo_sort(&map);
        assert_eq!(sorted, vec![k(&["a"]), k(&["b"]), k(&["c"]), k(&["d"])]);
    }

    #[test]
    fn topo_long_chain() {
        let mut map = HashMap::new();
        for i in 1..5000 {
            map.insert(k(&[format!("r{}", i).as_str()]), vec![k(&[format!("r{}", i - 1).as_str()])]);
        }
        map.insert(k(&["r0"]), vec![]);
        let sorted = topo_sort(&map);
        assert_eq!(sorted.len(), 5000);
        let pos: HashMap<&Key, usize> = sorted.iter().enumerate().map(|(i, k)| (k, i)).collect();
        for i in 1..5000 {
            let child = k(&[format!("r{}", i).as_str()]);
            let parent = k(&[format!("r{}", i - 1).as_str()]);
            assert!(pos[&parent] < pos[&child]);
        }
    }

    #[test]
    fn topo_tolerates_cycles() {
        let mut map = HashMap::new();
        map.insert(k(&["a"]), vec![k(&["b"])]);
        map.insert(k(&["b"]), vec![k(&["a"])]);
        assert_eq!(topo_sort(&map).len(), 2);
    }

    #[test]
    fn gc_optimal() {
        let mut map = HashMap::new();
        map.insert(k(&["f2", "r1"]), vec![]);
        map.insert(k(&["f2", "r2"]), vec![k(&["f2", "r1"])]);
        map.insert(k(&["f1", "r1"]), vec![]);
        map.insert(k(&["f1", "r2"]), vec![k(&["f1", "r1"])]);
        map.insert(k(&["f1", "r3"]), vec![k(&["f1", "r2"])]);
        assert_eq!(
            sort_gc_optimal(&map),
            vec![
                k(&["f1", "r3"]),
                k(&["f1", "r2"]),
                k(&["f1", "r1"]),
                k(&["f2", "r2"]),
                k(&["f2", "r1"]),
            ]
        );
    }
}
