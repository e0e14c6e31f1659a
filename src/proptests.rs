use crate::collections::{estimate_required_bytes, TreeMap};
use crate::error::Error;

use proptest::prelude::*;
use std::collections::BTreeMap;

const PAYLOAD: usize = std::mem::size_of::<u64>();

#[derive(Clone, Debug)]
enum Op {
    Insert(String, u64),
    Remove(String),
    Get(String),
}

fn key_strategy() -> impl Strategy<Value = String> + Clone {
    // a small alphabet makes overwrites and removals of present keys likely
    "[a-f0-9]{0,6}"
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let key = key_strategy();
    let op = prop_oneof![
        50 => (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        30 => key.clone().prop_map(Op::Remove),
        20 => key.prop_map(Op::Get),
    ];
    prop::collection::vec(op, 0..=500)
}

fn height_bound(len: usize) -> usize {
    (1.44 * ((len + 2) as f64).log2()).floor() as usize
}

fn check<B: AsRef<[u8]>>(t: &TreeMap<B>, m: &BTreeMap<String, u64>) -> Result<(), TestCaseError> {
    prop_assert!(t.verify().is_ok(), "{:?}", t.verify());
    prop_assert_eq!(t.len(), m.len());
    prop_assert!(t.height() <= height_bound(m.len()));
    prop_assert_eq!(t.len() + t.free_slots(), t.capacity());

    let mut keys: Vec<String> = t.keys().map(|key| key.into_owned()).collect();
    keys.sort();
    let expected: Vec<String> = m.keys().cloned().collect();
    prop_assert_eq!(keys, expected);

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(ops in ops_strategy()) {
        let mut data = vec![0u8; estimate_required_bytes(PAYLOAD, 512)];
        let mut t = TreeMap::initialize(data.as_mut_slice(), PAYLOAD).unwrap();
        let mut m: BTreeMap<String, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    let created = t.insert_pod(&key, &value).unwrap();
                    prop_assert_eq!(created, m.insert(key, value).is_none());
                }
                Op::Remove(key) => {
                    prop_assert_eq!(t.remove(&key), m.remove(&key).is_some());
                    prop_assert!(!t.contains(&key));
                }
                Op::Get(key) => {
                    prop_assert_eq!(t.get_pod::<u64>(&key), m.get(&key).copied());
                }
            }

            prop_assert_eq!(t.len(), m.len());
        }

        check(&t, &m)?;
    }

    #[test]
    fn prop_bounded_pool(ops in ops_strategy()) {
        const CAPACITY: usize = 16;

        let mut data = vec![0u8; estimate_required_bytes(PAYLOAD, CAPACITY)];
        let mut t = TreeMap::initialize(data.as_mut_slice(), PAYLOAD).unwrap();
        let mut m: BTreeMap<String, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => match t.insert_pod(&key, &value) {
                    Ok(_) => {
                        m.insert(key, value);
                    }
                    Err(error) => {
                        prop_assert_eq!(error, Error::PoolExhausted);
                        prop_assert_eq!(m.len(), CAPACITY);
                        prop_assert!(!m.contains_key(&key));
                    }
                },
                Op::Remove(key) => {
                    prop_assert_eq!(t.remove(&key), m.remove(&key).is_some());
                }
                Op::Get(key) => {
                    prop_assert_eq!(t.get_pod::<u64>(&key), m.get(&key).copied());
                }
            }

            prop_assert_eq!(t.is_pool_exhausted(), m.len() == CAPACITY);
        }

        check(&t, &m)?;
    }

    #[test]
    fn prop_relocation(ops in ops_strategy(), shift in 1usize..16) {
        let mut data = vec![0u8; estimate_required_bytes(PAYLOAD, 512)];
        let mut t = TreeMap::initialize(data.as_mut_slice(), PAYLOAD).unwrap();
        let mut m: BTreeMap<String, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    t.insert_pod(&key, &value).unwrap();
                    m.insert(key, value);
                }
                Op::Remove(key) => {
                    t.remove(&key);
                    m.remove(&key);
                }
                Op::Get(_) => {}
            }
        }

        let layout = t.layout();
        let keys: Vec<String> = t.keys().map(|key| key.into_owned()).collect();
        let height = t.height();

        let mut moved = vec![0u8; data.len() + shift];
        moved[shift..].copy_from_slice(&data);
        let relocated = TreeMap::attach(&moved[shift..], layout).unwrap();

        let relocated_keys: Vec<String> = relocated.keys().map(|key| key.into_owned()).collect();
        prop_assert_eq!(relocated_keys, keys);
        prop_assert_eq!(relocated.height(), height);
        for (key, value) in m.iter() {
            prop_assert_eq!(relocated.get_pod::<u64>(key), Some(*value));
        }
        check(&relocated, &m)?;
    }

    #[test]
    fn prop_grow_while_inserting(keys in prop::collection::btree_set(key_strategy(), 0..200)) {
        let mut data = vec![0u8; estimate_required_bytes(PAYLOAD, 4)];
        let mut layout = TreeMap::initialize(data.as_mut_slice(), PAYLOAD).unwrap().layout();
        let mut m: BTreeMap<String, u64> = BTreeMap::new();

        for (i, key) in keys.into_iter().enumerate() {
            if TreeMap::attach(data.as_slice(), layout).unwrap().is_pool_exhausted() {
                let capacity = layout.capacity();
                data.resize(estimate_required_bytes(PAYLOAD, capacity * 2), 0);

                let (grown, report) = TreeMap::relink_grown(data.as_mut_slice(), layout).unwrap();
                prop_assert_eq!(report.added, capacity);
                layout = grown.layout();
            }

            let mut t = TreeMap::attach(data.as_mut_slice(), layout).unwrap();
            t.insert_pod(&key, &(i as u64)).unwrap();
            m.insert(key, i as u64);
        }

        let t = TreeMap::attach(data.as_slice(), layout).unwrap();
        check(&t, &m)?;
    }
}
