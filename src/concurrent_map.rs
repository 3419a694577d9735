use crossbeam_epoch::Guard;

/// An ordered map whose operations run under a pinned epoch guard.
///
/// `insert` overwrites the value of an existing key; `remove` returns the
/// prior value if the key was present.
pub trait ConcurrentMap<K, V> {
    fn new(key: K, value: V) -> Self;
    fn get(&self, key: &K, guard: &Guard) -> Option<V>;
    fn insert(&self, key: K, value: V, guard: &Guard);
    fn remove(&self, key: &K, guard: &Guard) -> Option<V>;
}

#[cfg(test)]
pub mod tests {
    use super::ConcurrentMap;
    use crossbeam_epoch::pin;
    use crossbeam_utils::thread;
    use rand::prelude::*;
    use std::fmt::Debug;

    const THREADS: i32 = 30;
    const ELEMENTS_PER_THREADS: i32 = 1000;

    pub fn smoke<V, M, F>(to_value: &F)
    where
        V: Eq + Debug,
        M: ConcurrentMap<i32, V> + Send + Sync,
        F: Sync + Fn(&i32) -> V,
    {
        let map = &M::new(0, to_value(&0));

        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (1..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        map.insert(i, to_value(&i), &pin());
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (1..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert_eq!(to_value(&i), map.remove(&i, &pin()).unwrap());
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in (THREADS / 2)..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (1..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert_eq!(to_value(&i), map.get(&i, &pin()).unwrap());
                    }
                });
            }
        })
        .unwrap();
    }
}
