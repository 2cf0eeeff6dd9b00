use std::collections::HashMap;

/// Allocate a random non-zero 64-bit identifier not already present in `map`.
///
/// The caller holds the registry lock, so the lookup and the subsequent
/// insert are atomic with respect to other allocators. Collisions are
/// vanishingly rare; the loop exists for correctness, not performance.
pub fn allocate_id<V>(map: &HashMap<u64, V>) -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 && !map.contains_key(&id) {
            return id;
        }
    }
}
