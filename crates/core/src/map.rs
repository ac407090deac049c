//! Persistent map operations.
//!
//! A map's buckets are lists alternating key,value so the collector walks
//! them like any other cell. Updates never touch the input map: `put`,
//! `delete` and `merge` build a fresh map, sharing untouched buckets where
//! the capacity allows it.
//!
//! Every operation that allocates keeps its working set in frame registers
//! and re-reads them after each allocation; the collector may run between
//! any two of them.

use crate::machine::{FrameId, Machine};
use crate::value::{MISS, ValueRef};

/// Grow when an insert would reach three quarters of capacity.
fn over_load_factor(length: u64, capacity: u64) -> bool {
    4 * (length + 1) >= 3 * capacity
}

impl crate::heap::Heap {
    /// Looks up `key`, returning the bound value or `otherwise` on a miss.
    /// Passing [`MISS`] as the default distinguishes "absent value bound"
    /// from "no binding".
    pub fn map_get_or_else(
        &self,
        map: ValueRef,
        key: Option<ValueRef>,
        otherwise: Option<ValueRef>,
    ) -> Option<ValueRef> {
        let (capacity, _) = self.map_dims(map);
        if capacity == 0 {
            return otherwise;
        }
        let index = (self.hash(key) % capacity) as usize;
        let mut cursor = self.map_bucket(map, index);
        while cursor.is_some() {
            if self.equals(key, self.pair_key(cursor)) {
                return self.pair_value(cursor);
            }
            cursor = self.pair_next(cursor);
        }
        otherwise
    }

    /// Whether every entry of `sub` is present in `sup` with an equal value.
    pub fn map_subset_of(&self, sup: ValueRef, sub: ValueRef) -> bool {
        let (sub_capacity, sub_length) = self.map_dims(sub);
        let (_, sup_length) = self.map_dims(sup);
        if sub_length > sup_length {
            return false;
        }
        for index in 0..sub_capacity as usize {
            let mut cursor = self.map_bucket(sub, index);
            while cursor.is_some() {
                let key = self.pair_key(cursor);
                let value = self.pair_value(cursor);
                let found = self.map_get_or_else(sup, key, Some(MISS));
                if found == Some(MISS) {
                    return false;
                }
                if !self.equals(found, value) {
                    return false;
                }
                cursor = self.pair_next(cursor);
            }
        }
        true
    }
}

impl Machine {
    /// A copy of `map` where `key` is bound to `value`.
    ///
    /// Grows and rehashes when the insert would cross the load factor;
    /// otherwise the new map shares every bucket but the target one.
    pub fn map_put(
        &mut self,
        map: ValueRef,
        key: Option<ValueRef>,
        value: Option<ValueRef>,
    ) -> Result<ValueRef, ValueRef> {
        let arguments = self.push_frame([Some(map), key, value]);
        let variables = self.push_frame([None, None, None]);
        let result = self.map_put_rooted(arguments, variables);
        self.pop_frame(variables);
        self.pop_frame(arguments);
        result
    }

    fn map_put_rooted(
        &mut self,
        arguments: FrameId,
        variables: FrameId,
    ) -> Result<ValueRef, ValueRef> {
        let source = self.registers(arguments)[0].expect("map argument is rooted");
        let (old_capacity, old_length) = self.heap().map_dims(source);
        let mut capacity = old_capacity;
        if over_load_factor(old_length, capacity) {
            capacity = (capacity * 2).max((old_length + 1) * 2);
        }

        let fresh = self.map_with_capacity(capacity)?;
        self.set_register(variables, 0, Some(fresh));
        self.heap_mut().set_map_length(fresh, old_length);

        if capacity != old_capacity {
            // rehash every entry into the wider bucket array
            for index in 0..old_capacity as usize {
                let source = self.registers(arguments)[0];
                let bucket = source.and_then(|map| self.heap().map_bucket(map, index));
                self.set_register(variables, 1, bucket);
                while self.registers(variables)[1].is_some() {
                    let cursor = self.registers(variables)[1];
                    let key = self.heap().pair_key(cursor);
                    let value = self.heap().pair_value(cursor);
                    let target = (self.heap().hash(key) % capacity) as usize;
                    let fresh = self.registers(variables)[0].expect("fresh map is rooted");
                    let bucket = self.heap().map_bucket(fresh, target);
                    let rebuilt = self.bucket_insert(bucket, key, value)?;
                    let fresh = self.registers(variables)[0].expect("fresh map is rooted");
                    self.heap_mut().set_map_bucket(fresh, target, rebuilt);
                    let cursor = self.registers(variables)[1];
                    self.set_register(variables, 1, self.heap().pair_next(cursor));
                }
            }
        } else {
            // same capacity: share the bucket spines
            let source = self.registers(arguments)[0].expect("map argument is rooted");
            let fresh = self.registers(variables)[0].expect("fresh map is rooted");
            for index in 0..capacity as usize {
                let bucket = self.heap().map_bucket(source, index);
                self.heap_mut().set_map_bucket(fresh, index, bucket);
            }
        }

        // bind the new pair
        let key = self.registers(arguments)[1];
        let index = (self.heap().hash(key) % capacity) as usize;
        let fresh = self.registers(variables)[0].expect("fresh map is rooted");
        let bucket = self.heap().map_bucket(fresh, index);
        let before = self.heap().list_length(bucket);
        let value = self.registers(arguments)[2];
        let rebuilt = self.bucket_insert(bucket, key, value)?;

        let fresh = self.registers(variables)[0].expect("fresh map is rooted");
        self.heap_mut().set_map_bucket(fresh, index, rebuilt);
        if self.heap().list_length(rebuilt) > before {
            let (_, length) = self.heap().map_dims(fresh);
            self.heap_mut().set_map_length(fresh, length + 1);
        }
        Ok(fresh)
    }

    /// Rebuilds one bucket with `key` bound to `value`: replaces the pair in
    /// place of a match, prepends otherwise.
    fn bucket_insert(
        &mut self,
        bucket: Option<ValueRef>,
        key: Option<ValueRef>,
        value: Option<ValueRef>,
    ) -> Result<Option<ValueRef>, ValueRef> {
        let arguments = self.push_frame([bucket, key, value]);
        let variables = self.push_frame([None, None, None]);
        let result = self.bucket_insert_rooted(arguments, variables);
        self.pop_frame(variables);
        self.pop_frame(arguments);
        result
    }

    fn bucket_insert_rooted(
        &mut self,
        arguments: FrameId,
        variables: FrameId,
    ) -> Result<Option<ValueRef>, ValueRef> {
        let mut found = false;
        while self.registers(arguments)[0].is_some() {
            let cursor = self.registers(arguments)[0];
            let key = self.registers(arguments)[1];
            if !found && self.heap().equals(key, self.heap().pair_key(cursor)) {
                let value = self.registers(arguments)[2];
                let cell = self.list(value, self.registers(variables)[0])?;
                self.set_register(variables, 0, Some(cell));
                let key = self.registers(arguments)[1];
                let cell = self.list(key, self.registers(variables)[0])?;
                self.set_register(variables, 0, Some(cell));
                found = true;
            } else {
                let value = self.heap().pair_value(cursor);
                let cell = self.list(value, self.registers(variables)[0])?;
                self.set_register(variables, 0, Some(cell));
                let cursor = self.registers(arguments)[0];
                let key = self.heap().pair_key(cursor);
                let cell = self.list(key, self.registers(variables)[0])?;
                self.set_register(variables, 0, Some(cell));
            }
            let cursor = self.registers(arguments)[0];
            self.set_register(arguments, 0, self.heap().pair_next(cursor));
        }

        if !found {
            let value = self.registers(arguments)[2];
            let cell = self.list(value, self.registers(variables)[0])?;
            self.set_register(variables, 0, Some(cell));
            let key = self.registers(arguments)[1];
            let cell = self.list(key, self.registers(variables)[0])?;
            self.set_register(variables, 0, Some(cell));
        }
        Ok(self.registers(variables)[0])
    }

    /// A copy of `map` without `key`; returns the input unchanged on a miss.
    pub fn map_delete(
        &mut self,
        map: ValueRef,
        key: Option<ValueRef>,
    ) -> Result<ValueRef, ValueRef> {
        let (capacity, _) = self.heap().map_dims(map);
        if capacity == 0 {
            return Ok(map);
        }
        let index = (self.heap().hash(key) % capacity) as usize;
        let mut present = false;
        let mut cursor = self.heap().map_bucket(map, index);
        while cursor.is_some() {
            if self.heap().equals(key, self.heap().pair_key(cursor)) {
                present = true;
                break;
            }
            cursor = self.heap().pair_next(cursor);
        }
        if !present {
            return Ok(map);
        }

        let arguments = self.push_frame([Some(map), key, None]);
        let variables = self.push_frame([None, None, None]);
        let result = self.map_delete_rooted(arguments, variables, index);
        self.pop_frame(variables);
        self.pop_frame(arguments);
        result
    }

    fn map_delete_rooted(
        &mut self,
        arguments: FrameId,
        variables: FrameId,
        index: usize,
    ) -> Result<ValueRef, ValueRef> {
        let source = self.registers(arguments)[0];
        let clone = self.clone_value(source)?.expect("map argument is rooted");
        self.set_register(arguments, 2, Some(clone));

        let bucket = self.heap().map_bucket(clone, index);
        self.set_register(variables, 0, bucket);
        let mut removed = false;
        while self.registers(variables)[0].is_some() {
            let cursor = self.registers(variables)[0];
            let key = self.registers(arguments)[1];
            if !removed && self.heap().equals(key, self.heap().pair_key(cursor)) {
                removed = true;
            } else {
                let value = self.heap().pair_value(cursor);
                let cell = self.list(value, self.registers(variables)[1])?;
                self.set_register(variables, 1, Some(cell));
                let cursor = self.registers(variables)[0];
                let key = self.heap().pair_key(cursor);
                let cell = self.list(key, self.registers(variables)[1])?;
                self.set_register(variables, 1, Some(cell));
            }
            let cursor = self.registers(variables)[0];
            self.set_register(variables, 0, self.heap().pair_next(cursor));
        }

        let clone = self.registers(arguments)[2].expect("clone is rooted");
        let rebuilt = self.registers(variables)[1];
        self.heap_mut().set_map_bucket(clone, index, rebuilt);
        if removed {
            let (_, length) = self.heap().map_dims(clone);
            self.heap_mut().set_map_length(clone, length - 1);
        }
        Ok(clone)
    }

    /// A fresh map holding the union of `a` and `b`; `b` wins on key
    /// collisions.
    pub fn map_merge(&mut self, a: ValueRef, b: ValueRef) -> Result<ValueRef, ValueRef> {
        let arguments = self.push_frame([Some(a), Some(b), None]);
        let variables = self.push_frame([None, None, None]);
        let result = self.map_merge_rooted(arguments, variables);
        self.pop_frame(variables);
        self.pop_frame(arguments);
        result
    }

    fn map_merge_rooted(
        &mut self,
        arguments: FrameId,
        variables: FrameId,
    ) -> Result<ValueRef, ValueRef> {
        let (capacity_a, _) = self.heap().map_dims(
            self.registers(arguments)[0].expect("first map is rooted"),
        );
        let (capacity_b, _) = self.heap().map_dims(
            self.registers(arguments)[1].expect("second map is rooted"),
        );
        let capacity = ((capacity_a + capacity_b) as f64 * (4.0 / 3.0)) as u64;
        let merged = self.map_with_capacity(capacity)?;
        self.set_register(arguments, 2, Some(merged));

        // a first, then b, so b's bindings override a's
        for argument in 0..2 {
            let capacity = if argument == 0 { capacity_a } else { capacity_b };
            for index in 0..capacity as usize {
                let source = self.registers(arguments)[argument];
                let bucket = source.and_then(|map| self.heap().map_bucket(map, index));
                self.set_register(variables, 0, bucket);
                while self.registers(variables)[0].is_some() {
                    let cursor = self.registers(variables)[0];
                    let key = self.heap().pair_key(cursor);
                    let value = self.heap().pair_value(cursor);
                    let merged = self.registers(arguments)[2].expect("merged map is rooted");
                    let merged = self.map_put(merged, key, value)?;
                    self.set_register(arguments, 2, Some(merged));
                    let cursor = self.registers(variables)[0];
                    self.set_register(variables, 0, self.heap().pair_next(cursor));
                }
            }
        }
        Ok(self.registers(arguments)[2].expect("merged map is rooted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineConfig;

    fn machine() -> Machine {
        Machine::new(MachineConfig::default())
    }

    fn string_key(m: &mut Machine, text: &str) -> Option<ValueRef> {
        Some(m.string(text).unwrap())
    }

    #[test]
    fn test_put_then_get() {
        let mut m = machine();
        let map = m.map_with_capacity(16).unwrap();
        let key = string_key(&mut m, "name");
        let value = string_key(&mut m, "skein");
        let map = m.map_put(map, key, value).unwrap();
        let found = m.heap().map_get_or_else(map, key, Some(MISS));
        assert!(m.heap().equals(found, value));
        assert_eq!(m.heap().map_dims(map).1, 1);
    }

    #[test]
    fn test_get_miss_returns_default() {
        let mut m = machine();
        let map = m.map_with_capacity(16).unwrap();
        let key = string_key(&mut m, "absent");
        assert_eq!(m.heap().map_get_or_else(map, key, Some(MISS)), Some(MISS));
        assert_eq!(m.heap().map_get_or_else(map, key, None), None);
    }

    #[test]
    fn test_put_replaces_existing_binding() {
        let mut m = machine();
        let map = m.map_with_capacity(16).unwrap();
        let key = string_key(&mut m, "k");
        let first = m.number(1.0).unwrap();
        let map = m.map_put(map, key, Some(first)).unwrap();
        let second = m.number(2.0).unwrap();
        let map = m.map_put(map, key, Some(second)).unwrap();
        assert_eq!(m.heap().map_dims(map).1, 1);
        let found = m.heap().map_get_or_else(map, key, Some(MISS)).unwrap();
        assert_eq!(m.heap().number_value(found), Some(2.0));
    }

    #[test]
    fn test_put_leaves_the_input_untouched() {
        let mut m = machine();
        let map = m.map_with_capacity(16).unwrap();
        let key = string_key(&mut m, "k");
        let value = m.number(1.0).unwrap();
        let frame = m.push_frame([Some(map), key, None]);
        let updated = m.map_put(map, key, Some(value)).unwrap();
        let original = m.registers(frame)[0].unwrap();
        let key = m.registers(frame)[1];
        assert_eq!(m.heap().map_dims(original).1, 0);
        assert_eq!(m.heap().map_get_or_else(original, key, Some(MISS)), Some(MISS));
        assert_ne!(updated, original);
        m.pop_frame(frame);
    }

    #[test]
    fn test_growth_rehashes_every_entry() {
        let mut m = machine();
        let map = m.map_with_capacity(4).unwrap();
        let frame = m.push_frame([Some(map), None, None]);
        for index in 0..32 {
            // keep the key rooted across the number allocation
            let key = m.string(&format!("key-{index}")).unwrap();
            m.set_register(frame, 1, Some(key));
            let value = m.number(index as f64).unwrap();
            let map = m.registers(frame)[0].unwrap();
            let key = m.registers(frame)[1];
            let map = m.map_put(map, key, Some(value)).unwrap();
            m.set_register(frame, 0, Some(map));
        }
        let map = m.registers(frame)[0].unwrap();
        let (capacity, length) = m.heap().map_dims(map);
        assert_eq!(length, 32);
        assert!(capacity > 4);
        for index in 0..32 {
            let key = m.string(&format!("key-{index}")).unwrap();
            let map = m.registers(frame)[0].unwrap();
            let found = m.heap().map_get_or_else(map, Some(key), Some(MISS)).unwrap();
            assert_eq!(m.heap().number_value(found), Some(index as f64));
        }
        m.pop_frame(frame);
    }

    #[test]
    fn test_delete_removes_and_misses_are_identity() {
        let mut m = machine();
        let map = m.map_with_capacity(16).unwrap();
        let key = string_key(&mut m, "gone");
        let value = m.number(3.0).unwrap();
        let map = m.map_put(map, key, Some(value)).unwrap();

        let smaller = m.map_delete(map, key).unwrap();
        assert_eq!(m.heap().map_dims(smaller).1, 0);
        assert_eq!(m.heap().map_get_or_else(smaller, key, Some(MISS)), Some(MISS));
        // the original still holds the binding
        assert!(m.heap().map_get_or_else(map, key, Some(MISS)) != Some(MISS));

        let other = string_key(&mut m, "never-inserted");
        let unchanged = m.map_delete(map, other).unwrap();
        assert_eq!(unchanged, map);
    }

    #[test]
    fn test_merge_prefers_the_second_map() {
        let mut m = machine();
        let a = m.map_with_capacity(8).unwrap();
        let key = string_key(&mut m, "shared");
        let only_a = string_key(&mut m, "only-a");
        let one = m.number(1.0).unwrap();
        let a = m.map_put(a, key, Some(one)).unwrap();
        let ten = m.number(10.0).unwrap();
        let a = m.map_put(a, only_a, Some(ten)).unwrap();

        let b = m.map_with_capacity(8).unwrap();
        let two = m.number(2.0).unwrap();
        let b = m.map_put(b, key, Some(two)).unwrap();

        let merged = m.map_merge(a, b).unwrap();
        assert_eq!(m.heap().map_dims(merged).1, 2);
        let found = m.heap().map_get_or_else(merged, key, Some(MISS)).unwrap();
        assert_eq!(m.heap().number_value(found), Some(2.0));
        let found = m.heap().map_get_or_else(merged, only_a, Some(MISS)).unwrap();
        assert_eq!(m.heap().number_value(found), Some(10.0));
        // the merge result contains all of b
        assert!(m.heap().map_subset_of(merged, b));
    }

    #[test]
    fn test_subset_of_compares_values_too() {
        let mut m = machine();
        let sup = m.map_with_capacity(8).unwrap();
        let key = string_key(&mut m, "k");
        let one = m.number(1.0).unwrap();
        let sup = m.map_put(sup, key, Some(one)).unwrap();

        let sub = m.map_with_capacity(4).unwrap();
        let one_again = m.number(1.0).unwrap();
        let matching = m.map_put(sub, key, Some(one_again)).unwrap();
        assert!(m.heap().map_subset_of(sup, matching));

        let two = m.number(2.0).unwrap();
        let clashing = m.map_put(sub, key, Some(two)).unwrap();
        assert!(!m.heap().map_subset_of(sup, clashing));
    }

    #[test]
    fn test_map_equality_ignores_capacity() {
        let mut m = machine();
        let narrow = m.map_with_capacity(4).unwrap();
        let wide = m.map_with_capacity(64).unwrap();
        let key = string_key(&mut m, "k");
        let one = m.number(1.0).unwrap();
        let narrow = m.map_put(narrow, key, Some(one)).unwrap();
        let one_again = m.number(1.0).unwrap();
        let wide = m.map_put(wide, key, Some(one_again)).unwrap();
        assert!(m.heap().equals(Some(narrow), Some(wide)));
        assert_eq!(m.heap().hash(Some(narrow)), m.heap().hash(Some(wide)));
    }

    #[test]
    fn test_absent_value_binding_differs_from_miss() {
        let mut m = machine();
        let map = m.map_with_capacity(8).unwrap();
        let key = string_key(&mut m, "nil-bound");
        let map = m.map_put(map, key, None).unwrap();
        assert_eq!(m.heap().map_get_or_else(map, key, Some(MISS)), None);
        assert_eq!(m.heap().map_dims(map).1, 1);
    }
}
