// The immutable dictionary value.
//
// Structs are content-addressed: two structs built from the same set of
// key/value pairs come out byte-identical no matter what order the
// pairs arrived in, and hash equal. The compiler leans on this for
// constant pooling (equal struct literals share a pool slot) and the
// emitted program leans on it for value semantics.
//
// Layout is fixed by Robin-Hood insertion with a normative tie-break:
// an incoming entry displaces an occupant when it has probed strictly
// further, or equally far with a smaller (hash, key). Insertion order
// can therefore never leak into the final slot arrangement.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::value::{mix, Value, PROTO_DEPTH_MAX};


#[derive(Debug, Clone)]
struct Kv {
    key: Value,
    value: Value,
}

impl Kv {
    fn empty() -> Kv {
        Kv {
            key: Value::Nil,
            value: Value::Nil,
        }
    }

    fn occupied(&self) -> bool {
        !matches!(self.key, Value::Nil)
    }
}


#[derive(Debug)]
pub struct Struct {
    slots: Box<[Kv]>,
    len: u32,
    hash: u32,
    proto: Option<Rc<Struct>>,
}


// Three-phase construction: begin with a declared pair count, put each
// pair, end to seal. Malformed puts (nil key, nil value, NaN key) and
// puts past the declared count drop silently; arity checking belongs to
// the surface-language constructor, not here.
#[derive(Debug)]
pub struct StructBuilder {
    slots: Vec<Kv>,
    target: u32,
    filled: u32,
    proto: Option<Rc<Struct>>,
}

impl StructBuilder {
    pub fn begin(count: usize) -> StructBuilder {
        StructBuilder {
            slots: vec![Kv::empty(); capacity_for(count)],
            target: count as u32,
            filled: 0,
            proto: None,
        }
    }

    pub fn proto(mut self, proto: Rc<Struct>) -> StructBuilder {
        self.proto = Some(proto);
        self
    }

    pub fn put(&mut self, key: Value, value: Value) {
        self.put_ext(key, value, true);
    }

    // `replace` false keeps the first binding on a duplicate key; used
    // when flattening a prototype chain into a child.
    pub fn put_ext(&mut self, key: Value, value: Value, replace: bool) {
        if matches!(key, Value::Nil) || matches!(value, Value::Nil) || key.is_nan() {
            return;
        }
        if self.filled >= self.target {
            return;
        }
        self.filled += 1;

        let cap = self.slots.len();
        let mut entry = Kv { key, value };
        let mut hash = entry.key.hash();
        let mut dist = 0usize;
        let mut i = hash as usize & (cap - 1);
        loop {
            let occupant = &mut self.slots[i];
            if !occupant.occupied() {
                *occupant = entry;
                return;
            }
            if occupant.key == entry.key {
                if replace {
                    occupant.value = entry.value;
                }
                return;
            }
            let occupant_hash = occupant.key.hash();
            let occupant_dist = probe_distance(occupant_hash, i, cap);
            if dist > occupant_dist
                || (dist == occupant_dist
                    && lexical_less(hash, &entry.key, occupant_hash, &occupant.key))
            {
                std::mem::swap(occupant, &mut entry);
                hash = occupant_hash;
                dist = occupant_dist;
            }
            i = (i + 1) & (cap - 1);
            dist += 1;
        }
    }

    pub fn end(self) -> Rc<Struct> {
        let occupied = self.slots.iter().filter(|kv| kv.occupied()).count() as u32;
        if occupied < self.target {
            // Duplicate keys collapsed; rebuild at the true size so
            // capacity stays a function of the logical length.
            let mut rebuilt = StructBuilder::begin(occupied as usize);
            rebuilt.proto = self.proto;
            for kv in self.slots {
                if kv.occupied() {
                    rebuilt.put(kv.key, kv.value);
                }
            }
            return rebuilt.end();
        }

        let mut hash: u32 = 0x811c_9dc5;
        for kv in self.slots.iter() {
            if kv.occupied() {
                hash = mix(hash, kv.key.hash());
                hash = mix(hash, kv.value.hash());
            }
        }
        if let Some(proto) = &self.proto {
            hash = hash.wrapping_mul(0x9e37_79b1) ^ proto.hash();
        }

        Rc::new(Struct {
            slots: self.slots.into_boxed_slice(),
            len: occupied,
            hash,
            proto: self.proto,
        })
    }
}


impl Struct {
    pub fn of(pairs: Vec<(Value, Value)>) -> Rc<Struct> {
        let mut builder = StructBuilder::begin(pairs.len());
        for (k, v) in pairs {
            builder.put(k, v);
        }
        builder.end()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn proto(&self) -> Option<&Rc<Struct>> {
        self.proto.as_ref()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.get_depth(key, 0)
    }

    fn get_depth(&self, key: &Value, depth: u32) -> Option<Value> {
        if let Some(value) = self.get_local(key) {
            return Some(value);
        }
        match &self.proto {
            Some(proto) if depth < PROTO_DEPTH_MAX => proto.get_depth(key, depth + 1),
            _ => None,
        }
    }

    fn get_local(&self, key: &Value) -> Option<Value> {
        if matches!(key, Value::Nil) || key.is_nan() || self.len == 0 {
            return None;
        }
        let cap = self.slots.len();
        let hash = key.hash();
        let mut i = hash as usize & (cap - 1);
        let mut dist = 0usize;
        loop {
            let occupant = &self.slots[i];
            if !occupant.occupied() {
                return None;
            }
            if &occupant.key == key {
                return Some(occupant.value.clone());
            }
            // Robin-Hood early exit: had the key been present it would
            // have displaced this closer-to-home occupant.
            if probe_distance(occupant.key.hash(), i, cap) < dist {
                return None;
            }
            i = (i + 1) & (cap - 1);
            dist += 1;
            if dist > cap {
                return None;
            }
        }
    }

    // Occupied slots, in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.slots
            .iter()
            .filter(|kv| kv.occupied())
            .map(|kv| (&kv.key, &kv.value))
    }

    pub fn compare(&self, other: &Struct) -> Ordering {
        let ord = self.len.cmp(&other.len);
        if ord != Ordering::Equal {
            return ord;
        }
        let ord = self.hash.cmp(&other.hash);
        if ord != Ordering::Equal {
            return ord;
        }
        for (a, b) in self.slots.iter().zip(other.slots.iter()) {
            let ord = a.key.compare(&b.key);
            if ord != Ordering::Equal {
                return ord;
            }
            let ord = a.value.compare(&b.value);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}


impl PartialEq for Struct {
    fn eq(&self, other: &Struct) -> bool {
        if self.slots.len() != other.slots.len()
            || self.len != other.len
            || self.hash != other.hash
        {
            return false;
        }
        let protos_equal = match (&self.proto, &other.proto) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if !protos_equal {
            return false;
        }
        self.slots
            .iter()
            .zip(other.slots.iter())
            .all(|(a, b)| a.key == b.key && a.value == b.value)
    }
}


// Next power of two at or above twice the pair count, with a clamp for
// absurd counts so the doubling cannot overflow.
fn capacity_for(count: usize) -> usize {
    if count > (1 << 30) {
        return 1 << 31;
    }
    (count * 2).next_power_of_two()
}

fn probe_distance(hash: u32, position: usize, cap: usize) -> usize {
    let ideal = hash as usize & (cap - 1);
    (position + cap - ideal) & (cap - 1)
}

// The normative swap tie-break: lexicographic on (hash, key).
fn lexical_less(hash_a: u32, key_a: &Value, hash_b: u32, key_b: &Value) -> bool {
    match hash_a.cmp(&hash_b) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => key_a.compare(key_b) == Ordering::Less,
    }
}
