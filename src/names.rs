use crate::value::Value;

/// Open-addressed hash table with linear probing, keyed and valued by
/// arbitrary values. Backs both the context's name table and hashmap
/// values. Nil is the "missing" sentinel: binding a key to nil removes it,
/// lookup of an unbound key yields nil.
pub struct NameTable
{
    slots: Vec<Slot>,
    used: usize,
    fill: usize,
}

enum Slot
{
    Empty,
    Tombstone,
    Used
    {
        key: Value,
        value: Value,
    },
}

const INITIAL_CAPACITY: usize = 64;
const GROWTH_FACTOR: f64 = 1.62;

impl NameTable
{
    pub fn new() -> Self
    {
        let mut slots = Vec::with_capacity(INITIAL_CAPACITY);
        slots.resize_with(INITIAL_CAPACITY, || Slot::Empty);
        Self {
            slots,
            used: 0,
            fill: 0,
        }
    }

    pub fn len(&self) -> usize
    {
        self.used
    }

    pub fn is_empty(&self) -> bool
    {
        self.used == 0
    }

    pub fn put(&mut self, key: Value, value: Value)
    {
        if matches!(value, Value::Nil)
        {
            self.delete(&key);
            return;
        }
        if self.fill >= self.slots.len()
        {
            self.grow();
        }
        let capacity = self.slots.len();
        let mut idx = key.hash() as usize % capacity;
        let mut reuse: Option<usize> = None;
        for _ in 0..capacity
        {
            match &self.slots[idx]
            {
                Slot::Empty =>
                {
                    let target = match reuse
                    {
                        Some(t) => t,
                        None =>
                        {
                            self.fill += 1;
                            idx
                        }
                    };
                    self.slots[target] = Slot::Used { key, value };
                    self.used += 1;
                    return;
                }
                Slot::Tombstone =>
                {
                    if reuse.is_none()
                    {
                        reuse = Some(idx);
                    }
                }
                Slot::Used { key: existing, .. } =>
                {
                    if *existing == key
                    {
                        self.slots[idx] = Slot::Used { key, value };
                        return;
                    }
                }
            }
            idx = (idx + 1) % capacity;
        }
        if let Some(target) = reuse
        {
            self.slots[target] = Slot::Used { key, value };
            self.used += 1;
            return;
        }
        // Growth at full load keeps a free slot available; reaching this
        // point means the invariant is broken.
        panic!("name table full");
    }

    /// The bound value, or nil when the key is unbound.
    pub fn get(&self, key: &Value) -> Value
    {
        let capacity = self.slots.len();
        let mut idx = key.hash() as usize % capacity;
        for _ in 0..capacity
        {
            match &self.slots[idx]
            {
                Slot::Empty => return Value::Nil,
                Slot::Tombstone =>
                {}
                Slot::Used {
                    key: existing,
                    value,
                } =>
                {
                    if existing == key
                    {
                        return value.clone();
                    }
                }
            }
            idx = (idx + 1) % capacity;
        }
        Value::Nil
    }

    pub fn delete(&mut self, key: &Value)
    {
        let capacity = self.slots.len();
        let mut idx = key.hash() as usize % capacity;
        for _ in 0..capacity
        {
            match &self.slots[idx]
            {
                Slot::Empty => return,
                Slot::Tombstone =>
                {}
                Slot::Used { key: existing, .. } =>
                {
                    if existing == key
                    {
                        self.slots[idx] = Slot::Tombstone;
                        self.used -= 1;
                        return;
                    }
                }
            }
            idx = (idx + 1) % capacity;
        }
    }

    fn grow(&mut self)
    {
        let new_capacity = ((self.slots.len() as f64) * GROWTH_FACTOR) as usize;
        let mut slots = Vec::with_capacity(new_capacity);
        slots.resize_with(new_capacity, || Slot::Empty);
        let old = std::mem::replace(&mut self.slots, slots);
        self.used = 0;
        self.fill = 0;
        for slot in old
        {
            if let Slot::Used { key, value } = slot
            {
                self.reinsert(key, value);
            }
        }
    }

    // Insertion with the new modulus; the table was just sized to fit.
    fn reinsert(&mut self, key: Value, value: Value)
    {
        let capacity = self.slots.len();
        let mut idx = key.hash() as usize % capacity;
        loop
        {
            if matches!(self.slots[idx], Slot::Empty)
            {
                self.slots[idx] = Slot::Used { key, value };
                self.used += 1;
                self.fill += 1;
                return;
            }
            idx = (idx + 1) % capacity;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)>
    {
        self.slots.iter().filter_map(|slot| match slot
        {
            Slot::Used { key, value } => Some((key, value)),
            _ => None,
        })
    }

    pub fn structural_eq(&self, other: &NameTable) -> bool
    {
        if self.used != other.used
        {
            return false;
        }
        self.iter().all(|(key, value)| other.get(key) == *value)
    }

    pub fn deep_copy(&self) -> NameTable
    {
        let mut copy = NameTable::new();
        for (key, value) in self.iter()
        {
            copy.put(key.deep_copy(), value.deep_copy());
        }
        copy
    }
}

impl Default for NameTable
{
    fn default() -> Self
    {
        Self::new()
    }
}
