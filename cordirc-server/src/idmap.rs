//! Bidirectional snowflake ↔ IRC name map.
//!
//! Entries live in one arena indexed two ways (by id, by case-folded name),
//! so the id→name and name→id directions can never disagree. Names are
//! unique under ASCII casemapping; a colliding proposal is disambiguated by
//! appending `_2`, `_3`, … until a free name is found.

use std::collections::HashMap;

use cordirc_platform::Snowflake;
use parking_lot::RwLock;

/// An `(id, name)` pair from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: Snowflake,
    pub name: String,
}

/// Outcome of [`IdMap::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    /// Name now bound to the id.
    pub name: String,
    /// The id's former name, when the insert renamed it.
    pub previous: Option<String>,
}

impl Insertion {
    /// `(old, new)` when this insertion changed an existing binding.
    pub fn renamed(&self) -> Option<(&str, &str)> {
        self.previous.as_deref().map(|old| (old, self.name.as_str()))
    }
}

struct Slot {
    id: Snowflake,
    name: String,
    /// Proposed name before disambiguation.
    base: String,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    by_id: HashMap<Snowflake, usize>,
    by_name: HashMap<String, usize>,
}

fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl Arena {
    fn name_of(&self, id: Snowflake) -> Option<&Slot> {
        self.by_id
            .get(&id)
            .and_then(|&idx| self.slots[idx].as_ref())
    }

    fn free_name(&self, base: &str, max_len: usize) -> String {
        let first = truncate(base, max_len);
        if !self.by_name.contains_key(&fold(first)) {
            return first.to_string();
        }
        let mut n: u64 = 2;
        loop {
            let suffix = format!("_{n}");
            let head = truncate(base, max_len.saturating_sub(suffix.len()));
            let candidate = format!("{head}{suffix}");
            if !self.by_name.contains_key(&fold(&candidate)) {
                return candidate;
            }
            n += 1;
        }
    }

    fn bind(&mut self, id: Snowflake, base: &str, max_len: usize) -> String {
        let name = self.free_name(base, max_len);
        let slot = Slot {
            id,
            name: name.clone(),
            base: base.to_string(),
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, idx);
        self.by_name.insert(fold(&name), idx);
        name
    }

    fn unbind(&mut self, id: Snowflake) -> Option<Slot> {
        let idx = self.by_id.remove(&id)?;
        let slot = self.slots[idx].take()?;
        self.by_name.remove(&fold(&slot.name));
        self.free.push(idx);
        Some(slot)
    }
}

pub struct IdMap {
    max_len: usize,
    inner: RwLock<Arena>,
}

impl IdMap {
    /// A map whose names never exceed `max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(4),
            inner: RwLock::new(Arena::default()),
        }
    }

    /// Bind `id` to `proposed` (or a disambiguated variant of it).
    ///
    /// Re-inserting a present id with the same proposal keeps its current
    /// name. A different proposal releases the old name before choosing the
    /// new one and reports the old name in [`Insertion::previous`].
    pub fn insert(&self, id: Snowflake, proposed: &str) -> Insertion {
        let mut arena = self.inner.write();
        if let Some(slot) = arena.name_of(id)
            && slot.base == proposed
        {
            return Insertion {
                name: slot.name.clone(),
                previous: None,
            };
        }
        let old = arena.unbind(id).map(|slot| slot.name);
        let name = arena.bind(id, proposed, self.max_len);
        let previous = old.filter(|old| *old != name);
        Insertion { name, previous }
    }

    /// Drop the binding for `id`, returning the name it had.
    pub fn remove(&self, id: Snowflake) -> Option<String> {
        self.inner.write().unbind(id).map(|slot| slot.name)
    }

    /// Case-insensitive lookup.
    pub fn resolve_to_id(&self, name: &str) -> Option<Snowflake> {
        let arena = self.inner.read();
        let idx = *arena.by_name.get(&fold(name))?;
        arena.slots[idx].as_ref().map(|slot| slot.id)
    }

    pub fn resolve_to_name(&self, id: Snowflake) -> Option<String> {
        self.inner.read().name_of(id).map(|slot| slot.name.clone())
    }

    /// Copy of every binding, ordered by name.
    pub fn all_entries(&self) -> Vec<Entry> {
        let arena = self.inner.read();
        let mut entries: Vec<Entry> = arena
            .slots
            .iter()
            .flatten()
            .map(|slot| Entry {
                id: slot.id,
                name: slot.name.clone(),
            })
            .collect();
        drop(arena);
        entries.sort_by(|a, b| fold(&a.name).cmp(&fold(&b.name)));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
