//! Reference-counted object arena.
//!
//! Every heap object lives in a slot of [`Heap`]. An [`ObjRef`] names a slot
//! plus the generation it was allocated in, so a handle that outlives its
//! object is detected instead of silently aliasing whatever reuses the slot.
//!
//! Counting contract:
//!
//! - [`Heap::alloc`] creates an entry with a count of zero;
//! - every store of a handle (operand stack, global, local slot, constant
//!   pool) is paired with one [`Heap::retain`];
//! - every pop or overwrite of such a store is paired with one
//!   [`Heap::release`];
//! - the entry is freed exactly once, by the release that brings its count
//!   back to zero.
//!
//! Objects never point at other objects (runnables refer to compiled code by
//! id), so no reference cycle can form; anything still allocated when the
//! owner is done is reclaimed by [`Heap::sweep`].

use thiserror::Error;

use crate::bytecode::chunk::FunctionId;
use crate::lang::value::Value;

/// Index into the native dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    String(String),
    Runnable { function: FunctionId, name: String },
    Native { id: NativeId, name: &'static str },
}

impl Object {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::String(_) => "STRING",
            Object::Runnable { .. } => "RUNNABLE",
            Object::Native { .. } => "NATIVE",
        }
    }
}

impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Object::String(s) => write!(f, "{}", s),
            Object::Runnable { name, .. } => write!(f, "<Runnable '{}'>", name),
            Object::Native { name, .. } => write!(f, "<Native runnable '{}'>", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("stale object handle (slot {index}, generation {generation})")]
    Stale { index: u32, generation: u32 },

    #[error("release of an object nobody holds (slot {0})")]
    Unheld(u32),
}

/// Running totals, for asserting the counting contract.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub allocations: usize,
    pub retains: usize,
    pub releases: usize,
    pub frees: usize,
    /// Objects reclaimed by [`Heap::sweep`] rather than by a release.
    pub swept: usize,
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    live: Option<Live>,
}

#[derive(Debug)]
struct Live {
    refs: usize,
    object: Object,
}

#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<Entry>,
    free: Vec<u32>,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.stats.allocations += 1;
        let live = Some(Live { refs: 0, object });
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.live = live;
                ObjRef {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    live,
                });
                ObjRef {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn live_mut(&mut self, r: ObjRef) -> Result<&mut Live, HeapError> {
        self.entries
            .get_mut(r.index as usize)
            .filter(|e| e.generation == r.generation)
            .and_then(|e| e.live.as_mut())
            .ok_or(HeapError::Stale {
                index: r.index,
                generation: r.generation,
            })
    }

    pub fn get(&self, r: ObjRef) -> Result<&Object, HeapError> {
        self.entries
            .get(r.index as usize)
            .filter(|e| e.generation == r.generation)
            .and_then(|e| e.live.as_ref())
            .map(|l| &l.object)
            .ok_or(HeapError::Stale {
                index: r.index,
                generation: r.generation,
            })
    }

    pub fn retain(&mut self, r: ObjRef) -> Result<(), HeapError> {
        self.live_mut(r)?.refs += 1;
        self.stats.retains += 1;
        Ok(())
    }

    /// Drop one reference. Returns true when this release freed the object.
    pub fn release(&mut self, r: ObjRef) -> Result<bool, HeapError> {
        let live = self.live_mut(r)?;
        if live.refs == 0 {
            return Err(HeapError::Unheld(r.index));
        }
        live.refs -= 1;
        let remaining = live.refs;
        self.stats.releases += 1;
        if remaining > 0 {
            return Ok(false);
        }

        let entry = &mut self.entries[r.index as usize];
        entry.live = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(r.index);
        self.stats.frees += 1;
        Ok(true)
    }

    pub fn retain_value(&mut self, value: Value) -> Result<(), HeapError> {
        match value {
            Value::Object(r) => self.retain(r),
            _ => Ok(()),
        }
    }

    pub fn release_value(&mut self, value: Value) -> Result<(), HeapError> {
        match value {
            Value::Object(r) => self.release(r).map(|_| ()),
            _ => Ok(()),
        }
    }

    pub fn ref_count(&self, r: ObjRef) -> Option<usize> {
        self.entries
            .get(r.index as usize)
            .filter(|e| e.generation == r.generation)
            .and_then(|e| e.live.as_ref())
            .map(|l| l.refs)
    }

    pub fn live_objects(&self) -> usize {
        self.entries.iter().filter(|e| e.live.is_some()).count()
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Reclaim every object still allocated. Returns how many were swept.
    pub fn sweep(&mut self) -> usize {
        let mut swept = 0;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.live.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u32);
                swept += 1;
            }
        }
        self.stats.swept += swept;
        swept
    }
}
