//! Capability context supplied by the outer snapshot assembler.
//!
//! Instruction strategies reach snapshot-wide state (the constant table,
//! import table, global slots, short-call table, and other functions'
//! addresses) only through [`ModuleCx`]. This keeps per-function layout
//! self-contained and makes the single-writer discipline on the shared
//! tables explicit: [`SnapshotTables`] guards each table with its own lock,
//! so interning from one function's emission never races another table's
//! readers.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::EncodeError;
use crate::future::Future;
use crate::il::Literal;
use crate::isa::SHORT_CALL_CAPACITY;

/// Capabilities an instruction strategy may use while planning.
pub trait ModuleCx {
    /// The callee's future address in the final image. Resolved by the
    /// assembler once the callee's own layout completes.
    fn function_address(&self, callee: &str) -> Future<i64>;

    /// Acquires (or reuses) a short-call table slot for `callee` with the
    /// given argument count. Returns `None` when the fixed-capacity table is
    /// full; the caller falls back to the long call form.
    fn short_call_slot(&self, callee: &str, arg_count: u8) -> Option<u8>;

    /// Slot index of a global variable, assigned on first use.
    fn global_slot(&self, name: &str) -> Result<u16, EncodeError>;

    /// Index of a host import, assigned on first use.
    fn import_index(&self, name: &str) -> Result<u8, EncodeError>;

    /// Future offset of a constant-table entry for a literal that has no
    /// packed inline form.
    fn intern_constant(&self, lit: &Literal) -> Future<i64>;
}

/// Concrete snapshot-wide tables.
///
/// Each table sits behind its own mutex; a function's emission may intern a
/// string or acquire a short-call slot as a side effect without coordinating
/// with anything else.
#[derive(Default)]
pub struct SnapshotTables {
    functions: Mutex<FxHashMap<String, Future<i64>>>,
    short_calls: Mutex<Vec<(String, u8)>>,
    globals: Mutex<FxHashMap<String, u16>>,
    imports: Mutex<Vec<String>>,
    constants: Mutex<Vec<(Literal, Future<i64>)>>,
}

impl SnapshotTables {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a function's image address once its layout has completed.
    /// Every placeholder written through
    /// [`function_address`](ModuleCx::function_address) updates in place at
    /// the next materialization.
    pub fn set_function_address(&self, name: &str, address: i64) {
        self.functions
            .lock()
            .entry(name.to_string())
            .or_insert_with(Future::new)
            .resolve(address);
    }

    /// The short-call table in slot order.
    pub fn short_calls(&self) -> Vec<(String, u8)> {
        self.short_calls.lock().clone()
    }

    /// Interned constants in table order, with their address cells, for the
    /// assembler to lay out and resolve.
    pub fn constants(&self) -> Vec<(Literal, Future<i64>)> {
        self.constants.lock().clone()
    }

    /// Imports in index order.
    pub fn imports(&self) -> Vec<String> {
        self.imports.lock().clone()
    }
}

impl ModuleCx for SnapshotTables {
    fn function_address(&self, callee: &str) -> Future<i64> {
        self.functions
            .lock()
            .entry(callee.to_string())
            .or_insert_with(Future::new)
            .clone()
    }

    fn short_call_slot(&self, callee: &str, arg_count: u8) -> Option<u8> {
        let mut table = self.short_calls.lock();
        if let Some(slot) = table
            .iter()
            .position(|(name, argc)| name == callee && *argc == arg_count)
        {
            return Some(slot as u8);
        }
        if table.len() >= SHORT_CALL_CAPACITY {
            return None;
        }
        table.push((callee.to_string(), arg_count));
        Some((table.len() - 1) as u8)
    }

    fn global_slot(&self, name: &str) -> Result<u16, EncodeError> {
        let mut globals = self.globals.lock();
        if let Some(slot) = globals.get(name) {
            return Ok(*slot);
        }
        let next = globals.len();
        if next > u16::MAX as usize {
            return Err(EncodeError::CapacityExceeded {
                what: "global slot table",
                value: next as i64,
                max: u16::MAX as i64,
            });
        }
        let slot = next as u16;
        globals.insert(name.to_string(), slot);
        Ok(slot)
    }

    fn import_index(&self, name: &str) -> Result<u8, EncodeError> {
        let mut imports = self.imports.lock();
        if let Some(index) = imports.iter().position(|n| n == name) {
            return Ok(index as u8);
        }
        if imports.len() > u8::MAX as usize {
            return Err(EncodeError::CapacityExceeded {
                what: "import table",
                value: imports.len() as i64,
                max: u8::MAX as i64,
            });
        }
        imports.push(name.to_string());
        Ok((imports.len() - 1) as u8)
    }

    fn intern_constant(&self, lit: &Literal) -> Future<i64> {
        let mut constants = self.constants.lock();
        if let Some((_, future)) = constants.iter().find(|(l, _)| l == lit) {
            return future.clone();
        }
        let future = Future::new();
        constants.push((lit.clone(), future.clone()));
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_address_is_shared() {
        let tables = SnapshotTables::new();
        let a = tables.function_address("foo");
        tables.set_function_address("foo", 0x120);
        assert_eq!(a.get(), 0x120);
        assert_eq!(tables.function_address("foo").get(), 0x120);
    }

    #[test]
    fn test_short_call_slots_reuse_and_fill() {
        let tables = SnapshotTables::new();
        let a = tables.short_call_slot("f", 2).unwrap();
        assert_eq!(tables.short_call_slot("f", 2), Some(a));
        // a different arg count is a different slot
        assert_ne!(tables.short_call_slot("f", 3), Some(a));
        for i in 0..SHORT_CALL_CAPACITY {
            tables.short_call_slot(&format!("fill{}", i), 0);
        }
        assert_eq!(tables.short_call_slot("overflow", 0), None);
    }

    #[test]
    fn test_global_and_import_slots() {
        let tables = SnapshotTables::new();
        assert_eq!(tables.global_slot("x").unwrap(), 0);
        assert_eq!(tables.global_slot("y").unwrap(), 1);
        assert_eq!(tables.global_slot("x").unwrap(), 0);
        assert_eq!(tables.import_index("print").unwrap(), 0);
        assert_eq!(tables.import_index("print").unwrap(), 0);
    }

    #[test]
    fn test_intern_constant_dedupes() {
        let tables = SnapshotTables::new();
        let a = tables.intern_constant(&Literal::Str("hello".into()));
        let b = tables.intern_constant(&Literal::Str("hello".into()));
        a.resolve(0x44);
        assert_eq!(b.get(), 0x44);
        assert_eq!(tables.constants().len(), 1);
    }
}
