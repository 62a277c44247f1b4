//! Common definitions that are shared between different parts of the compiler.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Interned identifiers: function, global, and label names.
///
/// Interning keeps every symbol-table lookup a pointer comparison instead of
/// a string compare, which matters once a module's labels are walked twice
/// (once per assembler pass) per function.
pub type Id = internment::Intern<String>;
