//! Property-based tests for the structural analyzer using proptest.
//!
//! Documents are generated from a small alphabet of LaTeX fragments chosen to
//! collide with each other: environments, braces, math delimiters, escapes,
//! comments, raw regions, reference commands and truncated control sequences.
//! The tests validate that:
//!
//! - Analysis is deterministic and defects come out position-ordered
//! - One repair pass leaves only defects the engine never fixes
//! - Repairing a repaired document changes nothing
//! - Edits never shift each other and only ever add text
