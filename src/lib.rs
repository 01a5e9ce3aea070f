//! Workspace root package. Exists so git hooks install via cargo-husky;
//! all functionality lives in the `crates/` members.
