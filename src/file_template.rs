//! Purpose: Resolve the dump file path from a `${host}`/`${port}`/`${db}` template.
//! Exports: `DEFAULT_DUMP_FILE`, `expand_dump_path`.
//! Role: Keep dump and restore default file naming aligned from one source.
//! Invariants: Unknown `${...}` placeholders are left untouched.

use std::path::PathBuf;

pub(crate) const DEFAULT_DUMP_FILE: &str = "./redump-${host}-${port}-${db}.dump";

pub(crate) fn expand_dump_path(template: &str, host: &str, port: u16, db: u8) -> PathBuf {
    let expanded = template
        .replace("${host}", host)
        .replace("${port}", &port.to_string())
        .replace("${db}", &db.to_string());
    PathBuf::from(expanded)
}
