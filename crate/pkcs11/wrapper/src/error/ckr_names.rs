//! Symbolic names for PKCS#11 status codes.
//!
//! The table ships as an embedded `code=name` properties file and is parsed
//! on first use only. When the table cannot be produced, codes render as
//! fixed-width hexadecimal.

use std::collections::HashMap;

use cosmian_logger::warn;
use once_cell::sync::OnceCell;
use pkcs11_sys::CK_RV;

pub(crate) type CodeNames = HashMap<CK_RV, &'static str>;

static CKR_PROPERTIES: &str = include_str!("ckr.properties");

static CKR_NAMES: OnceCell<Option<CodeNames>> = OnceCell::new();

fn parse_line(line: &'static str) -> Option<(CK_RV, &'static str)> {
    let (code, name) = line.split_once('=')?;
    let digits = code.trim().trim_start_matches("0x").trim_start_matches("0X");
    let code = CK_RV::from_str_radix(digits, 16).ok()?;
    let name = name.trim();
    (!name.is_empty()).then_some((code, name))
}

/// Parse a `0x...=NAME` properties source.
/// Blank lines and `#` comments are skipped; malformed lines are skipped
/// with a warning.
pub(crate) fn load_table(source: &'static str) -> Option<CodeNames> {
    let mut table = CodeNames::new();
    for (number, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some((code, name)) => {
                table.insert(code, name);
            }
            None => warn!("status code name table, line {}: malformed entry {line:?}", number + 1),
        }
    }
    if table.is_empty() {
        warn!("status code name table is empty, codes will render as hexadecimal");
        None
    } else {
        Some(table)
    }
}

/// The table held by `cell`, loaded on first use.
fn cached<F>(cell: &OnceCell<Option<CodeNames>>, load: F) -> Option<&CodeNames>
where
    F: FnOnce() -> Option<CodeNames>,
{
    cell.get_or_init(load).as_ref()
}

fn names() -> Option<&'static CodeNames> {
    cached(&CKR_NAMES, || load_table(CKR_PROPERTIES))
}

pub(crate) fn render_with(table: Option<&CodeNames>, code: CK_RV) -> String {
    table
        .and_then(|t| t.get(&code))
        .map_or_else(|| format!("0x{code:08X}"), |name| (*name).to_owned())
}

/// The symbolic `CKR_*` name of a status code, if the code is known.
#[must_use]
pub fn ckr_name(code: CK_RV) -> Option<&'static str> {
    names().and_then(|t| t.get(&code)).copied()
}

/// The symbolic name of a status code, or its `0x%08X` rendering.
#[must_use]
pub fn render_status(code: CK_RV) -> String {
    render_with(names(), code)
}
