//! `KEY=value` payload line parser.
//!
//! User-info and biometric-template uploads arrive as single lines of
//! tab-separated `KEY=value` tokens, optionally prefixed with a category
//! word (`USER PIN=1\tName=...`, `FP PIN=1\tFID=0\tTMP=...`). Firmware
//! revisions disagree on key spellings, so a small synonym set is folded
//! onto one canonical key; everything else is preserved verbatim.

/// One parsed `KEY=value` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvRecord {
    /// Leading category word, if the first token carried one (`USER`, `FP`).
    pub category: Option<String>,
    fields: Vec<(String, String)>,
}

impl KvRecord {
    /// Look up a field by key, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All fields in wire order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fold firmware key synonyms onto one canonical spelling.
///
/// `USERID` is the same field as `PIN`; `USERNAME`/`USER_NAME` are the
/// same field as `NAME`. Unknown keys pass through untouched.
fn canonical_key(key: &str) -> String {
    if key.eq_ignore_ascii_case("USERID") {
        "PIN".to_string()
    } else if key.eq_ignore_ascii_case("USERNAME") || key.eq_ignore_ascii_case("USER_NAME") {
        "NAME".to_string()
    } else {
        key.to_string()
    }
}

/// Parse one tab-separated `KEY=value` line.
///
/// Tokens without an `=` are ignored, except a bare leading word which is
/// treated as the record category. Never fails; a garbage line yields an
/// empty record.
pub fn parse_kv_line(line: &str) -> KvRecord {
    let mut record = KvRecord::default();

    for (index, token) in line.trim_end_matches(['\r', '\n']).split('\t').enumerate() {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        // First token may be "USER PIN=1": a category word glued to the
        // first field with a space.
        let token = if index == 0
            && let Some((word, rest)) = token.split_once(' ')
            && !word.contains('=')
            && rest.contains('=')
        {
            record.category = Some(word.to_string());
            rest.trim()
        } else {
            token
        };

        if let Some((key, value)) = token.split_once('=') {
            record
                .fields
                .push((canonical_key(key.trim()), value.to_string()));
        } else if index == 0 && record.category.is_none() {
            record.category = Some(token.to_string());
        }
    }

    record
}
