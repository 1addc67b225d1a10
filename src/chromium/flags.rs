// SPDX-License-Identifier: MIT
// chromium/flags — runtime launch-flag overlay.
//
// The browser is launched with a base flag set (environment) plus a runtime
// overlay persisted as JSON (`{"flags": [...]}`). Extension uploads rewrite
// the overlay; the launcher merges base and overlay at start. Both sides use
// the merge below.
//
// Merge semantics for the three extension-related groupings:
//   1. `--load-extension` / `--disable-extensions-except` CSV lists are
//      unioned, first occurrence wins.
//   2. An overlay `--disable-extensions` overrides everything extension
//      related.
//   3. A base `--disable-extensions` survives only when the overlay loads
//      no extensions.
// All other tokens are concatenated base-then-overlay and deduplicated
// preserving first occurrence.

use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

const LOAD_EXTENSION: &str = "--load-extension=";
const DISABLE_EXCEPT: &str = "--disable-extensions-except=";
const DISABLE_ALL: &str = "--disable-extensions";

/// On-disk shape of the overlay file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FlagsFile {
    pub flags: Vec<String>,
}

/// Split a space-delimited flag string into tokens. Quotes are not
/// supported; this mirrors the shell word-splitting the launcher always had.
pub fn parse_flags(input: &str) -> Vec<String> {
    input.split_whitespace().map(str::to_string).collect()
}

fn append_csv_into(dst: &mut Vec<String>, csv: &str) {
    for part in csv.split(',') {
        let part = part.trim();
        if !part.is_empty() {
            dst.push(part.to_string());
        }
    }
}

/// One side of a merge, with the extension-related tokens pulled out.
#[derive(Debug, Default)]
struct TokenStream {
    non_ext: Vec<String>,
    load: Vec<String>,
    except: Vec<String>,
    disable_all: bool,
}

fn parse_token_stream(tokens: &[String]) -> TokenStream {
    let mut stream = TokenStream::default();
    for token in tokens {
        if let Some(csv) = token.strip_prefix(LOAD_EXTENSION) {
            append_csv_into(&mut stream.load, csv);
        } else if let Some(csv) = token.strip_prefix(DISABLE_EXCEPT) {
            append_csv_into(&mut stream.except, csv);
        } else if token == DISABLE_ALL {
            stream.disable_all = true;
        } else {
            stream.non_ext.push(token.clone());
        }
    }
    stream
}

/// Union of two lists, duplicates and empties removed, first seen wins.
fn union(base: &[String], overlay: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    base.iter()
        .chain(overlay.iter())
        .filter(|value| !value.is_empty())
        .filter(|value| seen.insert(value.as_str().to_string()))
        .cloned()
        .collect()
}

/// Merge `overlay` tokens over `base` tokens.
pub fn merge_flags(base: &[String], overlay: &[String]) -> Vec<String> {
    let base = parse_token_stream(base);
    let overlay = parse_token_stream(overlay);

    let merged_load = union(&base.load, &overlay.load);
    let merged_except = union(&base.except, &overlay.except);

    let mut ext_flags: Vec<String> = Vec::new();
    if overlay.disable_all {
        ext_flags.push(DISABLE_ALL.to_string());
    } else {
        if base.disable_all && overlay.load.is_empty() {
            ext_flags.push(DISABLE_ALL.to_string());
        } else if !merged_load.is_empty() {
            ext_flags.push(format!("{LOAD_EXTENSION}{}", merged_load.join(",")));
        }
        if !merged_except.is_empty() {
            ext_flags.push(format!("{DISABLE_EXCEPT}{}", merged_except.join(",")));
        }
    }

    let mut combined = base.non_ext;
    combined.extend(overlay.non_ext);
    combined.extend(ext_flags);

    let mut seen = std::collections::HashSet::new();
    combined
        .into_iter()
        .filter(|token| !token.is_empty())
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

/// Read the overlay file. A missing file is an empty overlay; anything that
/// is not the JSON shape is an error (plain-text overlays are long gone).
pub fn read_overlay(path: &Path) -> Result<Vec<String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let file: FlagsFile =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(file
        .flags
        .iter()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect())
}

/// Write the overlay file, trimming tokens and dropping empties so a
/// read-back yields the same sequence.
pub fn write_overlay(path: &Path, tokens: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let file = FlagsFile {
        flags: tokens
            .iter()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect(),
    };
    let raw = serde_json::to_string(&file)?;
    std::fs::write(path, raw).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(base: &str, overlay: &str) -> Vec<String> {
        merge_flags(&parse_flags(base), &parse_flags(overlay))
    }

    #[test]
    fn parse_flags_splits_on_whitespace() {
        assert!(parse_flags("").is_empty());
        assert!(parse_flags("   ").is_empty());
        assert_eq!(
            parse_flags("  --foo --bar=1\t--baz  "),
            vec!["--foo", "--bar=1", "--baz"]
        );
        // Quotes are not honoured; simple word splitting only.
        assert_eq!(parse_flags(r#"--flag="with space" --qux"#).len(), 3);
    }

    #[test]
    fn csv_values_are_trimmed_and_filtered() {
        let mut dst = Vec::new();
        append_csv_into(&mut dst, "a,, b , c,");
        assert_eq!(dst, vec!["a", "b", "c"]);
    }

    #[test]
    fn token_stream_buckets() {
        let tokens = parse_flags(
            "--load-extension=/e1,/e2 --disable-extensions-except=/x1 --other=1 --disable-extensions",
        );
        let stream = parse_token_stream(&tokens);
        assert_eq!(stream.load, vec!["/e1", "/e2"]);
        assert_eq!(stream.except, vec!["/x1"]);
        assert!(stream.disable_all);
        assert_eq!(stream.non_ext, vec!["--other=1"]);
    }

    #[test]
    fn union_dedups_preserving_first() {
        let base: Vec<String> = vec!["a", "b", "a", ""].into_iter().map(String::from).collect();
        let overlay: Vec<String> = vec!["b", "c", "", "a"].into_iter().map(String::from).collect();
        assert_eq!(union(&base, &overlay), vec!["a", "b", "c"]);
    }

    #[test]
    fn merge_table() {
        let cases = [
            ("", "", ""),
            ("--foo --bar=1", "", "--foo --bar=1"),
            ("", "--foo --bar=1", "--foo --bar=1"),
            ("--foo --bar=1", "--baz --qux=2", "--foo --bar=1 --baz --qux=2"),
            ("--foo --bar=1", "--foo --baz", "--foo --bar=1 --baz"),
            (
                "--load-extension=/e1",
                "--load-extension=/e2",
                "--load-extension=/e1,/e2",
            ),
            (
                "--disable-extensions-except=/x1",
                "--disable-extensions-except=/x2",
                "--disable-extensions-except=/x1,/x2",
            ),
            (
                "--load-extension=/e1 --disable-extensions-except=/x1",
                "--disable-extensions",
                "--disable-extensions",
            ),
            (
                "--disable-extensions",
                "--load-extension=/e1",
                "--load-extension=/e1",
            ),
            (
                "--disable-extensions --other=1",
                "--foo",
                "--other=1 --foo --disable-extensions",
            ),
            (
                "--foo --load-extension=/e1 --disable-extensions-except=/x1",
                "--bar --load-extension=/e2 --disable-extensions-except=/x2",
                "--foo --bar --load-extension=/e1,/e2 --disable-extensions-except=/x1,/x2",
            ),
        ];
        for (base, overlay, want) in cases {
            assert_eq!(
                merge(base, overlay),
                parse_flags(want),
                "base={base:?} overlay={overlay:?}"
            );
        }
    }

    #[test]
    fn merge_with_empty_overlay_is_identity() {
        for existing in [
            "--foo --bar=1",
            "--disable-extensions",
            "--load-extension=/e1 --disable-extensions-except=/x1",
            "--foo --load-extension=/e1",
        ] {
            assert_eq!(merge(existing, ""), parse_flags(existing), "{existing:?}");
        }
    }

    #[test]
    fn overlay_disable_wins_exclusively() {
        let merged = merge(
            "--foo --load-extension=/e1 --disable-extensions-except=/x1",
            "--disable-extensions",
        );
        assert!(merged.contains(&"--disable-extensions".to_string()));
        assert!(!merged.iter().any(|t| t.starts_with("--load-extension=")));
        assert!(!merged
            .iter()
            .any(|t| t.starts_with("--disable-extensions-except=")));
    }

    #[test]
    fn missing_overlay_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_overlay(&dir.path().join("not-there")).unwrap().is_empty());
    }

    #[test]
    fn plain_text_overlay_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags");
        std::fs::write(&path, "--foo\n--bar=1").unwrap();
        assert!(read_overlay(&path).is_err());
    }

    #[test]
    fn overlay_roundtrip_drops_blank_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags");

        let tokens: Vec<String> = vec![" --a ", "", "--b=1"].into_iter().map(String::from).collect();
        write_overlay(&path, &tokens).unwrap();
        assert_eq!(read_overlay(&path).unwrap(), vec!["--a", "--b=1"]);

        // The file itself holds the canonical JSON shape.
        let raw = std::fs::read_to_string(&path).unwrap();
        let file: FlagsFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(file.flags, vec!["--a", "--b=1"]);
    }

    #[test]
    fn json_overlay_skips_blank_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags");
        std::fs::write(&path, r#"{"flags":["--one","--two=2","  ","--three"]}"#).unwrap();
        assert_eq!(
            read_overlay(&path).unwrap(),
            vec!["--one", "--two=2", "--three"]
        );
    }
}
