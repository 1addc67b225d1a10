// SPDX-License-Identifier: MIT
// Safe extraction of uploaded extension zips.

use std::path::Path;

use anyhow::{bail, Context as _, Result};

/// Unpack `zip_path` into `dest`.
///
/// Every entry must normalize to a descendant of `dest`; absolute paths and
/// `..` escapes abort the whole extraction.
pub(crate) fn unzip(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_path)
        .with_context(|| format!("open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("read zip archive")?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).context("read zip entry")?;
        let Some(relative) = entry.enclosed_name() else {
            bail!("zip entry '{}' escapes the destination", entry.name());
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut out = std::fs::File::create(&target)
            .with_context(|| format!("create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("extract {}", entry.name()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use zip::write::SimpleFileOptions;

    fn options() -> SimpleFileOptions {
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored)
    }

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in entries {
            writer.start_file(*name, options()).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("ext.zip");
        write_zip(
            &zip_path,
            &[
                ("manifest.json", r#"{"manifest_version":3}"#),
                ("scripts/background.js", "console.log('hi')"),
            ],
        );

        let dest = dir.path().join("out");
        unzip(&zip_path, &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("manifest.json")).unwrap(),
            r#"{"manifest_version":3}"#
        );
        assert!(dest.join("scripts/background.js").is_file());
    }

    #[test]
    fn rejects_parent_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");
        write_zip(&zip_path, &[("../evil.txt", "boom")]);

        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        let err = unzip(&zip_path, &dest).unwrap_err();
        assert!(err.to_string().contains("escapes"));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn rejects_corrupt_archives() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("junk.zip");
        std::fs::write(&zip_path, b"this is not a zip").unwrap();
        assert!(unzip(&zip_path, &dir.path().join("out")).is_err());
    }
}
