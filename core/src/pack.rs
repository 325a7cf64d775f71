use crate::archive::{self, EntryMeta, TarType};
use crate::category::{Category, PathMapper};
use crate::codec::{self, WriteOptions};
use crate::kdf::DEFAULT_ROUNDS;
use crate::manifest::{MANIFEST_MODE, ManifestRecord, PackageInfo};
use crate::secret::Password;
use crate::split::SplitReader;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackOptions {
    /// Platform API level the archive targets; selects the header version.
    pub api_level: u32,
    pub compress: bool,
    pub rounds: u32,
    /// Compression of the stored segment sets being read.
    pub tar_type: TarType,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            api_level: 34,
            compress: true,
            rounds: DEFAULT_ROUNDS,
            tar_type: TarType::Gzip,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub entries: usize,
    pub bytes: u64,
    pub per_category: BTreeMap<Category, usize>,
}

/// Builds a single `.ab` archive for one package out of its stored
/// per-category segment sets.
pub struct BackupPacker {
    package: PackageInfo,
    installer: Option<String>,
    options: PackOptions,
    mapper: PathMapper,
}

impl BackupPacker {
    pub fn new(package: PackageInfo, installer: Option<String>, options: PackOptions) -> Self {
        let mapper = PathMapper::new(&package.package_name);
        Self {
            package,
            installer,
            options,
            mapper,
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package.package_name
    }

    /// Packs into `dest`. The file only appears once the archive is complete.
    pub fn pack<P: AsRef<Path>>(
        &self,
        segments: &BTreeMap<Category, Vec<PathBuf>>,
        dest: P,
        password: Option<&Password>,
    ) -> Result<PackSummary> {
        let dest = dest.as_ref();
        let summary = codec::write_atomically(dest, |file| {
            let (out, summary) = self.write_to(segments, BufWriter::new(file), password)?;
            out.into_inner().map_err(|e| e.into_error())?;
            Ok(summary)
        })?;
        info!(
            "Packed {} entries of {} into {}",
            summary.entries,
            self.package.package_name,
            dest.display()
        );
        Ok(summary)
    }

    /// Streams the archive into `out` and hands it back once finished.
    pub fn write_to<W: Write>(
        &self,
        segments: &BTreeMap<Category, Vec<PathBuf>>,
        out: W,
        password: Option<&Password>,
    ) -> Result<(W, PackSummary)> {
        if segments.contains_key(&Category::Unknown) {
            return Err(Error::InvalidCategory(Category::Unknown));
        }
        let write_options = WriteOptions {
            rounds: self.options.rounds,
            compress: self.options.compress,
            ..WriteOptions::for_api_level(self.options.api_level)?
        };

        let writer = codec::wrap(out, &write_options, password)?;
        let mut builder = tar::Builder::new(writer);
        let apk_included = segments
            .get(&Category::Source)
            .is_some_and(|files| !files.is_empty());
        self.append_manifest(&mut builder, apk_included)?;

        let mut summary = PackSummary::default();
        for (&category, files) in segments {
            if files.is_empty() {
                continue;
            }
            self.append_category(&mut builder, category, files, &mut summary)?;
        }

        let writer = builder.into_inner()?;
        Ok((writer.finish()?, summary))
    }

    fn append_manifest<W: Write>(&self, builder: &mut tar::Builder<W>, apk_included: bool) -> Result<()> {
        let manifest = ManifestRecord::new(
            &self.package,
            self.options.api_level,
            self.installer.as_deref(),
            apk_included,
        );
        let content = manifest.to_bytes();
        let meta = EntryMeta::regular(content.len() as u64, MANIFEST_MODE, 0);
        archive::append_entry(builder, &self.mapper.manifest_path(), &meta, &content[..])?;
        Ok(())
    }

    fn append_category<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        category: Category,
        files: &[PathBuf],
        summary: &mut PackSummary,
    ) -> Result<()> {
        debug!("Reading {} segment(s) for category {}", files.len(), category);
        let input = BufReader::new(SplitReader::new(files.to_vec()));
        let mut source = tar::Archive::new(self.options.tar_type.decompressor(input));
        let mut count = 0;
        for entry in source.entries()? {
            let mut entry = entry?;
            let (path, meta) = EntryMeta::from_entry(&entry)?;
            let target = self.mapper.to_archive_path(category, &path)?;
            debug!("{} -> {}", path, target);
            archive::append_entry(builder, &target, &meta, &mut entry)?;
            summary.bytes += meta.size;
            count += 1;
        }
        summary.entries += count;
        *summary.per_category.entry(category).or_default() += count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::EntryKind;
    use std::io::{Cursor, Read};

    fn package() -> PackageInfo {
        PackageInfo {
            package_name: "org.example.app".to_string(),
            version_code: 7,
            signatures: vec![vec![0xde, 0xad]],
        }
    }

    fn options() -> PackOptions {
        PackOptions {
            rounds: 16,
            ..PackOptions::default()
        }
    }

    /// Writes a gzip tar segment with the given (path, content) entries;
    /// a `None` content makes a directory.
    fn segment(dir: &Path, name: &str, entries: &[(&str, Option<&str>)]) -> PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(TarType::Gzip.compressor(file));
        for (name, content) in entries {
            match content {
                Some(data) => {
                    let meta = EntryMeta::regular(data.len() as u64, 0o644, 1_600_000_000);
                    archive::append_entry(&mut builder, name, &meta, data.as_bytes()).unwrap();
                }
                None => {
                    let meta = EntryMeta {
                        kind: EntryKind::Directory,
                        ..EntryMeta::regular(0, 0o755, 1_600_000_000)
                    };
                    archive::append_entry(&mut builder, name, &meta, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn entries_of(archive: &[u8], password: Option<&Password>) -> Vec<(String, EntryMeta, Vec<u8>)> {
        let (_, reader) = codec::unwrap(Cursor::new(archive), password).unwrap();
        let mut tar = tar::Archive::new(reader);
        tar.entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let (path, meta) = EntryMeta::from_entry(&entry).unwrap();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (path, meta, data)
            })
            .collect()
    }

    #[test]
    fn test_manifest_first_then_categories() {
        let dir = tempfile::tempdir().unwrap();
        let src = segment(dir.path(), "source.tar.gz.0", &[("base.apk", Some("apk"))]);
        let ce = segment(
            dir.path(),
            "data0.tar.gz.0",
            &[("files/", None), ("files/a.txt", Some("a")), ("databases/x.db", Some("db"))],
        );
        let mut segments = BTreeMap::new();
        segments.insert(Category::InternalCe, vec![ce]);
        segments.insert(Category::Source, vec![src]);

        let packer = BackupPacker::new(package(), Some("com.android.vending".to_string()), options());
        let (archive, summary) = packer.write_to(&segments, Vec::new(), None).unwrap();

        let entries = entries_of(&archive, None);
        let names: Vec<_> = entries.iter().map(|(p, _, _)| p.as_str()).collect();
        assert_eq!(
            names,
            [
                "apps/org.example.app/_manifest",
                "apps/org.example.app/a/base.apk",
                "apps/org.example.app/r/files",
                "apps/org.example.app/f/a.txt",
                "apps/org.example.app/db/x.db",
            ]
        );
        assert_eq!(summary.entries, 4);
        assert_eq!(summary.per_category[&Category::InternalCe], 3);

        let (_, manifest_meta, manifest) = &entries[0];
        assert_eq!(manifest_meta.mode, 0o600);
        assert_eq!(manifest_meta.mtime, 0);
        let manifest = ManifestRecord::parse(manifest).unwrap();
        assert!(manifest.apk_included);
        assert_eq!(manifest.installer, "com.android.vending");
        assert_eq!(manifest.signatures, ["dead"]);

        assert_eq!(entries[2].1.kind, EntryKind::Directory);
        assert_eq!(entries[3].1.mode, 0o644);
        assert_eq!(entries[3].1.mtime, 1_600_000_000);
        assert_eq!(entries[3].2, b"a");
    }

    #[test]
    fn test_split_segments_are_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        let big = "7".repeat(5000);
        let whole = segment(dir.path(), "whole", &[("files/big", Some(big.as_str()))]);
        let bytes = std::fs::read(&whole).unwrap();
        let (a, b) = bytes.split_at(bytes.len() / 2);
        let parts = vec![dir.path().join("data0.tar.gz.0"), dir.path().join("data0.tar.gz.1")];
        std::fs::write(&parts[0], a).unwrap();
        std::fs::write(&parts[1], b).unwrap();

        let mut segments = BTreeMap::new();
        segments.insert(Category::InternalDe, parts);
        let packer = BackupPacker::new(package(), None, options());
        let (archive, _) = packer.write_to(&segments, Vec::new(), None).unwrap();

        let entries = entries_of(&archive, None);
        assert_eq!(entries[1].0, "apps/org.example.app/d_f/big");
        assert_eq!(entries[1].2, big.as_bytes());
        assert!(!ManifestRecord::parse(&entries[0].2).unwrap().apk_included);
    }

    #[test]
    fn test_unknown_category_rejected() {
        let mut segments = BTreeMap::new();
        segments.insert(Category::Unknown, vec![PathBuf::from("x")]);
        let packer = BackupPacker::new(package(), None, options());
        let err = packer.write_to(&segments, Vec::new(), None).unwrap_err();
        assert!(matches!(err, Error::InvalidCategory(Category::Unknown)));
    }

    #[test]
    fn test_missing_segment_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.ab");
        let mut segments = BTreeMap::new();
        segments.insert(Category::Obb, vec![dir.path().join("gone.0")]);
        let packer = BackupPacker::new(package(), None, options());

        assert!(packer.pack(&segments, &dest, None).is_err());
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_api_level_selects_version() {
        let packer = BackupPacker::new(
            package(),
            None,
            PackOptions {
                api_level: 23,
                ..options()
            },
        );
        let (archive, _) = packer.write_to(&BTreeMap::new(), Vec::new(), None).unwrap();
        assert!(archive.starts_with(b"ANDROID BACKUP\n3\n1\nnone\n"));

        let too_old = BackupPacker::new(
            package(),
            None,
            PackOptions {
                api_level: 13,
                ..options()
            },
        );
        assert!(too_old.write_to(&BTreeMap::new(), Vec::new(), None).is_err());
    }
}
