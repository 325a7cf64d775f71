use crate::archive::{self, EntryKind, EntryMeta, TarType};
use crate::category::{ArchivePath, Category, PathMapper, classify_relative};
use crate::codec;
use crate::header::BackupHeader;
use crate::manifest::ManifestRecord;
use crate::secret::Password;
use crate::split::{DEFAULT_SPLIT_SIZE, SplitWriter, sort_segments};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

// Manifests are a few hundred bytes; anything bigger is not one.
const MAX_MANIFEST_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackOptions {
    /// Compression of the segment sets written by [`ExtractedBackup::files`].
    pub tar_type: TarType,
    pub split_size: u64,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            tar_type: TarType::Gzip,
            split_size: DEFAULT_SPLIT_SIZE,
        }
    }
}

/// Name prefix of a stored segment set: `source.tar.gz` or `data<N>.tar.gz`.
pub fn segment_prefix(category: Category, data_index: usize, tar_type: TarType) -> String {
    match category {
        Category::Source => format!("source.tar.{}", tar_type.extension()),
        _ => format!("data{}.tar.{}", data_index, tar_type.extension()),
    }
}

/// Lexically normalizes a `/`-separated entry name: empty and `.` segments
/// are dropped and `..` cancels the previous segment where there is one.
/// Leading `..` segments of a relative path are kept so the caller can
/// reject them. `None` if nothing is left.
pub fn normalize(path: &str) -> Option<String> {
    if path.contains('\0') {
        return None;
    }
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                None if absolute => {}
                _ => parts.push(".."),
            },
            _ => parts.push(part),
        }
    }
    if parts.is_empty() {
        return absolute.then(|| "/".to_string());
    }
    let joined = parts.join("/");
    Some(if absolute { format!("/{}", joined) } else { joined })
}

/// One extracted entry waiting to be written into a segment set.
#[derive(Debug, Clone)]
pub struct StagedEntry {
    /// Where the entry was materialized inside the working directory.
    pub source: PathBuf,
    /// Storage-side path, e.g. `files/notes.txt`.
    pub internal_path: String,
    pub meta: EntryMeta,
}

/// Splits an `.ab` archive for one package into per-category entry lists.
pub struct BackupUnpacker {
    package: String,
    mapper: PathMapper,
    options: UnpackOptions,
}

impl BackupUnpacker {
    pub fn new(package: &str, options: UnpackOptions) -> Self {
        Self {
            package: package.to_string(),
            mapper: PathMapper::new(package),
            options,
        }
    }

    pub fn extract_file<P: AsRef<Path>>(
        &self,
        ab: P,
        work_root: &Path,
        password: Option<&Password>,
    ) -> Result<ExtractedBackup> {
        let input = BufReader::new(File::open(ab.as_ref())?);
        self.extract(input, work_root, password)
    }

    /// Extracts every entry into a fresh working directory under `work_root`.
    ///
    /// The directory is removed again when the returned value is dropped, or
    /// immediately if anything fails.
    pub fn extract<R: BufRead>(
        &self,
        input: R,
        work_root: &Path,
        password: Option<&Password>,
    ) -> Result<ExtractedBackup> {
        let (header, reader) = codec::unwrap(input, password)?;
        let workdir = tempfile::Builder::new()
            .prefix("abkit-extract-")
            .tempdir_in(work_root)?;
        let root = workdir.path().canonicalize()?;

        let mut manifest = None;
        let mut entries: BTreeMap<Category, Vec<StagedEntry>> = BTreeMap::new();
        let mut seen: HashMap<String, EntryKind> = HashMap::new();
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = archive::entry_path(&entry)?;
            let relative = self.validate(&name, &root)?;
            let (_, meta) = EntryMeta::from_entry(&entry)?;

            // A second entry at the same path could swap a staged file for a symlink.
            if let Some(previous) = seen.insert(relative.clone(), meta.kind) {
                if previous != EntryKind::Directory || meta.kind != EntryKind::Directory {
                    return Err(Error::Format(format!("Duplicate entry {}", name)));
                }
            }

            match classify_relative(&relative) {
                ArchivePath::Manifest => {
                    manifest = read_manifest(&mut entry)?;
                }
                ArchivePath::Data { category, internal_path } => {
                    let source = materialize(&root, &name, &relative, &meta, &mut entry)?;
                    debug!("Extracted {} ({})", relative, category);
                    if internal_path.is_empty() {
                        continue;
                    }
                    entries.entry(category).or_default().push(StagedEntry {
                        source,
                        internal_path,
                        meta,
                    });
                }
            }
        }

        if let Some(unknown) = entries.remove(&Category::Unknown) {
            let names: Vec<String> = unknown.into_iter().map(|e| e.internal_path).collect();
            warn!("Unknown entries in backup of {}: {:?}", self.package, names);
            return Err(Error::UnknownEntries(names));
        }

        let count: usize = entries.values().map(Vec::len).sum();
        info!("Extracted {} entries of {}", count, self.package);
        Ok(ExtractedBackup {
            header,
            manifest,
            entries,
            options: self.options,
            workdir,
        })
    }

    /// Normalizes an entry name and strips `apps/<package>/` from it.
    fn validate(&self, name: &str, root: &Path) -> Result<String> {
        let normalized = normalize(name).ok_or_else(|| Error::traversal(name, root.display().to_string()))?;
        if normalized == ".." || normalized.starts_with("../") {
            return Err(Error::traversal(name, root.join(&normalized).display().to_string()));
        }
        match normalized.strip_prefix(self.mapper.prefix()) {
            Some(relative) if !relative.is_empty() => Ok(relative.to_string()),
            _ => Err(Error::traversal(name, normalized)),
        }
    }
}

fn read_manifest<R: Read>(entry: &mut R) -> Result<Option<ManifestRecord>> {
    let mut content = Vec::new();
    entry.take(MAX_MANIFEST_SIZE).read_to_end(&mut content)?;
    match ManifestRecord::parse(&content) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(e) => {
            warn!("Ignoring unreadable manifest: {}", e);
            Ok(None)
        }
    }
}

/// Refuses to go through an existing symlink that leads out of `root`.
fn check_ancestors(root: &Path, name: &str, relative: &str) -> Result<()> {
    let mut current = root.to_path_buf();
    let mut components = relative.split('/').peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let real = current
                    .canonicalize()
                    .map_err(|_| Error::traversal(name, current.display().to_string()))?;
                if !real.starts_with(root) {
                    return Err(Error::traversal(name, real.display().to_string()));
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

fn materialize<R: Read>(root: &Path, name: &str, relative: &str, meta: &EntryMeta, data: &mut R) -> Result<PathBuf> {
    check_ancestors(root, name, relative)?;
    let target = root.join(relative);
    if let Ok(existing) = fs::symlink_metadata(&target) {
        let file_type = existing.file_type();
        if file_type.is_symlink() || (meta.kind == EntryKind::Symlink && !file_type.is_dir()) {
            fs::remove_file(&target)?;
        }
    }

    match meta.kind {
        EntryKind::Directory => fs::create_dir_all(&target)?,
        EntryKind::Regular => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = BufWriter::new(File::create(&target)?);
            io::copy(data, &mut file)?;
            file.into_inner().map_err(|e| e.into_error())?;
        }
        EntryKind::Symlink => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            create_symlink(meta.link_name.as_deref().unwrap_or_default(), &target)?;
            // Never followed, so there is nothing to re-check.
            return Ok(target);
        }
    }

    let real = target.canonicalize()?;
    if !real.starts_with(root) {
        return Err(Error::traversal(name, real.display().to_string()));
    }
    Ok(target)
}

#[cfg(unix)]
fn create_symlink(link: &str, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(link: &str, target: &Path) -> Result<()> {
    Err(Error::Format(format!(
        "Cannot create symlink {} -> {} on this platform",
        target.display(),
        link
    )))
}

/// The classified contents of one unpacked archive.
#[derive(Debug)]
pub struct ExtractedBackup {
    header: BackupHeader,
    manifest: Option<ManifestRecord>,
    entries: BTreeMap<Category, Vec<StagedEntry>>,
    options: UnpackOptions,
    workdir: TempDir,
}

impl ExtractedBackup {
    pub fn header(&self) -> &BackupHeader {
        &self.header
    }

    pub fn manifest(&self) -> Option<&ManifestRecord> {
        self.manifest.as_ref()
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Categories with at least one entry, in packing order.
    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.entries.keys().copied()
    }

    pub fn entries(&self, category: Category) -> &[StagedEntry] {
        self.entries.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn source_files(&self, dest: &Path) -> Result<Option<Vec<PathBuf>>> {
        self.files(Category::Source, 0, dest)
    }

    pub fn internal_ce_files(&self, data_index: usize, dest: &Path) -> Result<Option<Vec<PathBuf>>> {
        self.files(Category::InternalCe, data_index, dest)
    }

    pub fn internal_de_files(&self, data_index: usize, dest: &Path) -> Result<Option<Vec<PathBuf>>> {
        self.files(Category::InternalDe, data_index, dest)
    }

    pub fn external_files(&self, data_index: usize, dest: &Path) -> Result<Option<Vec<PathBuf>>> {
        self.files(Category::External, data_index, dest)
    }

    pub fn obb_files(&self, data_index: usize, dest: &Path) -> Result<Option<Vec<PathBuf>>> {
        self.files(Category::Obb, data_index, dest)
    }

    /// Writes one category as a compressed tar split into segments in `dest`.
    ///
    /// Returns the segment paths in order, or `None` when the category holds
    /// no entries. Segments are staged next to `dest` and only moved into
    /// place once the whole set is written.
    pub fn files(&self, category: Category, data_index: usize, dest: &Path) -> Result<Option<Vec<PathBuf>>> {
        if category == Category::Unknown {
            return Err(Error::InvalidCategory(category));
        }
        let entries = match self.entries.get(&category) {
            Some(entries) if !entries.is_empty() => entries,
            _ => return Ok(None),
        };

        let tar_type = self.options.tar_type;
        let prefix = segment_prefix(category, data_index, tar_type);
        fs::create_dir_all(dest)?;
        if let Some(existing) = existing_segment(dest, &prefix)? {
            return Err(Error::OutputExists(existing));
        }
        let root = self.workdir.path().canonicalize()?;
        let staging = tempfile::Builder::new().prefix(".abkit-").tempdir_in(dest)?;
        let splitter = SplitWriter::new(staging.path(), prefix.as_str(), self.options.split_size);
        let mut builder = tar::Builder::new(tar_type.compressor(BufWriter::new(splitter)));

        for staged in entries {
            match staged.meta.kind {
                EntryKind::Regular => {
                    let file = open_staged(&root, staged)?;
                    let meta = EntryMeta {
                        size: file.metadata()?.len(),
                        ..staged.meta.clone()
                    };
                    archive::append_entry(&mut builder, &staged.internal_path, &meta, BufReader::new(file))?;
                }
                EntryKind::Directory | EntryKind::Symlink => {
                    archive::append_entry(&mut builder, &staged.internal_path, &staged.meta, io::empty())?;
                }
            }
        }

        let buffered = builder.into_inner()?.finish()?;
        let splitter = buffered.into_inner().map_err(|e| e.into_error())?;
        let written = splitter.finish()?;

        let mut files = Vec::with_capacity(written.len());
        for (index, segment) in written.iter().enumerate() {
            let target = dest.join(SplitWriter::segment_name(&prefix, index));
            fs::rename(segment, &target)?;
            files.push(target);
        }
        sort_segments(&mut files);
        info!(
            "Wrote {} {} entries into {} segment(s) {}.*",
            entries.len(),
            category,
            files.len(),
            prefix
        );
        Ok(Some(files))
    }

    /// Writes every non-empty category into `dest`. Data categories get
    /// consecutive data indices starting at `first_data_index`, in packing
    /// order, so no two sets share a name.
    pub fn store_all(&self, dest: &Path, first_data_index: usize) -> Result<Vec<StoredSet>> {
        let mut stored = Vec::new();
        let mut next_index = first_data_index;
        for category in self.categories() {
            let data_index = if category == Category::Source {
                0
            } else {
                let index = next_index;
                next_index += 1;
                index
            };
            if let Some(files) = self.files(category, data_index, dest)? {
                stored.push(StoredSet {
                    category,
                    data_index,
                    files,
                });
            }
        }
        Ok(stored)
    }
}

/// One segment set written by [`ExtractedBackup::store_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSet {
    pub category: Category,
    /// Index in `data<N>.tar.*`; always 0 for the source set.
    pub data_index: usize,
    pub files: Vec<PathBuf>,
}

/// First file in `dest` that already belongs to the `<prefix>.*` set.
fn existing_segment(dest: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    let marker = format!("{}.", prefix);
    for entry in fs::read_dir(dest)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&marker) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Opens a staged regular file, refusing anything that has since stopped
/// being a regular file inside the working directory.
fn open_staged(root: &Path, staged: &StagedEntry) -> Result<File> {
    let escaped = || Error::traversal(&staged.internal_path, staged.source.display().to_string());
    if !fs::symlink_metadata(&staged.source)?.file_type().is_file() {
        return Err(escaped());
    }
    let real = staged.source.canonicalize()?;
    if !real.starts_with(root) {
        return Err(escaped());
    }
    Ok(File::open(&real)?)
}
