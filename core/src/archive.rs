use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Compression used for the stored segment sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TarType {
    #[serde(rename = "z")]
    Gzip,
    #[serde(rename = "j")]
    Bzip2,
}

impl TarType {
    pub fn code(self) -> &'static str {
        match self {
            TarType::Gzip => "z",
            TarType::Bzip2 => "j",
        }
    }

    /// File extension after `.tar.`
    pub fn extension(self) -> &'static str {
        match self {
            TarType::Gzip => "gz",
            TarType::Bzip2 => "bz2",
        }
    }

    pub fn compressor<W: Write>(self, writer: W) -> Compressor<W> {
        match self {
            TarType::Gzip => Compressor::Gzip(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::default(),
            )),
            TarType::Bzip2 => Compressor::Bzip2(bzip2::write::BzEncoder::new(
                writer,
                bzip2::Compression::best(),
            )),
        }
    }

    /// Concatenated members are read through, as split gzip/bzip2 sets can contain several.
    pub fn decompressor<R: Read>(self, reader: R) -> Decompressor<R> {
        match self {
            TarType::Gzip => Decompressor::Gzip(flate2::read::MultiGzDecoder::new(reader)),
            TarType::Bzip2 => Decompressor::Bzip2(bzip2::read::MultiBzDecoder::new(reader)),
        }
    }
}

impl Default for TarType {
    fn default() -> Self {
        TarType::Gzip
    }
}

impl FromStr for TarType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "z" | "gz" | "gzip" => Ok(TarType::Gzip),
            "j" | "bz2" | "bzip2" => Ok(TarType::Bzip2),
            other => Err(Error::Config(format!("Invalid compression type: {}", other))),
        }
    }
}

impl fmt::Display for TarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

pub enum Compressor<W: Write> {
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
}

impl<W: Write> Compressor<W> {
    pub fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Gzip(encoder) => encoder.finish(),
            Compressor::Bzip2(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Gzip(encoder) => encoder.write(buf),
            Compressor::Bzip2(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Gzip(encoder) => encoder.flush(),
            Compressor::Bzip2(encoder) => encoder.flush(),
        }
    }
}

pub enum Decompressor<R: Read> {
    Gzip(flate2::read::MultiGzDecoder<R>),
    Bzip2(bzip2::read::MultiBzDecoder<R>),
}

impl<R: Read> Read for Decompressor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decompressor::Gzip(decoder) => decoder.read(buf),
            Decompressor::Bzip2(decoder) => decoder.read(buf),
        }
    }
}

/// The three entry kinds that survive a transformation. Anything that is
/// neither a directory nor a symlink is carried as a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
}

impl EntryKind {
    pub fn of(entry_type: tar::EntryType) -> Self {
        if entry_type.is_symlink() {
            EntryKind::Symlink
        } else if entry_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Regular
        }
    }

    fn entry_type(self) -> tar::EntryType {
        match self {
            EntryKind::Regular => tar::EntryType::Regular,
            EntryKind::Directory => tar::EntryType::Directory,
            EntryKind::Symlink => tar::EntryType::Symlink,
        }
    }
}

/// Everything about an entry except its name and content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub uid: u64,
    pub gid: u64,
    pub username: Option<String>,
    pub groupname: Option<String>,
    pub link_name: Option<String>,
}

impl EntryMeta {
    pub fn regular(size: u64, mode: u32, mtime: u64) -> Self {
        Self {
            kind: EntryKind::Regular,
            size,
            mode,
            mtime,
            uid: 0,
            gid: 0,
            username: None,
            groupname: None,
            link_name: None,
        }
    }

    /// Reads the full path (long-name extensions applied) and metadata of an entry.
    ///
    /// Numeric fields left blank by the writer read as 0.
    pub fn from_entry<R: Read>(entry: &tar::Entry<'_, R>) -> Result<(String, Self)> {
        let header = entry.header();
        let path = entry_path(entry)?;
        let kind = EntryKind::of(header.entry_type());
        let link_name = match (kind, entry.link_name_bytes()) {
            (EntryKind::Symlink, Some(name)) => Some(utf8_name(&name, "link target")?),
            _ => None,
        };
        let old = header.as_old();
        let meta = Self {
            kind,
            size: if kind == EntryKind::Regular { entry.size() } else { 0 },
            mode: lenient(&old.mode, header.mode().map(u64::from))? as u32,
            mtime: lenient(&old.mtime, header.mtime())?,
            uid: lenient(&old.uid, header.uid())?,
            gid: lenient(&old.gid, header.gid())?,
            username: header
                .username_bytes()
                .map(|name| String::from_utf8_lossy(name).into_owned()),
            groupname: header
                .groupname_bytes()
                .map(|name| String::from_utf8_lossy(name).into_owned()),
            link_name,
        };
        Ok((path, meta))
    }
}

/// The full entry name, long-name extensions applied. Names that are not
/// UTF-8 are refused rather than rewritten.
pub fn entry_path<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    utf8_name(&entry.path_bytes(), "entry name")
}

fn utf8_name(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        Error::Format(format!(
            "Non UTF-8 {}: {}",
            what,
            String::from_utf8_lossy(bytes)
        ))
    })
}

fn lenient(field: &[u8], parsed: io::Result<u64>) -> io::Result<u64> {
    if field.iter().all(|&b| b == 0 || b == b' ') {
        Ok(0)
    } else {
        parsed
    }
}

/// Appends one entry under `path`. Only regular files carry `data`; names
/// and link targets that do not fit a ustar header go into a PAX record.
pub fn append_entry<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    path: &str,
    meta: &EntryMeta,
    data: R,
) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(meta.kind.entry_type());
    header.set_size(if meta.kind == EntryKind::Regular { meta.size } else { 0 });
    header.set_mode(meta.mode);
    header.set_mtime(meta.mtime);
    header.set_uid(meta.uid);
    header.set_gid(meta.gid);
    if let Some(name) = meta.username.as_deref().filter(|n| !n.is_empty()) {
        header.set_username(name)?;
    }
    if let Some(name) = meta.groupname.as_deref().filter(|n| !n.is_empty()) {
        header.set_groupname(name)?;
    }

    let mut pax: Vec<(&str, &[u8])> = Vec::new();
    if header.set_path(path).is_err() {
        pax.push(("path", path.as_bytes()));
        copy_truncated(&mut header.as_old_mut().name, path);
    }
    if let Some(link) = meta.link_name.as_deref() {
        if header.set_link_name(link).is_err() {
            pax.push(("linkpath", link.as_bytes()));
            copy_truncated(&mut header.as_old_mut().linkname, link);
        }
    }
    if !pax.is_empty() {
        builder.append_pax_extensions(pax)?;
    }
    header.set_cksum();

    match meta.kind {
        EntryKind::Regular => builder.append(&header, data.take(meta.size)),
        EntryKind::Directory | EntryKind::Symlink => builder.append(&header, io::empty()),
    }
}

fn copy_truncated(field: &mut [u8; 100], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len());
    field.fill(0);
    field[..n].copy_from_slice(&bytes[..n]);
}
