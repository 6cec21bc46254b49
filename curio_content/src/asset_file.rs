//! Transformed outputs and thumbnails are written to files that start with a header
//! which records what the content was derived from.
//!
//! ## Overview
//!
//! The header identifies the file as curator output and stores the asset hash and the
//! transform version the content was produced with. The evaluator compares both values
//! against the current state of the asset to decide whether the output is stale.
//!
//! Header:
//!
//! | Field             | Type   | Size (bytes) | Description                              |
//! |-------------------|--------|--------------|------------------------------------------|
//! | Magic             | u8[16] | 16           | 5c0e8f62-3a4b-4e8d-9c71-2f6a0d9b7e13     |
//! | Format version    | u32    | 4            | Version of this header layout            |
//! | File type length  | u32    | 4            | Length of the file type string           |
//! | File type         | String | variable     | Document type of the asset               |
//! | Asset hash        | u64    | 8            | Hash the content was derived from        |
//! | Transform version | u32    | 4            | Version of the transformer that wrote it |
//!
//! The content follows directly after the header. The header has a variable length
//! because of the file type string.
//!
//! ## Writing
//!
//! [`OutputWrite::create`] writes the header and [`OutputWrite::write_content`] provides
//! a [`Write`] implementation for the content. [`write_output_file`] does both for a
//! file on disk and replaces an existing file only once the new one is complete.
//!
//! ## Reading
//!
//! [`OutputRead::open`] checks the header and [`OutputRead::read_content`] provides a
//! [`Read`] implementation for the content. [`read_output_record`] only reads the header.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use curio_shared::{
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    log::trace,
    uuid::Uuid,
};

use crate::{asset_info::OutputRecord, AssetGuid};

/* UUID string: 5c0e8f62-3a4b-4e8d-9c71-2f6a0d9b7e13 */
pub const MAGIC: [u8; 16] = [
    0x5c, 0x0e, 0x8f, 0x62, 0x3a, 0x4b, 0x4e, 0x8d, 0x9c, 0x71, 0x2f, 0x6a, 0x0d, 0x9b, 0x7e, 0x13,
];

pub const FORMAT_VERSION: u32 = 1;

/// File type that is used for thumbnails.
pub const THUMBNAIL_FILE_TYPE: &str = "Thumbnail";

/// Header that is written at the beginning of an output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputHeader {
    pub magic: [u8; 16],
    pub format_version: u32,
    pub file_type: String,
    pub asset_hash: u64,
    pub transform_version: u32,
}

impl OutputHeader {
    pub fn new(file_type: impl Into<String>, asset_hash: u64, transform_version: u32) -> Self {
        Self {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            file_type: file_type.into(),
            asset_hash,
            transform_version,
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut magic = [0u8; 16];
        reader
            .read_exact(&mut magic)
            .map_err(|_| invalid_data("Failed to read magic number"))?;
        let format_version = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| invalid_data("Failed to read format version"))?;

        let file_type_len = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| invalid_data("Failed to read file type length"))?;
        let mut file_type_buf = Vec::new();
        reader
            .by_ref()
            .take(file_type_len as u64)
            .read_to_end(&mut file_type_buf)
            .map_err(|_| invalid_data("Failed to read file type"))?;
        if file_type_buf.len() != file_type_len as usize {
            return Err(invalid_data("File type is truncated"));
        }
        let file_type = String::from_utf8(file_type_buf).map_err(|_| invalid_data("File type is not valid UTF-8"))?;

        let asset_hash = reader
            .read_u64::<LittleEndian>()
            .map_err(|_| invalid_data("Failed to read asset hash"))?;
        let transform_version = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| invalid_data("Failed to read transform version"))?;

        Ok(Self {
            magic,
            format_version,
            file_type,
            asset_hash,
            transform_version,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u32::<LittleEndian>(self.format_version)?;
        writer.write_u32::<LittleEndian>(self.file_type.len() as u32)?;
        writer.write_all(self.file_type.as_bytes())?;
        writer.write_u64::<LittleEndian>(self.asset_hash)?;
        writer.write_u32::<LittleEndian>(self.transform_version)?;
        Ok(())
    }

    /// Checks the magic number and the format version.
    pub fn check(&self) -> io::Result<()> {
        if self.magic != MAGIC {
            return Err(invalid_data("Invalid magic number"));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(invalid_data("Invalid format version"));
        }
        Ok(())
    }

    pub fn record(&self) -> OutputRecord {
        OutputRecord {
            hash: self.asset_hash,
            version: self.transform_version,
        }
    }
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

pub struct OutputWrite<W: Write> {
    writer: W,
    content_start_position: u64,
}

impl<W: Write + Seek> OutputWrite<W> {
    /// Writes the header and positions the writer at the start of the content.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::io::{Cursor, Write};
    /// use curio_content::asset_file::{OutputHeader, OutputWrite};
    ///
    /// let mut buf = Vec::new();
    /// let header = OutputHeader::new("Texture", 42, 3);
    /// let mut writer = OutputWrite::create(Cursor::new(&mut buf), &header).unwrap();
    /// writer.write_content().write_all(b"pixels").unwrap();
    ///
    /// let read_back = OutputHeader::read(Cursor::new(&buf)).unwrap();
    /// assert_eq!(read_back, header);
    /// ```
    pub fn create(mut writer: W, header: &OutputHeader) -> io::Result<Self> {
        header.write(&mut writer)?;
        let content_start_position = writer.stream_position()?;
        Ok(Self {
            writer,
            content_start_position,
        })
    }

    /// Provides a [`Write`] implementation for the content. Seeking is relative to the
    /// start of the content.
    pub fn write_content(&mut self) -> ContentWrite<W> {
        let content_start_position = self.content_start_position;
        ContentWrite {
            output_write: self,
            content_start_position,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub struct ContentWrite<'a, W: Write + Seek> {
    output_write: &'a mut OutputWrite<W>,
    content_start_position: u64,
}

impl<'a, W: Write + Seek> Write for ContentWrite<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output_write.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output_write.writer.flush()
    }
}

impl<'a, W: Write + Seek> Seek for ContentWrite<'a, W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        seek(&mut self.output_write.writer, pos, self.content_start_position)
    }
}

pub struct OutputRead<R: Read + Seek> {
    reader: R,
    header: OutputHeader,
    content_start_position: u64,
}

impl<R: Read + Seek> OutputRead<R> {
    /// Reads and checks the header.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::io::{Cursor, Read, Write};
    /// use curio_content::asset_file::{OutputHeader, OutputRead, OutputWrite};
    ///
    /// let mut buf = Vec::new();
    /// let mut writer = OutputWrite::create(Cursor::new(&mut buf), &OutputHeader::new("Texture", 42, 3)).unwrap();
    /// writer.write_content().write_all(b"pixels").unwrap();
    ///
    /// let mut reader = OutputRead::open(Cursor::new(&buf)).unwrap();
    /// assert_eq!(reader.header().asset_hash, 42);
    /// let mut content = String::new();
    /// reader.read_content().read_to_string(&mut content).unwrap();
    /// assert_eq!(content, "pixels");
    /// ```
    pub fn open(mut reader: R) -> io::Result<Self> {
        let header = OutputHeader::read(&mut reader)?;
        header.check()?;
        let content_start_position = reader.stream_position()?;
        Ok(Self {
            reader,
            header,
            content_start_position,
        })
    }

    pub fn header(&self) -> &OutputHeader {
        &self.header
    }

    /// Provides a [`Read`] implementation for the content.
    pub fn read_content(&mut self) -> ContentRead<R> {
        let content_start_position = self.content_start_position;
        ContentRead {
            output_read: self,
            content_start_position,
        }
    }
}

pub struct ContentRead<'a, R: Read + Seek> {
    output_read: &'a mut OutputRead<R>,
    content_start_position: u64,
}

impl<'a, R: Read + Seek> Read for ContentRead<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.output_read.reader.read(buf)
    }
}

impl<'a, R: Read + Seek> Seek for ContentRead<'a, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        seek(&mut self.output_read.reader, pos, self.content_start_position)
    }
}

fn seek<S: Seek>(seekable: &mut S, pos: SeekFrom, content_start_position: u64) -> io::Result<u64> {
    let before_content = || io::Error::new(io::ErrorKind::InvalidInput, "Seeking before the start of the content");
    match pos {
        SeekFrom::Start(offset) => seekable
            .seek(SeekFrom::Start(content_start_position + offset))
            .map(|pos| pos - content_start_position),
        SeekFrom::End(offset) => {
            let end_position = seekable.seek(SeekFrom::End(0))?;
            if end_position as i64 + offset < content_start_position as i64 {
                return Err(before_content());
            }
            seekable.seek(SeekFrom::End(offset)).map(|pos| pos - content_start_position)
        }
        SeekFrom::Current(offset) => {
            let current_position = seekable.stream_position()?;
            if current_position as i64 + offset < content_start_position as i64 {
                return Err(before_content());
            }
            seekable.seek(SeekFrom::Current(offset)).map(|pos| pos - content_start_position)
        }
    }
}

/// Writes header and content to `path`. The content is first written to a uniquely
/// named temporary file next to `path` which then replaces `path`.
pub fn write_output_file(path: &Path, header: &OutputHeader, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temporary_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    {
        let file = BufWriter::new(File::create(&temporary_path)?);
        let mut writer = OutputWrite::create(file, header)?;
        writer.write_content().write_all(content)?;
        writer.into_inner().into_inner().map_err(|err| err.into_error())?.sync_all()?;
    }
    fs::rename(&temporary_path, path)?;
    trace!("Wrote output file '{}' ({} bytes of content)", path.display(), content.len());
    Ok(())
}

/// Reads only the header of the output file. `None` when the file doesn't exist or
/// its header is invalid.
pub fn read_output_record(path: &Path) -> Option<OutputRecord> {
    let file = File::open(path).ok()?;
    match OutputHeader::read(BufReader::new(file)).and_then(|header| header.check().map(|_| header)) {
        Ok(header) => Some(header.record()),
        Err(err) => {
            trace!("Output file '{}' has no valid header: {err}", path.display());
            None
        }
    }
}

/// Reads header and content of an output file.
pub fn read_output_file(path: &Path) -> io::Result<(OutputHeader, Vec<u8>)> {
    let mut reader = OutputRead::open(BufReader::new(File::open(path)?))?;
    let mut content = Vec::new();
    reader.read_content().read_to_end(&mut content)?;
    Ok((reader.header().clone(), content))
}

/// Where the curator puts its files below the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<profile>/<guid>.asset`
    pub fn output_path(&self, profile: &str, guid: &AssetGuid) -> PathBuf {
        self.root.join(profile).join(format!("{guid}.asset"))
    }

    /// `<root>/Thumbnails/<guid>.thumb`
    pub fn thumbnail_path(&self, guid: &AssetGuid) -> PathBuf {
        self.root.join("Thumbnails").join(format!("{guid}.thumb"))
    }

    /// `<root>/<profile>/AssetTable.txt`
    pub fn asset_table_path(&self, profile: &str) -> PathBuf {
        self.root.join(profile).join("AssetTable.txt")
    }

    /// `<root>/curator.cache`
    pub fn cache_path(&self) -> PathBuf {
        self.root.join("curator.cache")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempdir::TempDir;

    use super::*;

    fn write_to_buffer(header: &OutputHeader, content: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = OutputWrite::create(Cursor::new(&mut buf), header).unwrap();
        writer.write_content().write_all(content).unwrap();
        buf
    }

    #[test]
    #[should_panic]
    fn seek_negative_from_end_into_header() {
        // Given
        let mut cursor = Cursor::new(vec![0x01, 0x02, 0x03, 0x04]);

        // When
        seek(&mut cursor, SeekFrom::End(-1), 4).unwrap();
    }

    #[test]
    #[should_panic]
    fn seek_negative_from_current_into_header() {
        // Given
        let mut cursor = Cursor::new(vec![0x01, 0x02, 0x03, 0x04]);
        cursor.seek(SeekFrom::End(0)).unwrap();

        // When
        seek(&mut cursor, SeekFrom::Current(-1), 4).unwrap();
    }

    #[test]
    fn header_layout() {
        // Given
        let header = OutputHeader::new("Mat", 0x0102030405060708, 7);

        // When
        let buf = write_to_buffer(&header, b"");

        // Then
        let mut reader = Cursor::new(&buf);
        let mut magic = [0u8; 16];
        reader.read_exact(&mut magic).unwrap();
        assert_eq!(magic, MAGIC);
        assert_eq!(reader.read_u32::<LittleEndian>().unwrap(), FORMAT_VERSION);
        assert_eq!(reader.read_u32::<LittleEndian>().unwrap(), 3);
        let mut file_type = [0u8; 3];
        reader.read_exact(&mut file_type).unwrap();
        assert_eq!(&file_type, b"Mat");
        assert_eq!(reader.read_u64::<LittleEndian>().unwrap(), 0x0102030405060708);
        assert_eq!(reader.read_u32::<LittleEndian>().unwrap(), 7);
        assert_eq!(buf.len(), 16 + 4 + 4 + 3 + 8 + 4);
    }

    #[test]
    fn seek_to_start_of_content() {
        // Given
        let mut buf = Vec::new();
        let header = OutputHeader::new("Texture", 1, 1);
        let mut writer = OutputWrite::create(Cursor::new(&mut buf), &header).unwrap();

        // When
        let mut content_writer = writer.write_content();
        content_writer.write_all(b"Hello, world!").unwrap();
        content_writer.seek(SeekFrom::Start(0)).unwrap();
        content_writer.write_all(b"Hello, Universe!").unwrap();

        // Then
        let mut reader = OutputRead::open(Cursor::new(&buf)).unwrap();
        let mut content = String::new();
        reader.read_content().read_to_string(&mut content).unwrap();
        assert_eq!(content, "Hello, Universe!");
    }

    #[test]
    fn open_rejects_foreign_files() {
        let mut buf = write_to_buffer(&OutputHeader::new("Texture", 1, 1), b"content");
        buf[0] ^= 0xff;
        assert!(OutputRead::open(Cursor::new(&buf)).is_err());
    }

    #[test]
    fn truncated_header_is_invalid() {
        let buf = write_to_buffer(&OutputHeader::new("Texture", 1, 1), b"");
        assert!(OutputHeader::read(Cursor::new(&buf[..buf.len() - 2])).is_err());
    }

    #[test]
    fn write_and_read_file() {
        // Given
        let root = TempDir::new("root").unwrap();
        let layout = OutputLayout::new(root.path());
        let guid = AssetGuid::new_v4();
        let path = layout.output_path("PC", &guid);

        // When
        write_output_file(&path, &OutputHeader::new("Texture", 99, 2), b"pixels").unwrap();

        // Then
        assert_eq!(read_output_record(&path), Some(OutputRecord { hash: 99, version: 2 }));
        let (header, content) = read_output_file(&path).unwrap();
        assert_eq!(header.file_type, "Texture");
        assert_eq!(content, b"pixels");
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn record_of_missing_or_garbage_file_is_none() {
        let root = TempDir::new("root").unwrap();
        assert_eq!(read_output_record(&root.path().join("missing.asset")), None);
        let garbage = root.path().join("garbage.asset");
        fs::write(&garbage, b"garbage").unwrap();
        assert_eq!(read_output_record(&garbage), None);
    }

    #[test]
    fn layout_paths() {
        let layout = OutputLayout::new("/out");
        let guid: AssetGuid = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        assert_eq!(
            layout.output_path("PC", &guid),
            PathBuf::from("/out/PC/67e55044-10b1-426f-9247-bb680e5fe0c8.asset")
        );
        assert_eq!(
            layout.thumbnail_path(&guid),
            PathBuf::from("/out/Thumbnails/67e55044-10b1-426f-9247-bb680e5fe0c8.thumb")
        );
        assert_eq!(layout.asset_table_path("PC"), PathBuf::from("/out/PC/AssetTable.txt"));
    }
}
