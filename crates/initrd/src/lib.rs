#![no_std]

//! # Ember boot archive
//!
//! The boot archive is a flat concatenation of file records, loaded by the bootloader as
//! a module and searched in place by the kernel. Each record is laid out as:
//!
//! | field         | size            |
//! |---------------|-----------------|
//! | magic `LORD`  | 4               |
//! | `header_size` | 8, little-endian|
//! | `file_size`   | 8, little-endian|
//! | `name_len`    | 1               |
//! | name          | `name_len`      |
//! | contents      | `file_size`     |
//! | zero padding  | up to 8-byte alignment of `file_size` |
//!
//! `header_size` covers everything before the contents. A record with the wrong magic
//! ends the archive.

use core::str;

#[cfg(test)]
extern crate std;

/// Magic bytes at the start of every record.
pub const MAGIC: [u8; 4] = *b"LORD";

/// Contents are padded to a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Header size without the name.
pub const FIXED_HEADER_SIZE: usize = MAGIC.len() + 8 + 8 + 1;

/// Longest name a record can carry.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Largest possible record header.
pub const MAX_HEADER_SIZE: usize = FIXED_HEADER_SIZE + MAX_NAME_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("file name is {0} bytes long, at most 255 fit in a record")]
    NameTooLong(usize),
    #[error("header buffer holds {provided} bytes, {required} required")]
    BufferTooSmall { required: usize, provided: usize },
}

/// Number of zero bytes that follow `file_size` bytes of contents.
pub const fn padding(file_size: usize) -> usize {
    (ALIGNMENT - file_size % ALIGNMENT) % ALIGNMENT
}

/// Writes the record header for `name` into `buf` and returns its length.
pub fn encode_header(buf: &mut [u8], name: &str, file_size: u64) -> Result<usize, FormatError> {
    if name.len() > MAX_NAME_LEN {
        return Err(FormatError::NameTooLong(name.len()));
    }

    let header_size = FIXED_HEADER_SIZE + name.len();
    let provided = buf.len();
    let header = buf
        .get_mut(..header_size)
        .ok_or(FormatError::BufferTooSmall {
            required: header_size,
            provided,
        })?;

    header[0..4].copy_from_slice(&MAGIC);
    header[4..12].copy_from_slice(&(header_size as u64).to_le_bytes());
    header[12..20].copy_from_slice(&file_size.to_le_bytes());
    header[20] = name.len() as u8;
    header[FIXED_HEADER_SIZE..].copy_from_slice(name.as_bytes());
    Ok(header_size)
}

/// A file stored in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub name: &'a str,
    pub contents: &'a [u8],
}

/// A read-only view of an archive in memory.
#[derive(Debug, Clone, Copy)]
pub struct Archive<'a> {
    data: &'a [u8],
}

impl<'a> Archive<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Iterates the records in archive order.
    pub fn iter(&self) -> Iter<'a> {
        Iter {
            data: self.data,
            offset: 0,
        }
    }

    /// Returns the contents of the file whose name is exactly `path`.
    pub fn lookup(&self, path: &str) -> Option<&'a [u8]> {
        self.iter()
            .find(|entry| entry.name == path)
            .map(|entry| entry.contents)
    }
}

impl<'a> IntoIterator for &Archive<'a> {
    type Item = Entry<'a>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over archive records. Stops at the first malformed record.
pub struct Iter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iter<'a> {
    fn read_u64(&self, at: usize) -> Option<u64> {
        let bytes = self.data.get(at..at + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.offset;
        let fixed = self.data.get(start..start.checked_add(FIXED_HEADER_SIZE)?)?;
        if fixed[..MAGIC.len()] != MAGIC {
            return None;
        }

        let header_size = usize::try_from(self.read_u64(start + 4)?).ok()?;
        let file_size = usize::try_from(self.read_u64(start + 12)?).ok()?;
        let name_len = usize::from(fixed[20]);
        if header_size < FIXED_HEADER_SIZE + name_len {
            return None;
        }

        let name_start = start + FIXED_HEADER_SIZE;
        let name = str::from_utf8(self.data.get(name_start..name_start + name_len)?).ok()?;
        let contents_start = start.checked_add(header_size)?;
        let contents_end = contents_start.checked_add(file_size)?;
        let contents = self.data.get(contents_start..contents_end)?;

        self.offset = contents_end + padding(file_size);
        Some(Entry { name, contents })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn record(out: &mut Vec<u8>, name: &str, contents: &[u8]) {
        let mut header = [0u8; MAX_HEADER_SIZE];
        let len = encode_header(&mut header, name, contents.len() as u64).unwrap();
        out.extend_from_slice(&header[..len]);
        out.extend_from_slice(contents);
        out.extend(core::iter::repeat_n(0, padding(contents.len())));
    }

    fn sample() -> Vec<u8> {
        let mut archive = Vec::new();
        record(&mut archive, "/etc/motd", b"hello");
        record(&mut archive, "/sbin/init", &[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
        record(&mut archive, "/empty", b"");
        archive
    }

    #[test]
    fn header_layout() {
        let mut header = [0u8; MAX_HEADER_SIZE];
        let len = encode_header(&mut header, "/a", 5).unwrap();
        assert_eq!(len, 23);
        assert_eq!(&header[..4], b"LORD");
        assert_eq!(&header[4..12], &23u64.to_le_bytes());
        assert_eq!(&header[12..20], &5u64.to_le_bytes());
        assert_eq!(header[20], 2);
        assert_eq!(&header[21..23], b"/a");
    }

    #[test]
    fn records_are_padded() {
        let archive = sample();
        // 30 + 5 + 3, then 31 + 8 + 0, then 27 + 0 + 0.
        assert_eq!(archive.len(), 38 + 39 + 27);
        assert_eq!(padding(5), 3);
        assert_eq!(padding(8), 0);
    }

    #[test]
    fn looks_up_files() {
        let data = sample();
        let archive = Archive::new(&data);
        assert_eq!(archive.lookup("/etc/motd"), Some(&b"hello"[..]));
        assert_eq!(archive.lookup("/sbin/init").map(|c| c.len()), Some(8));
        assert_eq!(archive.lookup("/empty"), Some(&b""[..]));
        assert_eq!(archive.lookup("/sbin"), None);
        assert_eq!(archive.lookup("/sbin/init2"), None);
    }

    #[test]
    fn iterates_in_order() {
        let data = sample();
        let names: Vec<_> = Archive::new(&data).iter().map(|entry| entry.name).collect();
        assert_eq!(names, ["/etc/motd", "/sbin/init", "/empty"]);
    }

    #[test]
    fn bad_magic_ends_the_walk() {
        let mut data = sample();
        // Corrupt the second record's magic.
        data[38] = b'X';
        let archive = Archive::new(&data);
        assert_eq!(archive.iter().count(), 1);
        assert_eq!(archive.lookup("/sbin/init"), None);
    }

    #[test]
    fn truncated_contents_end_the_walk() {
        let data = sample();
        let archive = Archive::new(&data[..50]);
        assert_eq!(archive.iter().count(), 1);
        assert_eq!(Archive::new(&[]).iter().count(), 0);
    }

    #[test]
    fn long_names_are_rejected() {
        let name = "x".repeat(256);
        let mut header = [0u8; MAX_HEADER_SIZE];
        assert_eq!(
            encode_header(&mut header, &name, 0),
            Err(FormatError::NameTooLong(256))
        );
        assert!(matches!(
            encode_header(&mut header[..10], "/a", 0),
            Err(FormatError::BufferTooSmall { required: 23, provided: 10 })
        ));
    }
}
