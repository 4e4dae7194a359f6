//! Directory entry codec.
//!
//! A directory's data is a packed sequence of entries, each
//! `{inode_number: u32, name_len: u16, name bytes}`. Entries keep their
//! insertion order; listing a directory returns names in stored order.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::FsError;

/// Longest permitted entry name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
}

impl DirEntry {
    pub fn new(inode: u32, name: &str) -> Self {
        DirEntry { inode, name: name.to_string() }
    }

    /// Serialized size of this entry.
    pub fn encoded_len(&self) -> usize {
        4 + 2 + self.name.len()
    }

    /// Serializes the entry.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        let mut cur = Cursor::new(&mut buf);
        cur.write_u32::<LittleEndian>(self.inode).unwrap();
        cur.write_u16::<LittleEndian>(self.name.len() as u16).unwrap();
        use std::io::Write;
        cur.write_all(self.name.as_bytes()).unwrap();
        buf
    }

    /// Parses one entry from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), FsError> {
        if buf.len() < 6 {
            return Err(FsError::CorruptedFilesystem {
                reason: "truncated directory entry header".into(),
            });
        }
        let mut cur = Cursor::new(buf);
        let inode = cur.read_u32::<LittleEndian>()?;
        let name_len = cur.read_u16::<LittleEndian>()? as usize;
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("directory entry name length {name_len}"),
            });
        }
        if buf.len() < 6 + name_len {
            return Err(FsError::CorruptedFilesystem {
                reason: "truncated directory entry name".into(),
            });
        }
        let name = std::str::from_utf8(&buf[6..6 + name_len])
            .map_err(|_| FsError::CorruptedFilesystem {
                reason: "directory entry name is not UTF-8".into(),
            })?
            .to_string();
        Ok((DirEntry { inode, name }, 6 + name_len))
    }
}

/// Decodes a directory's full content into its entries, in stored order.
pub fn decode_entries(data: &[u8]) -> Result<Vec<DirEntry>, FsError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (entry, consumed) = DirEntry::decode(&data[offset..])?;
        entries.push(entry);
        offset += consumed;
    }
    Ok(entries)
}

/// Encodes entries back into packed directory content.
pub fn encode_entries(entries: &[DirEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.iter().map(DirEntry::encoded_len).sum());
    for entry in entries {
        out.extend_from_slice(&entry.encode());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_round_trip() {
        let entry = DirEntry::new(42, "notes.txt");
        let bytes = entry.encode();
        let (parsed, consumed) = DirEntry::decode(&bytes).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_entries_keep_insertion_order() {
        let entries = vec![
            DirEntry::new(2, "x"),
            DirEntry::new(3, "y"),
            DirEntry::new(4, "z"),
        ];
        let packed = encode_entries(&entries);
        let decoded = decode_entries(&packed).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_empty_directory_decodes_to_nothing() {
        assert!(decode_entries(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_entry_is_corruption() {
        let entry = DirEntry::new(7, "name");
        let bytes = entry.encode();
        assert!(matches!(
            decode_entries(&bytes[..bytes.len() - 1]),
            Err(FsError::CorruptedFilesystem { .. })
        ));
    }

    #[test]
    fn test_zero_length_name_is_corruption() {
        let mut bytes = DirEntry::new(7, "a").encode();
        bytes[4] = 0; // name_len low byte
        assert!(decode_entries(&bytes).is_err());
    }
}
