//! Metainfo is a .torrent file with information about the Torrent.
use std::path::Path;

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::{self, AsString, SingleItemEncoder, ToBencode},
};

use crate::{
    error::Error,
    tcp_wire::BlockInfo,
    torrent::InfoHash,
};

/// Metainfo is a .torrent file with information about the Torrent.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: Option<String>,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<u64>,
    pub info: Info,
}

impl MetaInfo {
    /// Decode and validate a .torrent buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let meta_info = Self::from_bencode(buf)?;
        meta_info.info.validate()?;
        Ok(meta_info)
    }

    /// Read a .torrent file from disk.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let buf = tokio::fs::read(path).await?;
        Self::from_bytes(&buf)
    }

    /// Every tracker url of the torrent, in the order they should be tried.
    ///
    /// The tiers of `announce-list` come first, as clients that support it
    /// must ignore `announce`, which is appended as the last resort.
    pub fn trackers(&self) -> Vec<String> {
        let mut list: Vec<String> = Vec::new();

        let tiers = self.announce_list.iter().flatten().flatten();
        for url in tiers.chain(self.announce.iter()) {
            if !list.contains(url) {
                list.push(url.clone());
            }
        }

        list
    }
}

/// File related information, we only support the single-file format.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Length of the file in bytes.
    pub file_length: usize,

    /// Only present in multi-file torrents, which are rejected.
    pub files: Option<Vec<File>>,

    /// Name of the file
    pub name: String,

    /// length in bytes of each piece, the last piece may have a smaller length
    pub piece_length: usize,

    /// A (byte) string consisting of the concatenation of all 20-byte SHA1
    /// hash values, one per piece.
    pub pieces: Vec<u8>,

    // computed when decoding, not part of the bencoded dict.
    pub info_hash: InfoHash,
}

impl Info {
    /// Build a single-file info and compute its info hash.
    pub fn new(
        name: impl Into<String>,
        file_length: usize,
        piece_length: usize,
        pieces: Vec<u8>,
    ) -> Result<Self, Error> {
        let mut info = Self {
            file_length,
            name: name.into(),
            piece_length,
            pieces,
            ..Default::default()
        };
        info.info_hash = Self::info_hash(&info.to_bencode()?);
        info.validate()?;
        Ok(info)
    }

    pub(crate) fn info_hash(buf: &[u8]) -> InfoHash {
        InfoHash(sha1_smol::Sha1::from(buf).digest().bytes())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.files.is_some() {
            return Err(Error::MultiFileUnsupported);
        }
        if self.piece_length == 0 {
            return Err(Error::MetainfoInvalid("piece length is zero".into()));
        }
        if self.file_length == 0 {
            return Err(Error::MetainfoInvalid("length is zero".into()));
        }
        if self.pieces.len() % 20 != 0 {
            return Err(Error::MetainfoInvalid(
                "pieces is not a multiple of 20 bytes".into(),
            ));
        }
        let expected = self.file_length.div_ceil(self.piece_length);
        if self.pieces() != expected {
            return Err(Error::MetainfoInvalid(format!(
                "{} piece hashes for {expected} pieces",
                self.pieces()
            )));
        }
        Ok(())
    }

    /// Calculate how many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Get the size in bytes of the file of the torrent.
    #[inline]
    pub fn get_torrent_size(&self) -> usize {
        self.file_length
    }

    /// The 20-byte SHA1 of the given piece.
    pub fn piece_hash(&self, piece_index: usize) -> Option<[u8; 20]> {
        let start = piece_index * 20;
        self.pieces.get(start..start + 20)?.try_into().ok()
    }

    /// Get the size (in bytes) of a piece.
    pub fn piece_size(&self, piece_index: usize) -> usize {
        if piece_index + 1 == self.pieces() {
            let remainder = self.file_length % self.piece_length;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder
            }
        } else {
            self.piece_length
        }
    }

    /// Get the block infos of a piece.
    ///
    /// ```text
    /// piece:  |--------------------- piece_size ---------------------|
    /// blocks: |---- block_len ----|---- block_len ----|--- rest ---|
    /// ```
    pub fn get_block_infos_of_piece(
        &self,
        piece_index: usize,
        block_len: u32,
    ) -> Vec<BlockInfo> {
        let piece_size = self.piece_size(piece_index) as u32;
        let num_blocks = piece_size.div_ceil(block_len);

        (0..num_blocks)
            .map(|block_index| {
                let begin = block_index * block_len;
                let len = block_len.min(piece_size - begin);
                BlockInfo { index: piece_index as u32, begin, len }
            })
            .collect()
    }
}

/// Entry of the `files` list of a multi-file torrent. Only decoded so that
/// those torrents can be recognised and rejected.
#[derive(Debug, PartialEq, Clone, Default, Hash, Eq)]
pub struct File {
    /// Length of the file in bytes.
    pub length: usize,
    /// Path of the file, excluding the parent name.
    pub path: Vec<String>,
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict_dec = object.try_into_dictionary()?;
        let mut length = 0;
        let mut path: Vec<String> = vec![];

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = usize::decode_bencode_object(value)
                        .context("length")?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value)
                        .context("path")?;
                }
                _ => {}
            }
        }

        Ok(Self { length, path })
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(announce) = &self.announce {
                e.emit_pair(b"announce", announce)?;
            }
            if let Some(announce_list) = &self.announce_list {
                e.emit_pair(b"announce-list", announce_list)?;
            }
            if let Some(comment) = &self.comment {
                e.emit_pair(b"comment", comment)?;
            }
            if let Some(created_by) = &self.created_by {
                e.emit_pair(b"created by", created_by)?;
            }
            if let Some(creation_date) = &self.creation_date {
                e.emit_pair(b"creation date", creation_date)?;
            }
            e.emit_pair(b"info", &self.info)
        })?;

        Ok(())
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.file_length)?;
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut created_by = None;
        let mut creation_date = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce_list")
                        .map(Some)?;
                }
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                (b"created by", value) => {
                    created_by = String::decode_bencode_object(value)
                        .context("created_by")
                        .map(Some)?;
                }
                (b"creation date", value) => {
                    creation_date = u64::decode_bencode_object(value)
                        .context("creation_date")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let info =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo {
            announce,
            announce_list,
            comment,
            created_by,
            creation_date,
            info,
        })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut files = None;
        let mut file_length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        // the info hash is the hash of the dict exactly as it was encoded
        let bytes = object.try_into_dictionary()?.into_raw()?;
        let info_hash = Info::info_hash(bytes);
        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    file_length = usize::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = usize::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        let name =
            name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        // multi-file torrents have no `length`, they are refused later by
        // `validate` with a proper error.
        if files.is_none() && file_length.is_none() {
            return Err(decoding::Error::missing_field("length"));
        }

        Ok(Info {
            file_length: file_length.unwrap_or(0),
            files,
            name,
            piece_length,
            pieces,
            info_hash,
        })
    }
}
