//! Chunk model for the compiled (binary) XML format used by the package
//! manifest. Parsing is structural and lossless for the chunk types a
//! manifest contains, so a parsed document can be patched and re-serialized.
//!
//! The compiled resource *table* is deliberately not modelled here beyond its
//! string pool encodings: table entries are only ever content-patched in
//! place (see [`strings`]), never re-serialized.

pub mod strings;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    Null = 0x0000,
    StringPool = 0x0001,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlResourceMap = 0x0180,
}

impl ChunkType {
    pub fn from_u16(ty: u16) -> Option<Self> {
        Some(match ty {
            ty if ty == ChunkType::Null as u16 => ChunkType::Null,
            ty if ty == ChunkType::StringPool as u16 => ChunkType::StringPool,
            ty if ty == ChunkType::Xml as u16 => ChunkType::Xml,
            ty if ty == ChunkType::XmlStartNamespace as u16 => ChunkType::XmlStartNamespace,
            ty if ty == ChunkType::XmlEndNamespace as u16 => ChunkType::XmlEndNamespace,
            ty if ty == ChunkType::XmlStartElement as u16 => ChunkType::XmlStartElement,
            ty if ty == ChunkType::XmlEndElement as u16 => ChunkType::XmlEndElement,
            ty if ty == ChunkType::XmlResourceMap as u16 => ChunkType::XmlResourceMap,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResChunkHeader {
    /// Type identifier for this chunk.
    pub ty: u16,
    /// Size of the chunk header (in bytes). Adding this value to the address
    /// of the chunk allows you to find its associated data (if any).
    pub header_size: u16,
    /// Total size of this chunk (in bytes), header included. Adding this
    /// value to the chunk address skips its contents, child chunks included.
    pub size: u32,
}

impl ResChunkHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let ty = r.read_u16::<LittleEndian>()?;
        let header_size = r.read_u16::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            ty,
            header_size,
            size,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.ty)?;
        w.write_u16::<LittleEndian>(self.header_size)?;
        w.write_u32::<LittleEndian>(self.size)?;
        Ok(())
    }
}

pub const UTF8_FLAG: u32 = 1 << 8;

/// A parsed string pool. The physical encoding is preserved so a manifest
/// compiled with a UTF-16 pool round-trips as UTF-16.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringPool {
    pub utf8: bool,
    pub strings: Vec<String>,
    pub styles: Vec<Vec<ResSpan>>,
}

impl StringPool {
    fn parse<R: Read + Seek>(r: &mut R, chunk_start: u64, chunk_size: u32) -> Result<Self> {
        let string_count = r.read_u32::<LittleEndian>()?;
        let style_count = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let strings_start = r.read_u32::<LittleEndian>()?;
        let styles_start = r.read_u32::<LittleEndian>()?;
        let utf8 = flags & UTF8_FLAG != 0;

        let mut string_offsets = Vec::with_capacity(string_count as usize);
        for _ in 0..string_count {
            string_offsets.push(r.read_u32::<LittleEndian>()?);
        }
        let mut style_offsets = Vec::with_capacity(style_count as usize);
        for _ in 0..style_count {
            style_offsets.push(r.read_u32::<LittleEndian>()?);
        }

        let mut strings = Vec::with_capacity(string_count as usize);
        for offset in &string_offsets {
            r.seek(SeekFrom::Start(
                chunk_start + strings_start as u64 + *offset as u64,
            ))?;
            strings.push(if utf8 {
                read_utf8_entry(r)?
            } else {
                read_utf16_entry(r)?
            });
        }

        let mut styles = Vec::with_capacity(style_count as usize);
        for offset in &style_offsets {
            r.seek(SeekFrom::Start(
                chunk_start + styles_start as u64 + *offset as u64,
            ))?;
            let mut spans = vec![];
            while let Some(span) = ResSpan::read(r)? {
                spans.push(span);
            }
            styles.push(spans);
        }

        r.seek(SeekFrom::Start(chunk_start + chunk_size as u64))?;
        Ok(Self {
            utf8,
            strings,
            styles,
        })
    }

    fn write<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        let chunk_start = w.stream_position()?;
        // Header and index arrays are back-filled once the data offsets are
        // known, mirroring how the chunk sizes themselves are back-filled.
        ResChunkHeader::default().write(w)?;
        for _ in 0..5 {
            w.write_u32::<LittleEndian>(0)?;
        }
        let index_start = w.stream_position()?;
        for _ in 0..self.strings.len() + self.styles.len() {
            w.write_u32::<LittleEndian>(0)?;
        }

        let strings_start = w.stream_position()?;
        let mut offsets = Vec::with_capacity(self.strings.len() + self.styles.len());
        for string in &self.strings {
            offsets.push((w.stream_position()? - strings_start) as u32);
            if self.utf8 {
                write_utf8_entry(w, string)?;
            } else {
                write_utf16_entry(w, string)?;
            }
        }
        while w.stream_position()? % 4 != 0 {
            w.write_u8(0)?;
        }

        let styles_start = w.stream_position()?;
        for style in &self.styles {
            offsets.push((w.stream_position()? - styles_start) as u32);
            for span in style {
                span.write(w)?;
            }
            w.write_i32::<LittleEndian>(-1)?;
        }
        while w.stream_position()? % 4 != 0 {
            w.write_u8(0)?;
        }
        let chunk_end = w.stream_position()?;

        w.seek(SeekFrom::Start(chunk_start))?;
        ResChunkHeader {
            ty: ChunkType::StringPool as u16,
            header_size: 28,
            size: (chunk_end - chunk_start) as u32,
        }
        .write(w)?;
        w.write_u32::<LittleEndian>(self.strings.len() as u32)?;
        w.write_u32::<LittleEndian>(self.styles.len() as u32)?;
        // The sorted flag is intentionally dropped: patched pools gain
        // appended entries and are no longer sorted.
        w.write_u32::<LittleEndian>(if self.utf8 { UTF8_FLAG } else { 0 })?;
        w.write_u32::<LittleEndian>((strings_start - chunk_start) as u32)?;
        w.write_u32::<LittleEndian>(if self.styles.is_empty() {
            0
        } else {
            (styles_start - chunk_start) as u32
        })?;
        debug_assert_eq!(w.stream_position()?, index_start);
        for offset in offsets {
            w.write_u32::<LittleEndian>(offset)?;
        }
        w.seek(SeekFrom::Start(chunk_end))?;
        Ok(())
    }
}

/// Length prefixes use a high-bit escape: values above 0x7f (UTF-8) or
/// 0x7fff (UTF-16) spill into a second byte/unit.
fn read_utf8_len(r: &mut impl Read) -> Result<usize> {
    let b0 = r.read_u8()? as usize;
    Ok(if b0 & 0x80 != 0 {
        ((b0 & 0x7f) << 8) | r.read_u8()? as usize
    } else {
        b0
    })
}

fn write_utf8_len(w: &mut impl Write, len: usize) -> Result<()> {
    if len > 0x7f {
        w.write_u8((len >> 8) as u8 | 0x80)?;
    }
    w.write_u8(len as u8)?;
    Ok(())
}

fn read_utf16_len(r: &mut impl Read) -> Result<usize> {
    let u0 = r.read_u16::<LittleEndian>()? as usize;
    Ok(if u0 & 0x8000 != 0 {
        ((u0 & 0x7fff) << 16) | r.read_u16::<LittleEndian>()? as usize
    } else {
        u0
    })
}

fn write_utf16_len(w: &mut impl Write, len: usize) -> Result<()> {
    if len > 0x7fff {
        w.write_u16::<LittleEndian>((len >> 16) as u16 | 0x8000)?;
    }
    w.write_u16::<LittleEndian>(len as u16)?;
    Ok(())
}

fn read_utf8_entry(r: &mut impl Read) -> Result<String> {
    let _chars = read_utf8_len(r)?;
    let bytes = read_utf8_len(r)?;
    let mut buf = vec![0; bytes];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).context("invalid UTF-8 string pool entry")
}

fn write_utf8_entry(w: &mut impl Write, s: &str) -> Result<()> {
    write_utf8_len(w, s.chars().count())?;
    write_utf8_len(w, s.len())?;
    w.write_all(s.as_bytes())?;
    w.write_u8(0)?;
    Ok(())
}

fn read_utf16_entry(r: &mut impl Read) -> Result<String> {
    let units = read_utf16_len(r)?;
    let mut buf = Vec::with_capacity(units);
    for _ in 0..units {
        buf.push(r.read_u16::<LittleEndian>()?);
    }
    String::from_utf16(&buf).context("invalid UTF-16 string pool entry")
}

fn write_utf16_entry(w: &mut impl Write, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    write_utf16_len(w, units.len())?;
    for unit in &units {
        w.write_u16::<LittleEndian>(*unit)?;
    }
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResSpan {
    pub name: i32,
    pub first_char: u32,
    pub last_char: u32,
}

impl ResSpan {
    pub fn read(r: &mut impl Read) -> Result<Option<Self>> {
        let name = r.read_i32::<LittleEndian>()?;
        if name == -1 {
            return Ok(None);
        }
        let first_char = r.read_u32::<LittleEndian>()?;
        let last_char = r.read_u32::<LittleEndian>()?;
        Ok(Some(Self {
            name,
            first_char,
            last_char,
        }))
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_u32::<LittleEndian>(self.first_char)?;
        w.write_u32::<LittleEndian>(self.last_char)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlNodeHeader {
    pub line_number: u32,
    pub comment: i32,
}

impl Default for ResXmlNodeHeader {
    fn default() -> Self {
        Self {
            line_number: 1,
            comment: -1,
        }
    }
}

impl ResXmlNodeHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let line_number = r.read_u32::<LittleEndian>()?;
        let comment = r.read_i32::<LittleEndian>()?;
        Ok(Self {
            line_number,
            comment,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.line_number)?;
        w.write_i32::<LittleEndian>(self.comment)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlNamespace {
    pub prefix: i32,
    pub uri: i32,
}

impl ResXmlNamespace {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let prefix = r.read_i32::<LittleEndian>()?;
        let uri = r.read_i32::<LittleEndian>()?;
        Ok(Self { prefix, uri })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.prefix)?;
        w.write_i32::<LittleEndian>(self.uri)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlStartElement {
    /// String index of the element namespace, -1 for none.
    pub namespace: i32,
    /// String index of the element name.
    pub name: i32,
    /// Byte offset from the start of this structure to the attribute array.
    pub attribute_start: u16,
    /// Size of one attribute structure.
    pub attribute_size: u16,
    pub attribute_count: u16,
    /// Index (1-based) of the "id" attribute. 0 if none.
    pub id_index: u16,
    /// Index (1-based) of the "class" attribute. 0 if none.
    pub class_index: u16,
    /// Index (1-based) of the "style" attribute. 0 if none.
    pub style_index: u16,
}

impl Default for ResXmlStartElement {
    fn default() -> Self {
        Self {
            namespace: -1,
            name: -1,
            attribute_start: 0x0014,
            attribute_size: 0x0014,
            attribute_count: 0,
            id_index: 0,
            class_index: 0,
            style_index: 0,
        }
    }
}

impl ResXmlStartElement {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        let attribute_start = r.read_u16::<LittleEndian>()?;
        let attribute_size = r.read_u16::<LittleEndian>()?;
        let attribute_count = r.read_u16::<LittleEndian>()?;
        let id_index = r.read_u16::<LittleEndian>()?;
        let class_index = r.read_u16::<LittleEndian>()?;
        let style_index = r.read_u16::<LittleEndian>()?;
        Ok(Self {
            namespace,
            name,
            attribute_start,
            attribute_size,
            attribute_count,
            id_index,
            class_index,
            style_index,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_u16::<LittleEndian>(self.attribute_start)?;
        w.write_u16::<LittleEndian>(self.attribute_size)?;
        w.write_u16::<LittleEndian>(self.attribute_count)?;
        w.write_u16::<LittleEndian>(self.id_index)?;
        w.write_u16::<LittleEndian>(self.class_index)?;
        w.write_u16::<LittleEndian>(self.style_index)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlEndElement {
    pub namespace: i32,
    pub name: i32,
}

impl ResXmlEndElement {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        Ok(Self { namespace, name })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResValueType {
    Null = 0x00,
    Reference = 0x01,
    String = 0x03,
    IntDec = 0x10,
    IntBoolean = 0x12,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResValue {
    pub size: u16,
    pub res0: u8,
    pub data_type: u8,
    pub data: u32,
}

impl ResValue {
    pub fn string(index: u32) -> Self {
        Self {
            size: 8,
            res0: 0,
            data_type: ResValueType::String as u8,
            data: index,
        }
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let size = r.read_u16::<LittleEndian>()?;
        let res0 = r.read_u8()?;
        let data_type = r.read_u8()?;
        let data = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            size,
            res0,
            data_type,
            data,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.size)?;
        w.write_u8(self.res0)?;
        w.write_u8(self.data_type)?;
        w.write_u32::<LittleEndian>(self.data)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlAttribute {
    pub namespace: i32,
    pub name: i32,
    /// String index of the raw textual value, -1 if the value is not a
    /// string.
    pub raw_value: i32,
    pub typed_value: ResValue,
}

impl ResXmlAttribute {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        let raw_value = r.read_i32::<LittleEndian>()?;
        let typed_value = ResValue::read(r)?;
        Ok(Self {
            namespace,
            name,
            raw_value,
            typed_value,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_i32::<LittleEndian>(self.raw_value)?;
        self.typed_value.write(w)?;
        Ok(())
    }
}

/// One chunk of a compiled XML document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Chunk {
    Null,
    StringPool(StringPool),
    Xml(Vec<Chunk>),
    XmlResourceMap(Vec<u32>),
    XmlStartNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlEndNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlStartElement(ResXmlNodeHeader, ResXmlStartElement, Vec<ResXmlAttribute>),
    XmlEndElement(ResXmlNodeHeader, ResXmlEndElement),
}

impl Chunk {
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let start_pos = r.stream_position()?;
        let header = ResChunkHeader::read(r)?;
        let end_pos = start_pos + header.size as u64;
        let chunk = match ChunkType::from_u16(header.ty) {
            Some(ChunkType::Null) => Chunk::Null,
            Some(ChunkType::StringPool) => {
                Chunk::StringPool(StringPool::parse(r, start_pos, header.size)?)
            }
            Some(ChunkType::Xml) => {
                let mut chunks = vec![];
                while r.stream_position()? < end_pos {
                    chunks.push(Chunk::parse(r)?);
                }
                Chunk::Xml(chunks)
            }
            Some(ChunkType::XmlResourceMap) => {
                let count = (header.size as usize - header.header_size as usize) / 4;
                let mut map = Vec::with_capacity(count);
                for _ in 0..count {
                    map.push(r.read_u32::<LittleEndian>()?);
                }
                Chunk::XmlResourceMap(map)
            }
            Some(ChunkType::XmlStartNamespace) => {
                let node = ResXmlNodeHeader::read(r)?;
                let ns = ResXmlNamespace::read(r)?;
                Chunk::XmlStartNamespace(node, ns)
            }
            Some(ChunkType::XmlEndNamespace) => {
                let node = ResXmlNodeHeader::read(r)?;
                let ns = ResXmlNamespace::read(r)?;
                Chunk::XmlEndNamespace(node, ns)
            }
            Some(ChunkType::XmlStartElement) => {
                let node = ResXmlNodeHeader::read(r)?;
                let body_start = r.stream_position()?;
                let el = ResXmlStartElement::read(r)?;
                let mut attributes = Vec::with_capacity(el.attribute_count as usize);
                for i in 0..el.attribute_count {
                    // attribute_start/attribute_size are honored rather than
                    // assumed, some compilers pad the element body.
                    r.seek(SeekFrom::Start(
                        body_start
                            + el.attribute_start as u64
                            + el.attribute_size as u64 * i as u64,
                    ))?;
                    attributes.push(ResXmlAttribute::read(r)?);
                }
                Chunk::XmlStartElement(node, el, attributes)
            }
            Some(ChunkType::XmlEndElement) => {
                let node = ResXmlNodeHeader::read(r)?;
                let el = ResXmlEndElement::read(r)?;
                Chunk::XmlEndElement(node, el)
            }
            None => bail!("unrecognized chunk {:?}", header),
        };
        r.seek(SeekFrom::Start(end_pos))?;
        Ok(chunk)
    }

    pub fn write<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        match self {
            Chunk::Null => {}
            Chunk::StringPool(pool) => pool.write(w)?,
            Chunk::Xml(chunks) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::Xml, w)?;
                chunk.end_header(w)?;
                for chunk in chunks {
                    chunk.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlResourceMap(map) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlResourceMap, w)?;
                chunk.end_header(w)?;
                for entry in map {
                    w.write_u32::<LittleEndian>(*entry)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlStartNamespace(node, ns) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlStartNamespace, w)?;
                node.write(w)?;
                chunk.end_header(w)?;
                ns.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlEndNamespace(node, ns) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlEndNamespace, w)?;
                node.write(w)?;
                chunk.end_header(w)?;
                ns.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlStartElement(node, el, attributes) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlStartElement, w)?;
                node.write(w)?;
                chunk.end_header(w)?;
                let el = ResXmlStartElement {
                    attribute_start: 0x0014,
                    attribute_size: 0x0014,
                    attribute_count: attributes.len() as u16,
                    ..*el
                };
                el.write(w)?;
                for attr in attributes {
                    attr.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlEndElement(node, el) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlEndElement, w)?;
                node.write(w)?;
                chunk.end_header(w)?;
                el.write(w)?;
                chunk.end_chunk(w)?;
            }
        }
        Ok(())
    }
}

/// Back-fills the chunk header once the chunk body has been written and its
/// true size is known.
struct ChunkWriter {
    ty: ChunkType,
    start_chunk: u64,
    end_header: u64,
}

impl ChunkWriter {
    fn start_chunk<W: Write + Seek>(ty: ChunkType, w: &mut W) -> Result<Self> {
        let start_chunk = w.stream_position()?;
        ResChunkHeader::default().write(w)?;
        Ok(Self {
            ty,
            start_chunk,
            end_header: 0,
        })
    }

    fn end_header<W: Write + Seek>(&mut self, w: &mut W) -> Result<()> {
        self.end_header = w.stream_position()?;
        Ok(())
    }

    fn end_chunk<W: Write + Seek>(self, w: &mut W) -> Result<()> {
        assert_ne!(self.end_header, 0);
        let end_chunk = w.stream_position()?;
        let header = ResChunkHeader {
            ty: self.ty as u16,
            header_size: (self.end_header - self.start_chunk) as u16,
            size: (end_chunk - self.start_chunk) as u32,
        };
        w.seek(SeekFrom::Start(self.start_chunk))?;
        header.write(w)?;
        w.seek(SeekFrom::Start(end_chunk))?;
        Ok(())
    }
}
