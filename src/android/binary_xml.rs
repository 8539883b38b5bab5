//! Compiled `AndroidManifest.xml` (Android binary XML) reader and writer.
//!
//! The decoder accepts both UTF-8 and UTF-16 string pools and keeps the
//! resource-id of every attribute that the resource map assigns one to. The
//! encoder always emits a fresh UTF-16 pool with the id-bearing attribute
//! names packed at the front, followed by the resource map that covers them.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::BTreeMap;
use thiserror::Error;

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

const NODE_HEADER_SIZE: u16 = 16;
const ATTRIBUTE_SIZE: u16 = 20;
const RES_VALUE_SIZE: u16 = 8;

/// Namespace URI of the `android:` attribute prefix.
pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";

/// Root element name every manifest must carry.
pub const MANIFEST_ROOT: &str = "manifest";

/// Result alias for binary XML operations.
pub type BinaryXmlResult<T> = Result<T, BinaryXmlError>;

/// Errors surfaced by the binary XML reader and writer.
#[derive(Debug, Error)]
pub enum BinaryXmlError {
    #[error("malformed binary XML: {0}")]
    Malformed(String),

    #[error("unexpected root element <{0}>, expected <manifest>")]
    UnexpectedRoot(String),

    #[error("{0}")]
    Encode(String),

    #[error("XML error: {0}")]
    Xml(String),
}

fn malformed(msg: impl Into<String>) -> BinaryXmlError {
    BinaryXmlError::Malformed(msg.into())
}

fn xml_error(err: impl std::fmt::Display) -> BinaryXmlError {
    BinaryXmlError::Xml(err.to_string())
}

/// The `Res_value::dataType` tag of an attribute value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Reference,
    String,
    Float,
    IntDec,
    IntHex,
    Boolean,
    Other(u8),
}

impl ValueType {
    pub fn from_u8(tag: u8) -> Self {
        match tag {
            0x00 => ValueType::Null,
            0x01 => ValueType::Reference,
            0x03 => ValueType::String,
            0x04 => ValueType::Float,
            0x10 => ValueType::IntDec,
            0x11 => ValueType::IntHex,
            0x12 => ValueType::Boolean,
            other => ValueType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ValueType::Null => 0x00,
            ValueType::Reference => 0x01,
            ValueType::String => 0x03,
            ValueType::Float => 0x04,
            ValueType::IntDec => 0x10,
            ValueType::IntHex => 0x11,
            ValueType::Boolean => 0x12,
            ValueType::Other(tag) => tag,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, ValueType::IntDec | ValueType::IntHex)
    }
}

/// Typed payload of an attribute.
///
/// The tag and the 32-bit payload live in one variant so a setter can never
/// update one without the other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeValue {
    Null,
    String(String),
    Reference(u32),
    Boolean(bool),
    /// `IntDec` or `IntHex`; `data` holds the raw 32 bits.
    Integer { data: u32, value_type: ValueType },
    /// Any other tag (floats, dimensions, colors...) carried through untouched.
    Raw { value_type: ValueType, data: u32 },
}

impl AttributeValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            AttributeValue::Null => ValueType::Null,
            AttributeValue::String(_) => ValueType::String,
            AttributeValue::Reference(_) => ValueType::Reference,
            AttributeValue::Boolean(_) => ValueType::Boolean,
            AttributeValue::Integer { value_type, .. } => *value_type,
            AttributeValue::Raw { value_type, .. } => *value_type,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            AttributeValue::Integer { data, .. } => Some(*data as i32),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<u32> {
        match self {
            AttributeValue::Reference(id) => Some(*id),
            _ => None,
        }
    }

    /// Payload as written into `Res_value::data` (string index excluded).
    fn data_word(&self) -> u32 {
        match self {
            AttributeValue::Null | AttributeValue::String(_) => 0,
            AttributeValue::Reference(id) => *id,
            AttributeValue::Boolean(true) => 0xFFFF_FFFF,
            AttributeValue::Boolean(false) => 0,
            AttributeValue::Integer { data, .. } => *data,
            AttributeValue::Raw { data, .. } => *data,
        }
    }
}

/// One attribute of an element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlAttribute {
    pub namespace: Option<String>,
    pub name: String,
    pub resource_id: Option<u32>,
    value: AttributeValue,
    /// Original textual form kept for non-string values (`rawValue`).
    raw: Option<String>,
}

impl XmlAttribute {
    pub fn new(namespace: Option<&str>, name: impl Into<String>, resource_id: Option<u32>) -> Self {
        XmlAttribute {
            namespace: namespace.map(str::to_string),
            name: name.into(),
            resource_id,
            value: AttributeValue::Null,
            raw: None,
        }
    }

    /// Attribute in the `android:` namespace keyed by a framework resource id.
    pub fn android(name: impl Into<String>, resource_id: u32) -> Self {
        XmlAttribute::new(Some(ANDROID_NAMESPACE_URI), name, Some(resource_id))
    }

    pub fn value(&self) -> &AttributeValue {
        &self.value
    }

    pub fn raw_text(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn set_string(&mut self, value: impl Into<String>) -> &mut Self {
        self.value = AttributeValue::String(value.into());
        self.raw = None;
        self
    }

    pub fn set_bool(&mut self, value: bool) -> &mut Self {
        self.value = AttributeValue::Boolean(value);
        self.raw = None;
        self
    }

    pub fn set_reference(&mut self, resource: u32) -> &mut Self {
        self.value = AttributeValue::Reference(resource);
        self.raw = None;
        self
    }

    /// Store an integer under an explicit integer tag. Any tag other than
    /// `IntDec`/`IntHex` is refused.
    pub fn set_int_with_type(
        &mut self,
        value: i32,
        value_type: ValueType,
    ) -> BinaryXmlResult<&mut Self> {
        if !value_type.is_integer() {
            return Err(BinaryXmlError::Encode(format!(
                "attribute '{}' cannot hold an integer as {:?}",
                self.name, value_type
            )));
        }
        self.value = AttributeValue::Integer {
            data: value as u32,
            value_type,
        };
        self.raw = None;
        Ok(self)
    }

    fn is_plain(&self, name: &str) -> bool {
        self.namespace.is_none() && self.name == name
    }
}

/// Element node of the manifest tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlElement {
    pub namespace: Option<String>,
    pub name: String,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlElement>,
    pub text: Option<String>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        XmlElement {
            namespace: None,
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    /// Find an attribute by its framework resource id.
    pub fn search_attribute(&self, resource_id: u32) -> Option<&XmlAttribute> {
        self.attributes
            .iter()
            .find(|attr| attr.resource_id == Some(resource_id))
    }

    pub fn search_attribute_mut(&mut self, resource_id: u32) -> Option<&mut XmlAttribute> {
        self.attributes
            .iter_mut()
            .find(|attr| attr.resource_id == Some(resource_id))
    }

    /// Find an attribute by namespace URI and local name.
    pub fn find_attribute(&self, namespace: Option<&str>, name: &str) -> Option<&XmlAttribute> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name && attr.namespace.as_deref() == namespace)
    }

    /// Look an `android:` attribute up by id first, then by name. Producers
    /// that strip the resource map only leave the name behind.
    pub fn android_attribute(&self, resource_id: u32, name: &str) -> Option<&XmlAttribute> {
        self.search_attribute(resource_id)
            .or_else(|| self.find_attribute(Some(ANDROID_NAMESPACE_URI), name))
    }

    /// Return the matching attribute, inserting a `Null` one if none exists.
    ///
    /// New id-bearing attributes are kept in ascending id order ahead of any
    /// attribute without an id, which is the order the platform expects.
    pub fn create_attribute(
        &mut self,
        namespace: Option<&str>,
        name: &str,
        resource_id: Option<u32>,
    ) -> &mut XmlAttribute {
        let existing = self.attributes.iter().position(|attr| match resource_id {
            Some(id) if attr.resource_id == Some(id) => true,
            _ => attr.name == name && attr.namespace.as_deref() == namespace,
        });
        let idx = match existing {
            Some(idx) => idx,
            None => {
                let attr = XmlAttribute::new(namespace, name, resource_id);
                let position = match resource_id {
                    Some(id) => self
                        .attributes
                        .iter()
                        .position(|other| other.resource_id.map_or(true, |other_id| other_id > id))
                        .unwrap_or(self.attributes.len()),
                    None => self.attributes.len(),
                };
                self.attributes.insert(position, attr);
                position
            }
        };
        &mut self.attributes[idx]
    }

    /// Shorthand for [`create_attribute`](Self::create_attribute) in the `android:` namespace.
    pub fn android_attribute_mut(&mut self, name: &str, resource_id: u32) -> &mut XmlAttribute {
        self.create_attribute(Some(ANDROID_NAMESPACE_URI), name, Some(resource_id))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |child| child.name == name)
    }

    pub fn find_child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn find_child_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        self.children.iter_mut().find(|child| child.name == name)
    }

    /// Append a child after all existing siblings and hand it back.
    pub fn append_child(&mut self, child: XmlElement) -> &mut XmlElement {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    fn special_index(&self, name: &str) -> u16 {
        self.attributes
            .iter()
            .position(|attr| attr.is_plain(name))
            .map_or(0, |idx| idx as u16 + 1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct NamespaceDecl {
    prefix: String,
    uri: String,
}

/// A decoded `AndroidManifest.xml`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestDocument {
    namespaces: Vec<NamespaceDecl>,
    root: XmlElement,
}

impl ManifestDocument {
    /// Empty `<manifest>` with the `android` namespace declared.
    pub fn new() -> Self {
        ManifestDocument {
            namespaces: vec![NamespaceDecl {
                prefix: "android".to_string(),
                uri: ANDROID_NAMESPACE_URI.to_string(),
            }],
            root: XmlElement::new(MANIFEST_ROOT),
        }
    }

    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut XmlElement {
        &mut self.root
    }

    pub fn package_name(&self) -> Option<&str> {
        self.root
            .find_attribute(None, "package")
            .and_then(|attr| attr.value().as_str())
    }

    pub fn decode(bytes: &[u8]) -> BinaryXmlResult<Self> {
        let mut reader = BinaryReader::new(bytes);
        let xml_header = read_chunk_header(&mut reader)?;
        if xml_header.chunk_type != RES_XML_TYPE {
            return Err(malformed("document does not start with RES_XML_TYPE"));
        }
        let xml_end = xml_header.end();
        reader.seek(xml_header.start + xml_header.header_size as usize)?;

        let mut resource_map: Vec<u32> = Vec::new();
        let mut pool: Option<StringPool> = None;
        let mut namespaces: Vec<NamespaceDecl> = Vec::new();
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        while reader.position() + 8 <= xml_end {
            let header = read_chunk_header(&mut reader)?;
            let chunk_end = header.end();
            match header.chunk_type {
                RES_STRING_POOL_TYPE => {
                    pool = Some(StringPool::parse(&mut reader, &header)?);
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    reader.seek(header.start + header.header_size as usize)?;
                    resource_map.clear();
                    while reader.position() + 4 <= chunk_end {
                        resource_map.push(reader.read_u32()?);
                    }
                }
                RES_XML_START_NAMESPACE_TYPE => {
                    let pool = pool
                        .as_ref()
                        .ok_or_else(|| malformed("namespace chunk before string pool"))?;
                    reader.seek(header.start + header.header_size as usize)?;
                    let prefix = pool.get(reader.read_u32()?).unwrap_or_default().to_string();
                    let uri = pool
                        .get(reader.read_u32()?)
                        .ok_or_else(|| malformed("namespace without URI"))?
                        .to_string();
                    let decl = NamespaceDecl { prefix, uri };
                    if !namespaces.contains(&decl) {
                        namespaces.push(decl);
                    }
                }
                RES_XML_END_NAMESPACE_TYPE => {}
                RES_XML_START_ELEMENT_TYPE => {
                    let pool = pool
                        .as_ref()
                        .ok_or_else(|| malformed("start element before string pool"))?;
                    let element = read_start_element(&mut reader, &header, pool, &resource_map)?;
                    stack.push(element);
                }
                RES_XML_END_ELEMENT_TYPE => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| malformed("end element without matching start"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => return Err(malformed("multiple root elements")),
                    }
                }
                RES_XML_CDATA_TYPE => {
                    let pool = pool
                        .as_ref()
                        .ok_or_else(|| malformed("CDATA before string pool"))?;
                    reader.seek(header.start + header.header_size as usize)?;
                    let text = pool.get(reader.read_u32()?).map(str::to_string);
                    if let (Some(text), Some(current)) = (text, stack.last_mut()) {
                        current.text = Some(text);
                    }
                }
                _ => {
                    // Unknown chunk, skipped.
                }
            }
            reader.seek(chunk_end)?;
        }

        if !stack.is_empty() {
            return Err(malformed("unclosed elements at end of document"));
        }
        let root = root.ok_or_else(|| malformed("document has no root element"))?;
        if root.name != MANIFEST_ROOT {
            return Err(BinaryXmlError::UnexpectedRoot(root.name));
        }
        Ok(ManifestDocument { namespaces, root })
    }

    pub fn encode(&self) -> BinaryXmlResult<Vec<u8>> {
        let namespaces = self.effective_namespaces();

        let mut pool = StringPoolBuilder::new();
        collect_mapped_names(&self.root, &mut pool);
        for decl in &namespaces {
            pool.intern(&decl.prefix);
            pool.intern(&decl.uri);
        }
        collect_plain_strings(&self.root, &mut pool);

        let mut body = Vec::new();
        for decl in &namespaces {
            write_namespace_chunk(&mut body, &pool, decl, RES_XML_START_NAMESPACE_TYPE)?;
        }
        write_element_recursive(&mut body, &self.root, &pool)?;
        for decl in namespaces.iter().rev() {
            write_namespace_chunk(&mut body, &pool, decl, RES_XML_END_NAMESPACE_TYPE)?;
        }

        let mut document = Vec::new();
        let xml_start = begin_chunk(&mut document, RES_XML_TYPE, 8);
        document.extend_from_slice(&pool.to_chunk());
        document.extend_from_slice(&pool.resource_map_chunk());
        document.extend_from_slice(&body);
        finalize_chunk(&mut document, xml_start);
        Ok(document)
    }

    /// Render the tree as indented text XML.
    pub fn to_xml_string(&self) -> BinaryXmlResult<String> {
        let namespaces = self.effective_namespaces();
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(xml_error)?;
        write_element_xml(&mut writer, &self.root, &namespaces, true)?;
        String::from_utf8(writer.into_inner()).map_err(xml_error)
    }

    /// Declared namespaces plus any URI used in the tree but never declared.
    fn effective_namespaces(&self) -> Vec<NamespaceDecl> {
        let mut namespaces = self.namespaces.clone();
        let mut used = Vec::new();
        collect_namespace_uris(&self.root, &mut used);
        for uri in used {
            if namespaces.iter().any(|decl| decl.uri == uri) {
                continue;
            }
            let prefix = if uri == ANDROID_NAMESPACE_URI {
                "android".to_string()
            } else {
                format!("ns{}", namespaces.len())
            };
            namespaces.push(NamespaceDecl { prefix, uri });
        }
        namespaces
    }
}

impl Default for ManifestDocument {
    fn default() -> Self {
        ManifestDocument::new()
    }
}

fn collect_namespace_uris(element: &XmlElement, out: &mut Vec<String>) {
    let uris = element
        .namespace
        .iter()
        .chain(element.attributes.iter().filter_map(|attr| attr.namespace.as_ref()));
    for uri in uris {
        if !out.contains(uri) {
            out.push(uri.clone());
        }
    }
    for child in &element.children {
        collect_namespace_uris(child, out);
    }
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take<const N: usize>(&mut self) -> BinaryXmlResult<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| malformed("unexpected end of binary XML"))?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> BinaryXmlResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn read_u16(&mut self) -> BinaryXmlResult<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn read_u32(&mut self) -> BinaryXmlResult<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn seek(&mut self, offset: usize) -> BinaryXmlResult<()> {
        if offset > self.data.len() {
            return Err(malformed("attempted to seek past end of document"));
        }
        self.pos = offset;
        Ok(())
    }
}

fn read_chunk_header(reader: &mut BinaryReader<'_>) -> BinaryXmlResult<ChunkHeader> {
    let start = reader.position();
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if header_size < 8 || chunk_size < header_size as u32 {
        return Err(malformed(format!(
            "invalid sizing in chunk 0x{chunk_type:04x} at offset {start}"
        )));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| malformed("chunk size overflow"))?;
    if end > reader.data.len() {
        return Err(malformed("chunk extends past end of document"));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

fn read_start_element(
    reader: &mut BinaryReader<'_>,
    header: &ChunkHeader,
    pool: &StringPool,
    resource_map: &[u32],
) -> BinaryXmlResult<XmlElement> {
    let ext_start = header.start + header.header_size as usize;
    reader.seek(ext_start)?;
    let ns_idx = reader.read_u32()?;
    let name_idx = reader.read_u32()?;
    let attribute_start = reader.read_u16()? as usize;
    let attribute_size = reader.read_u16()? as usize;
    let attribute_count = reader.read_u16()? as usize;
    if attribute_count > 0 && attribute_size < ATTRIBUTE_SIZE as usize {
        return Err(malformed("attribute records are too small"));
    }

    let name = pool
        .get(name_idx)
        .ok_or_else(|| malformed("element name references invalid string index"))?;
    let mut element = XmlElement::new(name);
    element.namespace = pool.get(ns_idx).map(str::to_string);

    for i in 0..attribute_count {
        let record = ext_start + attribute_start + i * attribute_size;
        if record + ATTRIBUTE_SIZE as usize > header.end() {
            return Err(malformed("attribute record extends past its chunk"));
        }
        reader.seek(record)?;
        let attr_ns_idx = reader.read_u32()?;
        let attr_name_idx = reader.read_u32()?;
        let raw_idx = reader.read_u32()?;
        let value_size = reader.read_u16()?;
        reader.read_u8()?; // res0
        let data_type = reader.read_u8()?;
        let data = reader.read_u32()?;
        if value_size != RES_VALUE_SIZE {
            return Err(malformed("attribute value size must be 8"));
        }
        let attr_name = pool
            .get(attr_name_idx)
            .ok_or_else(|| malformed("attribute name references invalid string index"))?;
        let resource_id = resource_map
            .get(attr_name_idx as usize)
            .copied()
            .filter(|id| *id != 0);
        let raw = pool.get(raw_idx).map(str::to_string);
        let value = decode_value(pool, raw.as_deref(), ValueType::from_u8(data_type), data)?;
        element.attributes.push(XmlAttribute {
            namespace: pool.get(attr_ns_idx).map(str::to_string),
            name: attr_name.to_string(),
            resource_id,
            raw: if matches!(value, AttributeValue::String(_)) { None } else { raw },
            value,
        });
    }
    Ok(element)
}

fn decode_value(
    pool: &StringPool,
    raw: Option<&str>,
    value_type: ValueType,
    data: u32,
) -> BinaryXmlResult<AttributeValue> {
    Ok(match value_type {
        ValueType::String => {
            let text = pool
                .get(data)
                .or(raw)
                .ok_or_else(|| malformed("string value references missing pool entry"))?;
            AttributeValue::String(text.to_string())
        }
        ValueType::Reference => AttributeValue::Reference(data),
        ValueType::Boolean => AttributeValue::Boolean(data != 0),
        ValueType::IntDec | ValueType::IntHex => AttributeValue::Integer { data, value_type },
        ValueType::Null if data == 0 && raw.is_some() => {
            // aapt leaves some literal strings untyped with only rawValue set.
            AttributeValue::String(raw.unwrap_or_default().to_string())
        }
        ValueType::Null if data == 0 => AttributeValue::Null,
        other => AttributeValue::Raw {
            value_type: other,
            data,
        },
    })
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> BinaryXmlResult<Self> {
        let string_count = reader.read_u32()? as usize;
        let _style_count = reader.read_u32()?;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let _styles_start = reader.read_u32()?;
        reader.seek(header.start + header.header_size as usize)?;

        let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;
        let chunk_end = header.end();
        if string_count > (chunk_end - reader.position()) / 4 {
            return Err(malformed("string pool count exceeds chunk"));
        }

        let mut offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            offsets.push(reader.read_u32()? as usize);
        }

        let strings_base = header.start + strings_start;
        let mut strings = Vec::with_capacity(string_count);
        for offset in offsets {
            let absolute = strings_base + offset;
            let text = if is_utf8 {
                read_utf8_string(reader.data, absolute, chunk_end)?
            } else {
                read_utf16_string(reader.data, absolute, chunk_end)?
            };
            strings.push(text);
        }
        Ok(StringPool { strings })
    }

    fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(String::as_str)
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    // Character count first, then byte count.
    let (_, char_len_size) = read_utf8_length(data, offset, limit)?;
    let mut cursor = offset + char_len_size;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        return Err(malformed("UTF-8 string exceeds chunk bounds"));
    }
    // Some producers emit modified UTF-8; degrade lossily instead of failing.
    Ok(String::from_utf8_lossy(&data[cursor..cursor + byte_len]).into_owned())
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset >= limit {
        return Err(malformed("invalid UTF-8 length offset"));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        return Ok((first as usize, 1));
    }
    if offset + 1 >= limit {
        return Err(malformed("truncated UTF-8 length"));
    }
    let length = (((first & 0x7F) as usize) << 8) | data[offset + 1] as usize;
    Ok((length, 2))
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let (char_count, header_bytes) = read_utf16_length(data, offset, limit)?;
    let cursor = offset + header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len > limit {
        return Err(malformed("UTF-16 string exceeds chunk bounds"));
    }
    let units: Vec<u16> = data[cursor..cursor + byte_len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(malformed("invalid UTF-16 length offset"));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        return Ok((first as usize, 2));
    }
    if offset + 4 > limit {
        return Err(malformed("truncated UTF-16 length"));
    }
    let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
    Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
}

/// Pool under construction. Id-bearing attribute names occupy the first
/// `mapped.len()` slots so the resource map can index them.
struct StringPoolBuilder {
    strings: Vec<String>,
    mapped: Vec<u32>,
    mapped_indices: BTreeMap<(String, u32), u32>,
    plain_indices: BTreeMap<String, u32>,
}

impl StringPoolBuilder {
    fn new() -> Self {
        StringPoolBuilder {
            strings: Vec::new(),
            mapped: Vec::new(),
            mapped_indices: BTreeMap::new(),
            plain_indices: BTreeMap::new(),
        }
    }

    fn intern_mapped(&mut self, name: &str, resource_id: u32) {
        let key = (name.to_string(), resource_id);
        if self.mapped_indices.contains_key(&key) {
            return;
        }
        debug_assert!(self.plain_indices.is_empty());
        let idx = self.strings.len() as u32;
        self.strings.push(name.to_string());
        self.mapped.push(resource_id);
        self.mapped_indices.insert(key, idx);
    }

    fn intern(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.plain_indices.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.plain_indices.insert(value.to_string(), idx);
        idx
    }

    fn plain(&self, value: &str) -> BinaryXmlResult<u32> {
        self.plain_indices
            .get(value)
            .copied()
            .ok_or_else(|| BinaryXmlError::Encode(format!("string '{value}' missing from pool")))
    }

    fn attribute_name(&self, attr: &XmlAttribute) -> BinaryXmlResult<u32> {
        match attr.resource_id {
            Some(id) => self
                .mapped_indices
                .get(&(attr.name.clone(), id))
                .copied()
                .ok_or_else(|| {
                    BinaryXmlError::Encode(format!("attribute '{}' missing from pool", attr.name))
                }),
            None => self.plain(&attr.name),
        }
    }

    fn optional(&self, value: Option<&str>) -> BinaryXmlResult<u32> {
        value.map_or(Ok(NO_ENTRY_INDEX), |value| self.plain(value))
    }

    fn to_chunk(&self) -> Vec<u8> {
        let string_count = self.strings.len() as u32;
        let header_size = 28u16;
        let strings_start = header_size as u32 + string_count * 4;
        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            offsets.push(string_data.len() as u32);
            write_utf16_string(&mut string_data, s);
        }
        align_to_four(&mut string_data);

        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, RES_STRING_POOL_TYPE, header_size);
        write_u32(&mut chunk, string_count);
        write_u32(&mut chunk, 0); // style count
        write_u32(&mut chunk, 0); // flags (UTF-16)
        write_u32(&mut chunk, strings_start);
        write_u32(&mut chunk, 0); // stylesStart
        for offset in offsets {
            write_u32(&mut chunk, offset);
        }
        chunk.extend_from_slice(&string_data);
        finalize_chunk(&mut chunk, start);
        chunk
    }

    fn resource_map_chunk(&self) -> Vec<u8> {
        let mut chunk = Vec::new();
        if self.mapped.is_empty() {
            return chunk;
        }
        let start = begin_chunk(&mut chunk, RES_XML_RESOURCE_MAP_TYPE, 8);
        for id in &self.mapped {
            write_u32(&mut chunk, *id);
        }
        finalize_chunk(&mut chunk, start);
        chunk
    }
}

fn collect_mapped_names(root: &XmlElement, pool: &mut StringPoolBuilder) {
    let mut pairs = Vec::new();
    gather_mapped(root, &mut pairs);
    pairs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    for (name, id) in pairs {
        pool.intern_mapped(&name, id);
    }
}

fn gather_mapped(element: &XmlElement, out: &mut Vec<(String, u32)>) {
    for attr in &element.attributes {
        if let Some(id) = attr.resource_id {
            out.push((attr.name.clone(), id));
        }
    }
    for child in &element.children {
        gather_mapped(child, out);
    }
}

fn collect_plain_strings(element: &XmlElement, pool: &mut StringPoolBuilder) {
    if let Some(uri) = &element.namespace {
        pool.intern(uri);
    }
    pool.intern(&element.name);
    for attr in &element.attributes {
        if let Some(uri) = &attr.namespace {
            pool.intern(uri);
        }
        if attr.resource_id.is_none() {
            pool.intern(&attr.name);
        }
        if let AttributeValue::String(value) = &attr.value {
            pool.intern(value);
        }
        if let Some(raw) = &attr.raw {
            pool.intern(raw);
        }
    }
    if let Some(text) = &element.text {
        pool.intern(text);
    }
    for child in &element.children {
        collect_plain_strings(child, pool);
    }
}

fn write_namespace_chunk(
    buf: &mut Vec<u8>,
    pool: &StringPoolBuilder,
    decl: &NamespaceDecl,
    chunk_type: u16,
) -> BinaryXmlResult<()> {
    let start = begin_node(buf, chunk_type);
    write_u32(buf, pool.plain(&decl.prefix)?);
    write_u32(buf, pool.plain(&decl.uri)?);
    finalize_chunk(buf, start);
    Ok(())
}

fn write_element_recursive(
    buf: &mut Vec<u8>,
    element: &XmlElement,
    pool: &StringPoolBuilder,
) -> BinaryXmlResult<()> {
    let ns_idx = pool.optional(element.namespace.as_deref())?;
    let name_idx = pool.plain(&element.name)?;
    if element.attributes.len() > u16::MAX as usize {
        return Err(BinaryXmlError::Encode(format!(
            "<{}> has too many attributes",
            element.name
        )));
    }

    let start = begin_node(buf, RES_XML_START_ELEMENT_TYPE);
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    write_u16(buf, ATTRIBUTE_SIZE); // attributeStart
    write_u16(buf, ATTRIBUTE_SIZE);
    write_u16(buf, element.attributes.len() as u16);
    write_u16(buf, element.special_index("id"));
    write_u16(buf, element.special_index("class"));
    write_u16(buf, element.special_index("style"));
    for attr in &element.attributes {
        write_attribute(buf, attr, pool)?;
    }
    finalize_chunk(buf, start);

    if let Some(text) = &element.text {
        let idx = pool.plain(text)?;
        let start = begin_node(buf, RES_XML_CDATA_TYPE);
        write_u32(buf, idx);
        write_res_value(buf, ValueType::String, idx);
        finalize_chunk(buf, start);
    }

    for child in &element.children {
        write_element_recursive(buf, child, pool)?;
    }

    let start = begin_node(buf, RES_XML_END_ELEMENT_TYPE);
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    finalize_chunk(buf, start);
    Ok(())
}

fn write_attribute(
    buf: &mut Vec<u8>,
    attr: &XmlAttribute,
    pool: &StringPoolBuilder,
) -> BinaryXmlResult<()> {
    let ns_idx = pool.optional(attr.namespace.as_deref())?;
    let name_idx = pool.attribute_name(attr)?;
    let (raw_idx, data) = match &attr.value {
        AttributeValue::String(text) => {
            let idx = pool.plain(text)?;
            (idx, idx)
        }
        other => (pool.optional(attr.raw.as_deref())?, other.data_word()),
    };
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    write_u32(buf, raw_idx);
    write_res_value(buf, attr.value.value_type(), data);
    Ok(())
}

fn write_res_value(buf: &mut Vec<u8>, value_type: ValueType, data: u32) {
    write_u16(buf, RES_VALUE_SIZE);
    buf.push(0);
    buf.push(value_type.to_u8());
    write_u32(buf, data);
}

fn write_element_xml(
    writer: &mut Writer<Vec<u8>>,
    element: &XmlElement,
    namespaces: &[NamespaceDecl],
    is_root: bool,
) -> BinaryXmlResult<()> {
    let qualify = |uri: Option<&str>, local: &str| -> String {
        match uri.and_then(|uri| namespaces.iter().find(|decl| decl.uri == uri)) {
            Some(decl) if !decl.prefix.is_empty() => format!("{}:{}", decl.prefix, local),
            _ => local.to_string(),
        }
    };

    let element_name = qualify(element.namespace.as_deref(), &element.name);
    let mut attrs = Vec::new();
    if is_root {
        for decl in namespaces {
            let key = if decl.prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{}", decl.prefix)
            };
            attrs.push((key, decl.uri.clone()));
        }
    }
    for attr in &element.attributes {
        attrs.push((
            qualify(attr.namespace.as_deref(), &attr.name),
            value_to_text(attr),
        ));
    }

    let mut start = BytesStart::new(element_name.as_str());
    for (key, value) in &attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() && element.text.is_none() {
        writer.write_event(Event::Empty(start)).map_err(xml_error)?;
        return Ok(());
    }
    writer.write_event(Event::Start(start)).map_err(xml_error)?;
    if let Some(text) = &element.text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(xml_error)?;
    }
    for child in &element.children {
        write_element_xml(writer, child, namespaces, false)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element_name.as_str())))
        .map_err(xml_error)?;
    Ok(())
}

fn value_to_text(attr: &XmlAttribute) -> String {
    match attr.value() {
        AttributeValue::String(text) => text.clone(),
        AttributeValue::Boolean(flag) => flag.to_string(),
        AttributeValue::Reference(id) => format!("@0x{id:08x}"),
        AttributeValue::Integer {
            data,
            value_type: ValueType::IntHex,
        } => format!("0x{data:x}"),
        AttributeValue::Integer { data, .. } => (*data as i32).to_string(),
        AttributeValue::Null => String::new(),
        AttributeValue::Raw { value_type, data } => match attr.raw_text() {
            Some(raw) => raw.to_string(),
            None if *value_type == ValueType::Float => f32::from_bits(*data).to_string(),
            None => format!("(0x{:02x})0x{data:08x}", value_type.to_u8()),
        },
    }
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        write_u16(buf, 0x8000 | ((len >> 16) as u16 & 0x7FFF));
        write_u16(buf, (len & 0xFFFF) as u16);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // chunk size placeholder
    start
}

/// Node chunks share a 16-byte header: line number and comment follow the
/// common chunk header.
fn begin_node(buf: &mut Vec<u8>, chunk_type: u16) -> usize {
    let start = begin_chunk(buf, chunk_type, NODE_HEADER_SIZE);
    write_u32(buf, 0); // line number
    write_u32(buf, NO_ENTRY_INDEX); // comment
    start
}

fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attribute_keeps_id_order() {
        let mut element = XmlElement::new("provider");
        element.create_attribute(None, "tools", None);
        element.android_attribute_mut("exported", 0x0101001e);
        element.android_attribute_mut("name", 0x01010003);
        element.android_attribute_mut("authorities", 0x01010018);

        let ids: Vec<_> = element.attributes.iter().map(|a| a.resource_id).collect();
        assert_eq!(
            ids,
            vec![Some(0x01010003), Some(0x01010018), Some(0x0101001e), None]
        );
    }

    #[test]
    fn create_attribute_is_idempotent() {
        let mut element = XmlElement::new("activity");
        element.android_attribute_mut("name", 0x01010003).set_string("a.B");
        element.android_attribute_mut("name", 0x01010003);
        assert_eq!(element.attributes.len(), 1);
        assert_eq!(element.attributes[0].value().as_str(), Some("a.B"));
    }

    #[test]
    fn int_setter_rejects_non_integer_tags() {
        let mut attr = XmlAttribute::android("initOrder", 0x01010427);
        assert!(attr.set_int_with_type(5, ValueType::Boolean).is_err());
        attr.set_int_with_type(i32::MAX, ValueType::IntDec)
            .expect("integer tag accepted");
        assert_eq!(attr.value().value_type(), ValueType::IntDec);
        assert_eq!(attr.value().as_int(), Some(i32::MAX));
    }

    #[test]
    fn boolean_true_encodes_all_bits() {
        assert_eq!(AttributeValue::Boolean(true).data_word(), 0xFFFF_FFFF);
        assert_eq!(AttributeValue::Boolean(false).data_word(), 0);
    }

    #[test]
    fn special_indices_are_one_based() {
        let mut element = XmlElement::new("view");
        element.android_attribute_mut("name", 0x01010003);
        element.create_attribute(None, "style", None);
        assert_eq!(element.special_index("style"), 2);
        assert_eq!(element.special_index("id"), 0);
    }
}
