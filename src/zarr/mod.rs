pub mod http;
pub mod ome;

use crate::model::DataType;
use crate::volume::VoxelData;
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

/*
{
    "chunks": [128, 128, 128],
    "compressor": { "id": "zstd", "level": 3 },
    "dtype": "<u2",
    "fill_value": 0,
    "filters": null,
    "order": "C",
    "shape": [4251, 3145, 3432],
    "zarr_format": 2,
    "dimension_separator": "/"
}
*/

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
enum ZarrOrder {
    #[serde(rename = "C")]
    RowMajor,
    #[serde(rename = "F")]
    ColumnMajor,
}

#[derive(Deserialize, Debug, Clone)]
struct ZarrCompressor {
    id: String,
}

#[derive(Deserialize, Debug, Clone)]
struct ZarrArrayDef {
    chunks: Vec<usize>,
    compressor: Option<ZarrCompressor>,
    dtype: String,
    #[serde(default)]
    fill_value: Value,
    #[serde(default)]
    filters: Option<Vec<Value>>,
    order: Option<ZarrOrder>,
    shape: Vec<usize>,
    zarr_format: u8,
    dimension_separator: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
struct V3ChunkGrid {
    name: String,
    configuration: V3RegularGrid,
}

#[derive(Deserialize, Debug, Clone)]
struct V3RegularGrid {
    chunk_shape: Vec<usize>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct V3KeyEncodingConfig {
    separator: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
struct V3KeyEncoding {
    name: String,
    #[serde(default)]
    configuration: V3KeyEncodingConfig,
}

#[derive(Deserialize, Debug, Clone)]
struct V3Codec {
    name: String,
    #[serde(default)]
    configuration: Value,
}

/// Contents of a v3 `zarr.json`, array or group.
#[derive(Deserialize, Debug, Clone)]
struct V3Node {
    zarr_format: u8,
    node_type: String,
    #[serde(default)]
    attributes: Value,
    shape: Option<Vec<usize>>,
    data_type: Option<String>,
    chunk_grid: Option<V3ChunkGrid>,
    chunk_key_encoding: Option<V3KeyEncoding>,
    #[serde(default)]
    codecs: Vec<V3Codec>,
    #[serde(default)]
    fill_value: Value,
    dimension_names: Option<Vec<Option<String>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Byte-level transformation applied to stored chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    Zstd,
    /// Trailing 4 byte checksum, stripped without verification.
    Crc32c,
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyEncoding {
    /// `0.1.2`, separator configurable.
    Flat(String),
    /// `c/0/1/2`, separator configurable.
    Prefixed(String),
}

/// A parsed zarr node.
#[derive(Debug, Clone)]
pub enum ZarrNode {
    Array(ArrayMeta),
    Group { attributes: Value },
}

/// What is needed to locate and decode the chunks of one array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMeta {
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: DataType,
    pub endian: Endian,
    pub fill_value: f64,
    /// Applied on write in this order, undone in reverse on read.
    pub codecs: Vec<Codec>,
    pub dimension_names: Option<Vec<String>>,
    key_encoding: KeyEncoding,
}

fn parse_endian(dtype: &str) -> Endian {
    if dtype.starts_with('>') {
        Endian::Big
    } else {
        Endian::Little
    }
}

fn parse_fill_value(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(b) => *b as u8 as f64,
        Value::String(s) => match s.as_str() {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            _ => 0.0,
        },
        _ => 0.0,
    }
}

impl ArrayMeta {
    /// Parses a v2 `.zarray` document.
    pub fn from_zarray(json: &str) -> Result<Self> {
        let def: ZarrArrayDef = serde_json::from_str(json).context("invalid .zarray")?;
        if def.zarr_format != 2 {
            bail!("unexpected zarr_format {} in .zarray", def.zarr_format);
        }
        let dtype = DataType::parse(&def.dtype).ok_or_else(|| anyhow!("unsupported dtype {}", def.dtype))?;
        let mut codecs = vec![];
        if def.filters.as_ref().is_some_and(|f| !f.is_empty()) {
            codecs.push(Codec::Unsupported("filters".to_string()));
        }
        if def.order == Some(ZarrOrder::ColumnMajor) {
            codecs.push(Codec::Unsupported("F order".to_string()));
        }
        match def.compressor {
            None => {}
            Some(c) if c.id == "zstd" => codecs.push(Codec::Zstd),
            Some(c) => codecs.push(Codec::Unsupported(c.id)),
        }
        Self::checked(ArrayMeta {
            shape: def.shape,
            chunks: def.chunks,
            dtype,
            endian: parse_endian(&def.dtype),
            fill_value: parse_fill_value(&def.fill_value),
            codecs,
            dimension_names: None,
            key_encoding: KeyEncoding::Flat(def.dimension_separator.unwrap_or_else(|| ".".to_string())),
        })
    }

    fn from_v3(node: V3Node) -> Result<Self> {
        let shape = node.shape.context("array without shape")?;
        let data_type = node.data_type.context("array without data_type")?;
        let dtype = DataType::parse(&data_type).ok_or_else(|| anyhow!("unsupported data_type {data_type}"))?;
        let grid = node.chunk_grid.context("array without chunk_grid")?;
        if grid.name != "regular" {
            bail!("unsupported chunk grid {}", grid.name);
        }
        let key_encoding = match node.chunk_key_encoding {
            Some(enc) if enc.name == "v2" => KeyEncoding::Flat(enc.configuration.separator.unwrap_or_else(|| ".".into())),
            Some(enc) => KeyEncoding::Prefixed(enc.configuration.separator.unwrap_or_else(|| "/".into())),
            None => KeyEncoding::Prefixed("/".into()),
        };

        let mut endian = Endian::Little;
        let mut codecs = vec![];
        for codec in node.codecs {
            match codec.name.as_str() {
                "bytes" => {
                    if codec.configuration.get("endian").and_then(Value::as_str) == Some("big") {
                        endian = Endian::Big;
                    }
                }
                "zstd" => codecs.push(Codec::Zstd),
                "crc32c" => codecs.push(Codec::Crc32c),
                _ => codecs.push(Codec::Unsupported(codec.name)),
            }
        }
        let dimension_names = node
            .dimension_names
            .and_then(|names| names.into_iter().collect::<Option<Vec<_>>>());

        Self::checked(ArrayMeta {
            shape,
            chunks: grid.configuration.chunk_shape,
            dtype,
            endian,
            fill_value: parse_fill_value(&node.fill_value),
            codecs,
            dimension_names,
            key_encoding,
        })
    }

    fn checked(meta: ArrayMeta) -> Result<Self> {
        if meta.shape.len() != meta.chunks.len() {
            bail!("shape {:?} does not match chunks {:?}", meta.shape, meta.chunks);
        }
        if meta.chunks.contains(&0) {
            bail!("zero-sized chunks {:?}", meta.chunks);
        }
        Ok(meta)
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Elements in one stored chunk.
    pub fn chunk_len(&self) -> usize {
        self.chunks.iter().product()
    }

    /// Store key of the chunk at grid position `indices`.
    pub fn chunk_key(&self, indices: &[usize]) -> String {
        let joined = |sep: &str| {
            if indices.is_empty() {
                "0".to_string()
            } else {
                indices.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(sep)
            }
        };
        match &self.key_encoding {
            KeyEncoding::Flat(sep) => joined(sep),
            KeyEncoding::Prefixed(_) if indices.is_empty() => "c".to_string(),
            KeyEncoding::Prefixed(sep) => format!("c{sep}{}", joined(sep)),
        }
    }

    /// `len` elements of a chunk that was never written.
    pub fn fill_chunk(&self, len: usize) -> VoxelData {
        VoxelData::filled(self.dtype, len, self.fill_value)
    }

    pub fn decode_chunk(&self, stored: &[u8]) -> Result<VoxelData> {
        let mut bytes = stored.to_vec();
        for codec in self.codecs.iter().rev() {
            bytes = match codec {
                Codec::Zstd => crate::zstd_decompress(&bytes)?,
                Codec::Crc32c => {
                    let len = bytes.len().checked_sub(4).context("chunk shorter than its checksum")?;
                    bytes.truncate(len);
                    bytes
                }
                Codec::Unsupported(name) => bail!("unsupported codec {name}"),
            };
        }
        let expected = self.chunk_len() * self.dtype.size();
        if bytes.len() < expected {
            bail!("chunk has {} bytes, expected {expected}", bytes.len());
        }
        Ok(decode_elements(&bytes[..expected], self.dtype, self.endian))
    }
}

macro_rules! decode_as {
    ($bytes:expr, $endian:expr, $t:ty, $variant:ident) => {{
        const N: usize = std::mem::size_of::<$t>();
        VoxelData::$variant(
            $bytes
                .chunks_exact(N)
                .map(|b| {
                    let mut raw = [0u8; N];
                    raw.copy_from_slice(b);
                    match $endian {
                        Endian::Little => <$t>::from_le_bytes(raw),
                        Endian::Big => <$t>::from_be_bytes(raw),
                    }
                })
                .collect(),
        )
    }};
}

fn decode_elements(bytes: &[u8], dtype: DataType, endian: Endian) -> VoxelData {
    match dtype {
        DataType::U8 => VoxelData::U8(bytes.to_vec()),
        DataType::I8 => VoxelData::I8(bytes.iter().map(|&b| b as i8).collect()),
        DataType::U16 => decode_as!(bytes, endian, u16, U16),
        DataType::I16 => decode_as!(bytes, endian, i16, I16),
        DataType::U32 => decode_as!(bytes, endian, u32, U32),
        DataType::I32 => decode_as!(bytes, endian, i32, I32),
        DataType::F32 => decode_as!(bytes, endian, f32, F32),
        DataType::F64 => decode_as!(bytes, endian, f64, F64),
    }
}

/// Parses a v3 `zarr.json` document.
pub fn parse_zarr_json(json: &str) -> Result<ZarrNode> {
    let node: V3Node = serde_json::from_str(json).context("invalid zarr.json")?;
    if node.zarr_format != 3 {
        bail!("unexpected zarr_format {} in zarr.json", node.zarr_format);
    }
    match node.node_type.as_str() {
        "array" => Ok(ZarrNode::Array(ArrayMeta::from_v3(node)?)),
        "group" => Ok(ZarrNode::Group {
            attributes: node.attributes,
        }),
        other => bail!("unknown node_type {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZARRAY: &str = r#"{
        "chunks": [2, 2, 3],
        "compressor": null,
        "dtype": "<u2",
        "fill_value": 7,
        "filters": null,
        "order": "C",
        "shape": [5, 4, 6],
        "zarr_format": 2
    }"#;

    const ZARR_JSON: &str = r#"{
        "zarr_format": 3,
        "node_type": "array",
        "shape": [1, 64, 64, 64],
        "data_type": "float32",
        "chunk_grid": {"name": "regular", "configuration": {"chunk_shape": [1, 32, 32, 32]}},
        "chunk_key_encoding": {"name": "default", "configuration": {"separator": "/"}},
        "fill_value": "NaN",
        "codecs": [{"name": "bytes", "configuration": {"endian": "big"}}, {"name": "zstd", "configuration": {"level": 0}}],
        "dimension_names": ["c", "z", "y", "x"],
        "attributes": {}
    }"#;

    #[test]
    fn parses_zarray() {
        let meta = ArrayMeta::from_zarray(ZARRAY).unwrap();
        assert_eq!(meta.shape, vec![5, 4, 6]);
        assert_eq!(meta.dtype, DataType::U16);
        assert_eq!(meta.endian, Endian::Little);
        assert_eq!(meta.fill_value, 7.0);
        assert!(meta.codecs.is_empty());
        assert_eq!(meta.chunk_key(&[1, 0, 2]), "1.0.2");
        assert_eq!(meta.fill_chunk(meta.chunk_len()), VoxelData::U16(vec![7; 12]));
        assert_eq!(meta.fill_chunk(4), VoxelData::U16(vec![7; 4]));
    }

    #[test]
    fn flags_unsupported_compressors() {
        let json = ZARRAY.replace(r#""compressor": null"#, r#""compressor": {"id": "blosc", "cname": "lz4"}"#);
        let meta = ArrayMeta::from_zarray(&json).unwrap();
        assert_eq!(meta.codecs, vec![Codec::Unsupported("blosc".into())]);
        let err = meta.decode_chunk(&[0; 24]).unwrap_err();
        assert!(err.to_string().contains("blosc"));
    }

    #[test]
    fn parses_v3_array() {
        let ZarrNode::Array(meta) = parse_zarr_json(ZARR_JSON).unwrap() else {
            panic!("expected an array");
        };
        assert_eq!(meta.dtype, DataType::F32);
        assert_eq!(meta.endian, Endian::Big);
        assert!(meta.fill_value.is_nan());
        assert_eq!(meta.codecs, vec![Codec::Zstd]);
        assert_eq!(meta.chunk_key(&[0, 1, 0, 1]), "c/0/1/0/1");
        assert_eq!(meta.dimension_names.as_deref(), Some(&["c", "z", "y", "x"].map(String::from)[..]));
    }

    #[test]
    fn parses_v3_group() {
        let json = r#"{"zarr_format": 3, "node_type": "group", "attributes": {"ome": {"version": "0.5"}}}"#;
        match parse_zarr_json(json).unwrap() {
            ZarrNode::Group { attributes } => assert_eq!(attributes["ome"]["version"], "0.5"),
            ZarrNode::Array(_) => panic!("expected a group"),
        }
    }

    #[test]
    fn decodes_raw_chunks_in_both_byte_orders() {
        let mut meta = ArrayMeta::from_zarray(ZARRAY).unwrap();
        let raw: Vec<u8> = (0u16..12).flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(meta.decode_chunk(&raw).unwrap(), VoxelData::U16((0..12).collect()));

        meta.endian = Endian::Big;
        let raw: Vec<u8> = (0u16..12).flat_map(|v| v.to_be_bytes()).collect();
        assert_eq!(meta.decode_chunk(&raw).unwrap(), VoxelData::U16((0..12).collect()));

        assert!(meta.decode_chunk(&raw[..10]).is_err());
    }

    #[test]
    fn strips_checksums() {
        let mut meta = ArrayMeta::from_zarray(ZARRAY).unwrap();
        meta.codecs = vec![Codec::Crc32c];
        let mut raw: Vec<u8> = (0u16..12).flat_map(|v| v.to_le_bytes()).collect();
        raw.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(meta.decode_chunk(&raw).unwrap().len(), 12);
    }

    #[test]
    fn key_encodings() {
        let mut meta = ArrayMeta::from_zarray(&ZARRAY.replace(r#""zarr_format": 2"#, r#""zarr_format": 2, "dimension_separator": "/""#)).unwrap();
        assert_eq!(meta.chunk_key(&[3, 2, 1]), "3/2/1");
        meta.key_encoding = KeyEncoding::Prefixed(".".into());
        assert_eq!(meta.chunk_key(&[3, 2, 1]), "c.3.2.1");
        assert_eq!(meta.chunk_key(&[]), "c");
    }
}
