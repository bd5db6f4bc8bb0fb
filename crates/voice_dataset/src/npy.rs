//! Minimal `.npy` reader/writer for little-endian float arrays in C order.

use crate::types::{DatasetResult, VoiceDatasetError};
use std::fs;
use std::io::Write;
use std::path::Path;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Dense array loaded from disk, values widened/narrowed to `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl NpyArray {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> DatasetResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(VoiceDatasetError::Shape(format!(
                "array of {} values does not fit shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { data, shape })
    }

    /// View as `[channels, rows, timesteps]`, inserting a leading unit axis for 2-D arrays.
    pub fn dims3(&self) -> DatasetResult<[usize; 3]> {
        match self.shape.as_slice() {
            [c, f, t] => Ok([*c, *f, *t]),
            [f, t] => Ok([1, *f, *t]),
            other => Err(VoiceDatasetError::Shape(format!(
                "expected a 2-D or 3-D spectrogram, got shape {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    F32,
    F64,
}

pub fn load(path: &Path) -> DatasetResult<NpyArray> {
    let bytes = fs::read(path).map_err(|e| VoiceDatasetError::io(path, e))?;
    parse(&bytes).map_err(|msg| VoiceDatasetError::Npy {
        path: path.to_path_buf(),
        msg,
    })
}

fn parse(bytes: &[u8]) -> Result<NpyArray, String> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err("missing NUMPY magic".to_string());
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err("truncated v2 header".to_string());
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(format!("unsupported npy version {v}")),
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err("truncated header".to_string());
    }
    let header = String::from_utf8_lossy(&bytes[header_start..data_start]);

    let dtype = parse_descr(&header)?;
    if header_flag(&header, "fortran_order") == Some(true) {
        return Err("fortran-ordered arrays are not supported".to_string());
    }
    let shape = parse_shape(&header)?;
    let count: usize = shape.iter().product();

    let payload = &bytes[data_start..];
    let data: Vec<f32> = match dtype {
        Dtype::F32 => {
            if payload.len() < count * 4 {
                return Err(format!("expected {count} f32 values, found {} bytes", payload.len()));
            }
            payload[..count * 4]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        }
        Dtype::F64 => {
            if payload.len() < count * 8 {
                return Err(format!("expected {count} f64 values, found {} bytes", payload.len()));
            }
            payload[..count * 8]
                .chunks_exact(8)
                .map(|b| {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
                })
                .collect()
        }
    };
    Ok(NpyArray { data, shape })
}

fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}':");
    let start = header.find(&needle)? + needle.len();
    Some(header[start..].trim_start())
}

fn header_flag(header: &str, key: &str) -> Option<bool> {
    let rest = header_value(header, key)?;
    if rest.starts_with("True") {
        Some(true)
    } else if rest.starts_with("False") {
        Some(false)
    } else {
        None
    }
}

fn parse_descr(header: &str) -> Result<Dtype, String> {
    let rest = header_value(header, "descr").ok_or("header has no descr")?;
    let quoted = rest
        .strip_prefix('\'')
        .and_then(|r| r.split('\'').next())
        .ok_or("malformed descr")?;
    match quoted {
        "<f4" | "=f4" => Ok(Dtype::F32),
        "<f8" | "=f8" => Ok(Dtype::F64),
        other => Err(format!("unsupported dtype {other}")),
    }
}

fn parse_shape(header: &str) -> Result<Vec<usize>, String> {
    let rest = header_value(header, "shape").ok_or("header has no shape")?;
    let open = rest.find('(').ok_or("malformed shape")?;
    let close = rest.find(')').ok_or("malformed shape")?;
    rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|e| format!("bad shape entry {s}: {e}")))
        .collect()
}

/// Write a C-ordered `<f4` array (version 1.0 header, 64-byte aligned).
pub fn save_f32(path: &Path, data: &[f32], shape: &[usize]) -> DatasetResult<()> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(VoiceDatasetError::Shape(format!(
            "cannot write {} values as shape {shape:?}",
            data.len()
        )));
    }
    let shape_str = match shape {
        [single] => format!("({single},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header =
        format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {shape_str}, }}");
    let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(unpadded + padding + data.len() * 4);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| VoiceDatasetError::io(parent, e))?;
    }
    let mut file = fs::File::create(path).map_err(|e| VoiceDatasetError::io(path, e))?;
    file.write_all(&out)
        .map_err(|e| VoiceDatasetError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shape_and_descr() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (1, 257, 42), }";
        assert_eq!(parse_shape(header).unwrap(), vec![1, 257, 42]);
        assert_eq!(parse_descr(header).unwrap(), Dtype::F32);
        assert_eq!(header_flag(header, "fortran_order"), Some(false));

        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (100,), }";
        assert_eq!(parse_shape(header).unwrap(), vec![100]);
        assert_eq!(parse_descr(header).unwrap(), Dtype::F64);
    }

    #[test]
    fn rejects_integer_arrays() {
        let header = "{'descr': '<i4', 'fortran_order': False, 'shape': (3,), }";
        assert!(parse_descr(header).is_err());
    }

    #[test]
    fn written_arrays_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spect.npy");
        let data: Vec<f32> = (0..12).map(|v| v as f32 * 0.5).collect();
        save_f32(&path, &data, &[1, 3, 4]).unwrap();

        let bytes = fs::read(&path).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.shape, vec![1, 3, 4]);
        assert_eq!(loaded.data, data);
        assert_eq!(loaded.dims3().unwrap(), [1, 3, 4]);
    }
}
