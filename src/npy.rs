//! Minimal NPY (version 1.0) reading and writing.
//!
//! The pipeline exchanges one-dimensional numeric arrays with the sorter and
//! the analysis layout as `.npy` files. Only the little-endian scalar types
//! the pipeline actually produces are supported.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::types::PipelineError;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Scalar types supported by this codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F64,
    I64,
    U32,
}

impl Dtype {
    fn descr(self) -> &'static str {
        match self {
            Dtype::F64 => "<f8",
            Dtype::I64 => "<i8",
            Dtype::U32 => "<u4",
        }
    }
}

fn write_header<W: Write>(writer: &mut W, dtype: Dtype, len: usize) -> std::io::Result<()> {
    let dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({},), }}",
        dtype.descr(),
        len
    );
    // Header (magic + version + length field + dict + newline) is padded to
    // a multiple of 64 bytes.
    let unpadded = NPY_MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = (dict.len() + padding + 1) as u16;

    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&[0x01, 0x00])?;
    writer.write_u16::<LittleEndian>(header_len)?;
    writer.write_all(dict.as_bytes())?;
    for _ in 0..padding {
        writer.write_all(b" ")?;
    }
    writer.write_all(b"\n")?;
    Ok(())
}

/// Saves a slice of f64 values as a 1-D NPY file.
pub fn save_f64<P: AsRef<Path>>(path: P, values: &[f64]) -> Result<(), PipelineError> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_header(&mut writer, Dtype::F64, values.len())?;
    for &v in values {
        writer.write_f64::<LittleEndian>(v)?;
    }
    writer.flush()?;
    Ok(())
}

/// Saves a slice of i64 values as a 1-D NPY file.
pub fn save_i64<P: AsRef<Path>>(path: P, values: &[i64]) -> Result<(), PipelineError> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_header(&mut writer, Dtype::I64, values.len())?;
    for &v in values {
        writer.write_i64::<LittleEndian>(v)?;
    }
    writer.flush()?;
    Ok(())
}

/// Saves a slice of u32 values as a 1-D NPY file.
pub fn save_u32<P: AsRef<Path>>(path: P, values: &[u32]) -> Result<(), PipelineError> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_header(&mut writer, Dtype::U32, values.len())?;
    for &v in values {
        writer.write_u32::<LittleEndian>(v)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads the header of an NPY file and returns (dtype, element count).
fn read_header<R: Read>(
    reader: &mut R,
    path: &Path,
) -> Result<(Dtype, usize), PipelineError> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != NPY_MAGIC {
        return Err(PipelineError::MalformedMeta {
            path: path.to_path_buf(),
            detail: "not an NPY file".to_string(),
        });
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    if version[0] != 1 {
        return Err(PipelineError::MalformedMeta {
            path: path.to_path_buf(),
            detail: format!("unsupported NPY version {}.{}", version[0], version[1]),
        });
    }
    let header_len = reader.read_u16::<LittleEndian>()? as usize;
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    let malformed = |detail: &str| PipelineError::MalformedMeta {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };

    let dtype = if header.contains("'<f8'") {
        Dtype::F64
    } else if header.contains("'<i8'") {
        Dtype::I64
    } else if header.contains("'<u4'") {
        Dtype::U32
    } else {
        return Err(malformed("unsupported dtype"));
    };
    if header.contains("'fortran_order': True") {
        return Err(malformed("fortran order not supported"));
    }

    let shape_start = header
        .find("'shape': (")
        .ok_or_else(|| malformed("missing shape"))?
        + "'shape': (".len();
    let shape_end = header[shape_start..]
        .find(')')
        .ok_or_else(|| malformed("missing shape"))?
        + shape_start;
    let shape_str = &header[shape_start..shape_end];
    let dims: Vec<&str> = shape_str
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if dims.len() != 1 {
        return Err(malformed("only 1-D arrays supported"));
    }
    let len: usize = dims[0]
        .parse()
        .map_err(|_| malformed("invalid shape"))?;

    Ok((dtype, len))
}

/// Loads a 1-D NPY file as f64 values, converting integer types.
pub fn load_f64<P: AsRef<Path>>(path: P) -> Result<Vec<f64>, PipelineError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let (dtype, len) = read_header(&mut reader, path)?;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        let v = match dtype {
            Dtype::F64 => reader.read_f64::<LittleEndian>()?,
            Dtype::I64 => reader.read_i64::<LittleEndian>()? as f64,
            Dtype::U32 => reader.read_u32::<LittleEndian>()? as f64,
        };
        values.push(v);
    }
    Ok(values)
}

/// Loads a 1-D NPY file of u32 cluster identifiers.
pub fn load_u32<P: AsRef<Path>>(path: P) -> Result<Vec<u32>, PipelineError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let (dtype, len) = read_header(&mut reader, path)?;
    if dtype != Dtype::U32 {
        return Err(PipelineError::MalformedMeta {
            path: path.to_path_buf(),
            detail: "expected u32 array".to_string(),
        });
    }
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(reader.read_u32::<LittleEndian>()?);
    }
    Ok(values)
}

/// Loads a 1-D NPY file of i64 values.
pub fn load_i64<P: AsRef<Path>>(path: P) -> Result<Vec<i64>, PipelineError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let (dtype, len) = read_header(&mut reader, path)?;
    if dtype != Dtype::I64 {
        return Err(PipelineError::MalformedMeta {
            path: path.to_path_buf(),
            detail: "expected i64 array".to_string(),
        });
    }
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(reader.read_i64::<LittleEndian>()?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn f64_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("times.npy");
        let values = vec![0.0, 1.5, -2.25, 1e9];
        save_f64(&path, &values).unwrap();
        assert_eq!(load_f64(&path).unwrap(), values);
    }

    #[test]
    fn integer_arrays_load_as_f64() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.npy");
        save_i64(&path, &[3, -1, 7]).unwrap();
        assert_eq!(load_f64(&path).unwrap(), vec![3.0, -1.0, 7.0]);
    }

    #[test]
    fn header_is_64_byte_aligned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aligned.npy");
        save_u32(&path, &[1, 2, 3]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        // Data section must start at a multiple of 64.
        assert_eq!((bytes.len() - 3 * 4) % 64, 0);
    }

    #[test]
    fn rejects_non_npy_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.npy");
        std::fs::write(&path, b"not numpy at all").unwrap();
        assert!(load_f64(&path).is_err());
    }
}
