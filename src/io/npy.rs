//! NPY (format 1.0) array dumps: buffered writer and memory-mapped reader.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use memmap2::{Mmap, MmapOptions};
use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn};
use regex::Regex;

const MAGIC: &[u8] = b"\x93NUMPY";

/// Element types that can be dumped to NPY.
pub trait NpyDtype: Copy {
    fn npy_dtype() -> &'static str;
    fn size() -> usize {
        std::mem::size_of::<Self>()
    }
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! npy_dtype {
    ($t:ty, $descr:expr) => {
        impl NpyDtype for $t {
            fn npy_dtype() -> &'static str {
                $descr
            }
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

npy_dtype!(u8, "|u1");
npy_dtype!(u16, "<u2");
npy_dtype!(i16, "<i2");
npy_dtype!(f32, "<f4");
npy_dtype!(f64, "<f8");

/// Header dictionary padded so that magic + length + header is a multiple of 16.
fn header_bytes(dtype: &str, shape: &[usize]) -> Vec<u8> {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    let shape_str = if dims.len() == 1 {
        format!("({},)", dims[0])
    } else {
        format!("({})", dims.join(", "))
    };
    let header_dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        dtype, shape_str
    );

    // magic (6) + version (2) + length (2) + dict + newline
    let unpadded = MAGIC.len() + 2 + 2 + header_dict.len() + 1;
    let pad = (16 - unpadded % 16) % 16;
    let final_header = format!("{}{}\n", header_dict, " ".repeat(pad));

    let mut out = Vec::with_capacity(unpadded + pad);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(final_header.len() as u16).to_le_bytes());
    out.extend_from_slice(final_header.as_bytes());
    out
}

/// Write any array (contiguous or a strided view) in C order.
pub fn write_array<T, S, D>(path: &Path, array: &ArrayBase<S, D>) -> Result<()>
where
    T: NpyDtype,
    S: Data<Elem = T>,
    D: Dimension,
{
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);
    writer.write_all(&header_bytes(T::npy_dtype(), array.shape()))?;

    let mut data = Vec::with_capacity(array.len() * T::size());
    for &v in array.iter() {
        v.write_le(&mut data);
    }
    writer.write_all(&data)?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct NpyHeader {
    pub descr: String,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

impl NpyHeader {
    fn parse(dict: &str) -> Result<Self> {
        let descr_re = Regex::new(r"'descr'\s*:\s*'([^']+)'")?;
        let order_re = Regex::new(r"'fortran_order'\s*:\s*(True|False)")?;
        let shape_re = Regex::new(r"'shape'\s*:\s*\(([^)]*)\)")?;

        let descr = descr_re
            .captures(dict)
            .map(|c| c[1].to_string())
            .ok_or_else(|| anyhow!("NPY header has no descr: {}", dict))?;
        let fortran_order = order_re
            .captures(dict)
            .map(|c| &c[1] == "True")
            .ok_or_else(|| anyhow!("NPY header has no fortran_order: {}", dict))?;
        let shape = shape_re
            .captures(dict)
            .ok_or_else(|| anyhow!("NPY header has no shape: {}", dict))?[1]
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<usize>().map_err(|e| anyhow!("Bad NPY dimension {:?}: {}", s, e)))
            .collect::<Result<Vec<_>>>()?;
        if shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d)).is_none() {
            bail!("NPY shape {:?} overflows the address space", shape);
        }

        Ok(NpyHeader {
            descr,
            fortran_order,
            shape,
        })
    }

    /// Element count; `parse` guarantees the product does not overflow.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (kind, item size, big endian) from the descr, e.g. `<f4` -> ('f', 4, false).
    fn element(&self) -> Result<(char, usize, bool)> {
        let mut chars = self.descr.chars();
        let (big_endian, rest) = match chars.next() {
            Some('>') => (true, chars.as_str()),
            Some('<') | Some('|') | Some('=') => (false, chars.as_str()),
            _ => (false, self.descr.as_str()),
        };
        let mut rest_chars = rest.chars();
        let kind = rest_chars
            .next()
            .ok_or_else(|| anyhow!("Empty NPY dtype {:?}", self.descr))?;
        let size: usize = rest_chars
            .as_str()
            .parse()
            .map_err(|_| anyhow!("Unsupported NPY dtype {:?}", self.descr))?;
        match (kind, size) {
            ('b', 1) | ('u', 1 | 2 | 4 | 8) | ('i', 1 | 2 | 4 | 8) | ('f', 4 | 8) => Ok((kind, size, big_endian)),
            _ => bail!("Unsupported NPY dtype {:?}", self.descr),
        }
    }
}

/// Read-only memory-mapped NPY file. Data pages are loaded on access only.
pub struct NpyMmap {
    mmap: Mmap,
    header: NpyHeader,
    data_offset: usize,
}

impl NpyMmap {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("Failed to mmap {:?}", path))?;

        if mmap.len() < 10 || &mmap[..MAGIC.len()] != MAGIC {
            bail!("{:?} is not an NPY file", path);
        }
        let major = mmap[6];
        let (header_len, header_start) = match major {
            1 => (u16::from_le_bytes([mmap[8], mmap[9]]) as usize, 10),
            2 | 3 if mmap.len() >= 12 => (
                u32::from_le_bytes([mmap[8], mmap[9], mmap[10], mmap[11]]) as usize,
                12,
            ),
            _ => bail!("Unsupported NPY version {} in {:?}", major, path),
        };
        let data_offset = header_start + header_len;
        if data_offset > mmap.len() {
            bail!("Truncated NPY header in {:?}", path);
        }
        let dict = std::str::from_utf8(&mmap[header_start..data_offset])
            .with_context(|| format!("NPY header of {:?} is not text", path))?;
        let header = NpyHeader::parse(dict).with_context(|| format!("Bad NPY header in {:?}", path))?;

        let (_, item_size, _) = header.element()?;
        let needed = header
            .len()
            .checked_mul(item_size)
            .ok_or_else(|| anyhow!("NPY data size overflows in {:?}", path))?;
        if mmap.len() - data_offset < needed {
            bail!(
                "Truncated NPY data in {:?}: {} bytes, expected {}",
                path,
                mmap.len() - data_offset,
                needed
            );
        }

        Ok(NpyMmap {
            mmap,
            header,
            data_offset,
        })
    }

    pub fn header(&self) -> &NpyHeader {
        &self.header
    }

    fn data(&self) -> Result<&[u8]> {
        let (_, item_size, _) = self.header.element()?;
        Ok(&self.mmap[self.data_offset..self.data_offset + self.header.len() * item_size])
    }

    /// Number of elements that are not zero. NaN counts as non-zero.
    pub fn count_nonzero(&self) -> Result<u64> {
        let (kind, item_size, big_endian) = self.header.element()?;
        let data = self.data()?;
        let count = match (kind, item_size) {
            ('f', 4) => data
                .chunks_exact(4)
                .filter(|b| {
                    let raw = [b[0], b[1], b[2], b[3]];
                    let v = if big_endian { f32::from_be_bytes(raw) } else { f32::from_le_bytes(raw) };
                    v != 0.0
                })
                .count(),
            ('f', 8) => data
                .chunks_exact(8)
                .filter(|b| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    let v = if big_endian { f64::from_be_bytes(raw) } else { f64::from_le_bytes(raw) };
                    v != 0.0
                })
                .count(),
            // integer and bool zero is all-zero bytes in either byte order
            _ => data
                .chunks_exact(item_size)
                .filter(|b| b.iter().any(|&x| x != 0))
                .count(),
        };
        Ok(count as u64)
    }

    /// Decode into an owned array; the dtype must match `T` exactly.
    pub fn to_array<T: NpyDtype>(&self) -> Result<ArrayD<T>> {
        if self.header.descr != T::npy_dtype() {
            bail!("NPY dtype {} does not match requested {}", self.header.descr, T::npy_dtype());
        }
        if self.header.fortran_order {
            bail!("Fortran-ordered NPY arrays are not supported");
        }
        let values: Vec<T> = self.data()?.chunks_exact(T::size()).map(T::read_le).collect();
        ArrayD::from_shape_vec(IxDyn(&self.header.shape), values)
            .map_err(|e| anyhow!("NPY shape {:?} does not fit data: {}", self.header.shape, e))
    }
}
