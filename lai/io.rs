// ========================================================================================
//
//                    Haplotype matrix loaders and label matrix writers
//
// ========================================================================================

use crate::types::MISSING_LABEL;
use csv::{ReaderBuilder, Trim, WriterBuilder};
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use ndarray::{Array2, ArrayD, ArrayView2};
use ndarray_npy::{ReadNpyError, ReadNpyExt, ReadableElement, WriteNpyError, WriteNpyExt};
use noodles_bgzf::Reader as BgzfReader;
use noodles_vcf::{
    self as vcf,
    variant::RecordBuf,
    variant::record::samples::keys::key,
    variant::record_buf::samples::sample::{
        Value, value::genotype::Allele, value::genotype::Genotype as SampleGenotype,
    },
};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Leading bytes of a BGZF block: gzip magic, deflate, FEXTRA flag.
const BGZF_MAGIC: [u8; 4] = [0x1f, 0x8b, 0x08, 0x04];

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to access '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read NPY file '{}': {source}", .path.display())]
    Npy {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("Failed to write NPY file '{}': {source}", .path.display())]
    NpyWrite {
        path: PathBuf,
        #[source]
        source: WriteNpyError,
    },
    #[error("'{}' is not a usable haplotype NPY file: {message}", .path.display())]
    InvalidNpy { path: PathBuf, message: String },
    #[error("Failed to parse text matrix '{}': {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Invalid VCF '{}' at record {record}: {message}", .path.display())]
    InvalidVcf {
        path: PathBuf,
        record: usize,
        message: String,
    },
    #[error("'{}' row {row} has {found} values, but earlier rows have {expected}.", .path.display())]
    RaggedRows {
        path: PathBuf,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("'{}' contains '{value}', which is not an allele or label in 0..=255.", .path.display())]
    InvalidValue { path: PathBuf, value: String },
    #[error("Unknown data format '{0}'; expected one of npy, txt, vcf.")]
    UnknownFormat(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DataError + '_ {
    move |source| DataError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// On-disk layouts of a haplotype matrix (haplotypes in rows, SNPs in columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    #[default]
    Npy,
    Txt,
    Vcf,
}

impl DataFormat {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Npy => "npy",
            Self::Txt => "txt",
            Self::Vcf => "vcf",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl FromStr for DataFormat {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "npy" => Ok(Self::Npy),
            "txt" | "csv" => Ok(Self::Txt),
            "vcf" => Ok(Self::Vcf),
            _ => Err(DataError::UnknownFormat(s.to_string())),
        }
    }
}

// ========================================================================================
//                                      Public API
// ========================================================================================

/// Loads a haplotype matrix. Unknown alleles become `MISSING_LABEL`.
pub fn load_haplotypes(path: impl AsRef<Path>, format: DataFormat) -> Result<Array2<u8>, DataError> {
    let path = path.as_ref();
    info!("Loading {format} haplotypes from {}", path.display());
    let matrix = match format {
        DataFormat::Npy => load_npy(path)?,
        DataFormat::Txt => load_txt(path)?,
        DataFormat::Vcf => load_vcf(path)?,
    };
    debug!("{}: {} x {}", path.display(), matrix.nrows(), matrix.ncols());
    Ok(matrix)
}

/// Writes a label matrix: whitespace-separated integers when the path ends
/// with `.txt`, a `|u1` NPY array otherwise.
pub fn save_labels(path: impl AsRef<Path>, labels: ArrayView2<u8>) -> Result<(), DataError> {
    let path = path.as_ref();
    let as_text = path
        .to_string_lossy()
        .to_ascii_lowercase()
        .ends_with(".txt");
    info!(
        "Saving {} x {} labels to {}",
        labels.nrows(),
        labels.ncols(),
        path.display()
    );
    if as_text {
        save_txt(path, labels)
    } else {
        let file = File::create(path).map_err(io_error(path))?;
        let mut writer = BufWriter::new(file);
        labels
            .write_npy(&mut writer)
            .map_err(|source| DataError::NpyWrite {
                path: path.to_path_buf(),
                source,
            })?;
        writer.flush().map_err(io_error(path))
    }
}

// ========================================================================================
//                                         NPY
// ========================================================================================

/// Element types accepted in a haplotype NPY file, narrowed to a label.
trait IntoLabel: ReadableElement + Copy {
    fn into_label(self) -> Option<u8>;
}

macro_rules! integer_labels {
    ($($t:ty),*) => {
        $(impl IntoLabel for $t {
            fn into_label(self) -> Option<u8> {
                u8::try_from(self).ok()
            }
        })*
    };
}

integer_labels!(u8, i8, u16, i16, u32, i32, u64, i64);

impl IntoLabel for bool {
    fn into_label(self) -> Option<u8> {
        Some(u8::from(self))
    }
}

impl IntoLabel for f32 {
    fn into_label(self) -> Option<u8> {
        float_label(f64::from(self))
    }
}

impl IntoLabel for f64 {
    fn into_label(self) -> Option<u8> {
        float_label(self)
    }
}

/// Reads `bytes` as an array of `T`; `Ok(None)` when the dtype is another type.
fn read_as<T: IntoLabel>(bytes: &[u8]) -> Result<Option<ArrayD<T>>, ReadNpyError> {
    match ArrayD::<T>::read_npy(bytes) {
        Ok(array) => Ok(Some(array)),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Narrows a 1D or 2D array to labels in logical (row-major) order.
fn into_labels<T: IntoLabel>(array: ArrayD<T>, path: &Path) -> Result<Array2<u8>, DataError> {
    let invalid = |message: String| DataError::InvalidNpy {
        path: path.to_path_buf(),
        message,
    };
    let (rows, cols) = match array.shape() {
        [n] => (1, *n),
        [n, d] => (*n, *d),
        other => return Err(invalid(format!("shape {other:?} is not 1D or 2D"))),
    };
    let values = array
        .iter()
        .map(|&v| {
            v.into_label()
                .ok_or_else(|| invalid("element is not a label in 0..=255".into()))
        })
        .collect::<Result<Vec<u8>, DataError>>()?;
    Array2::from_shape_vec((rows, cols), values).map_err(|e| invalid(e.to_string()))
}

fn load_npy(path: &Path) -> Result<Array2<u8>, DataError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    let npy_error = |source| DataError::Npy {
        path: path.to_path_buf(),
        source,
    };
    macro_rules! first_matching {
        ($($t:ty),*) => {
            $(if let Some(array) = read_as::<$t>(&bytes).map_err(npy_error)? {
                return into_labels(array, path);
            })*
        };
    }
    first_matching!(u8, bool, i8, u16, i16, u32, i32, u64, i64, f32, f64);
    Err(DataError::InvalidNpy {
        path: path.to_path_buf(),
        message: "dtype is not a boolean, integer or float type".into(),
    })
}

fn float_label(v: f64) -> Option<u8> {
    if v.is_nan() {
        Some(MISSING_LABEL)
    } else if (0.0..256.0).contains(&v) {
        Some(v as u8)
    } else {
        None
    }
}

// ========================================================================================
//                                      Text
// ========================================================================================

fn detect_delimiter(sample: &str) -> u8 {
    let first = sample.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first.contains(',') {
        b','
    } else if first.contains('\t') {
        b'\t'
    } else {
        b' '
    }
}

fn parse_text_value(field: &str) -> Option<u8> {
    match field {
        "NA" | "na" | "nan" | "NaN" => Some(MISSING_LABEL),
        _ => field
            .parse::<u8>()
            .ok()
            .or_else(|| field.parse::<f64>().ok().and_then(float_label)),
    }
}

fn load_txt(path: &Path) -> Result<Array2<u8>, DataError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .delimiter(detect_delimiter(&text))
        .from_reader(text.as_bytes());

    let mut values = Vec::new();
    let mut width: Option<usize> = None;
    let mut rows = 0usize;
    for record in reader.records() {
        let record = record.map_err(|source| DataError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let before = values.len();
        for field in record.iter().filter(|f| !f.is_empty()) {
            let value = parse_text_value(field).ok_or_else(|| DataError::InvalidValue {
                path: path.to_path_buf(),
                value: field.to_string(),
            })?;
            values.push(value);
        }
        let found = values.len() - before;
        if found == 0 {
            continue;
        }
        match width {
            Some(expected) if expected != found => {
                return Err(DataError::RaggedRows {
                    path: path.to_path_buf(),
                    row: rows,
                    expected,
                    found,
                });
            }
            _ => width = Some(found),
        }
        rows += 1;
    }
    let cols = width.unwrap_or(0);
    Array2::from_shape_vec((rows, cols), values).map_err(|e| DataError::InvalidValue {
        path: path.to_path_buf(),
        value: e.to_string(),
    })
}

fn save_txt(path: &Path, labels: ArrayView2<u8>) -> Result<(), DataError> {
    let csv_error = |source| DataError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .from_path(path)
        .map_err(csv_error)?;
    for row in labels.rows() {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .map_err(csv_error)?;
    }
    writer.flush().map_err(io_error(path))
}

// ========================================================================================
//                                         VCF
// ========================================================================================

/// Opens a VCF body; BGZF and plain gzip are both decoded for `.gz`/`.bgz`.
fn open_vcf(path: &Path) -> Result<vcf::io::Reader<Box<dyn BufRead>>, DataError> {
    let compressed = path
        .extension()
        .is_some_and(|ext| ext == "gz" || ext == "bgz");
    let inner: Box<dyn BufRead> = if compressed {
        let mut magic = [0u8; 4];
        let mut head = File::open(path).map_err(io_error(path))?;
        let is_bgzf = head.read_exact(&mut magic).is_ok() && magic == BGZF_MAGIC;
        let file = File::open(path).map_err(io_error(path))?;
        if is_bgzf {
            Box::new(BgzfReader::new(file))
        } else {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        }
    } else {
        Box::new(BufReader::new(File::open(path).map_err(io_error(path))?))
    };
    Ok(vcf::io::Reader::new(inner))
}

/// Maps one called allele to a label; `None` for indices that collide with
/// the missing marker.
fn allele_label(allele: &Allele) -> Option<u8> {
    match allele.position() {
        None => Some(MISSING_LABEL),
        Some(position) => u8::try_from(position).ok().filter(|&v| v != MISSING_LABEL),
    }
}

/// Reads the GT field of every sample; each sample contributes two adjacent
/// rows holding its first and second allele.
fn load_vcf(path: &Path) -> Result<Array2<u8>, DataError> {
    let mut reader = open_vcf(path)?;
    let vcf_error = |record: usize, message: String| DataError::InvalidVcf {
        path: path.to_path_buf(),
        record,
        message,
    };
    let header = reader
        .read_header()
        .map_err(|e| vcf_error(0, format!("unreadable header: {e}")))?;
    let samples = header.sample_names().len();

    let mut record = RecordBuf::default();
    let mut variants: Vec<Vec<u8>> = Vec::new();
    loop {
        let index = variants.len() + 1;
        let bytes = reader
            .read_record_buf(&header, &mut record)
            .map_err(|e| vcf_error(index, e.to_string()))?;
        if bytes == 0 {
            break;
        }
        let series = record.samples();
        let gt = series
            .select(key::GENOTYPE)
            .ok_or_else(|| vcf_error(index, "FORMAT has no GT key".into()))?;

        let mut alleles = Vec::with_capacity(2 * samples);
        for sample in 0..samples {
            let parsed;
            let called: &[Allele] = match gt.get(sample) {
                Some(Some(Value::Genotype(genotype))) => genotype.as_ref(),
                Some(Some(Value::String(text))) => {
                    parsed = SampleGenotype::from_str(text)
                        .map_err(|e| vcf_error(index, format!("genotype '{text}': {e}")))?;
                    parsed.as_ref()
                }
                Some(Some(_)) => {
                    return Err(vcf_error(index, "GT is not a genotype value".into()));
                }
                Some(None) | None => &[],
            };
            for slot in 0..2 {
                let label = match called.get(slot) {
                    Some(allele) => allele_label(allele).ok_or_else(|| {
                        vcf_error(
                            index,
                            format!("allele {:?} is not an index below 255", allele.position()),
                        )
                    })?,
                    None => MISSING_LABEL,
                };
                alleles.push(label);
            }
        }
        variants.push(alleles);
    }
    debug!("{}: {samples} samples, {} records", path.display(), variants.len());

    Ok(Array2::from_shape_fn((2 * samples, variants.len()), |(r, j)| {
        variants[j][r]
    }))
}
