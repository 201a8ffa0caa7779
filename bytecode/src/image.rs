//! Bytecode image files.
//!
//! ```text
//! magic          8 bytes   "Caribou!"
//! version        u8        FORMAT_VERSION
//! custom_size    u32 le    size of the custom region below (0 = none)
//! custom region  custom_size bytes, the constant pool
//! code           raw instruction bytes up to EOF
//! ```
//!
//! All multi-byte fields are little-endian regardless of the host.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const IMAGE_MAGIC: &[u8; 8] = b"Caribou!";
pub const FORMAT_VERSION: u8 = 0;
/// Magic, version and custom size.
pub const HEADER_SIZE: usize = 8 + 1 + 4;

const TAG_NIL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INTEGER: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_SYMBOL: u8 = 5;
const TAG_METHOD: u8 = 6;
const TAG_OBJECT: u8 = 7;
/// Scope index of a method constant without a scope.
const NO_SCOPE: u16 = u16::MAX;

/// A constant pool entry as stored in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    String(String),
    Symbol(String),
    Method {
        name: String,
        args: u8,
        locals: u8,
        entry: u32,
        /// Index of an earlier constant the method closes over.
        scope: Option<u16>,
    },
    /// An object literal. Slot values are indices of earlier constants.
    Object { slots: Vec<(String, u16)> },
}

/// A loaded (or to-be-written) program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub version: u8,
    pub constants: Vec<Constant>,
    pub code: Vec<u8>,
}

#[derive(Debug)]
pub enum ImageError {
    Io(io::Error),
    BadMagic([u8; 8]),
    UnsupportedVersion(u8),
    /// The header or the constant pool ends early.
    Truncated,
    BadConstantTag(u8),
    /// An object slot or a method scope refers to itself or a later constant.
    ForwardReference { constant: usize, slot: u16 },
    InvalidUtf8,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "i/o error: {err}"),
            Self::BadMagic(magic) => {
                write!(f, "invalid file format (magic {:?})", String::from_utf8_lossy(magic))
            }
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported image version {version}")
            }
            Self::Truncated => write!(f, "truncated image header"),
            Self::BadConstantTag(tag) => write!(f, "invalid constant tag {tag}"),
            Self::ForwardReference { constant, slot } => write!(
                f,
                "constant {constant} refers to constant {slot} which is not defined before it"
            ),
            Self::InvalidUtf8 => write!(f, "invalid utf-8 in constant pool"),
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }
}

impl Image {
    pub fn new(code: Vec<u8>, constants: Vec<Constant>) -> Self {
        Self {
            version: FORMAT_VERSION,
            constants,
            code,
        }
    }

    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        let pool = if self.constants.is_empty() {
            Vec::new()
        } else {
            let mut pool = Vec::new();
            write_constants(&mut pool, &self.constants)?;
            pool
        };

        w.write_all(IMAGE_MAGIC)?;
        write_u8(w, self.version)?;
        write_u32(w, checked_len(pool.len(), "constant pool")?)?;
        w.write_all(&pool)?;
        w.write_all(&self.code)
    }

    pub fn read_from(r: &mut dyn Read) -> Result<Self, ImageError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != IMAGE_MAGIC {
            return Err(ImageError::BadMagic(magic));
        }

        let version = read_u8(r)?;
        if version != FORMAT_VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }

        let custom_size = read_u32(r)? as usize;
        let constants = if custom_size == 0 {
            Vec::new()
        } else {
            let mut pool = Vec::new();
            r.take(custom_size as u64).read_to_end(&mut pool)?;
            if pool.len() != custom_size {
                return Err(ImageError::Truncated);
            }
            read_constants(&mut pool.as_slice())?
        };

        let mut code = Vec::new();
        r.read_to_end(&mut code)?;

        Ok(Self {
            version,
            constants,
            code,
        })
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.code.len());
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, ImageError> {
        Self::read_from(&mut bytes)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()
    }

    pub fn load(path: &Path) -> Result<Self, ImageError> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }
}

fn write_constants(w: &mut dyn Write, constants: &[Constant]) -> io::Result<()> {
    write_u32(w, checked_len(constants.len(), "constant count")?)?;
    for constant in constants {
        match constant {
            Constant::Nil => write_u8(w, TAG_NIL)?,
            Constant::Boolean(false) => write_u8(w, TAG_FALSE)?,
            Constant::Boolean(true) => write_u8(w, TAG_TRUE)?,
            Constant::Integer(value) => {
                write_u8(w, TAG_INTEGER)?;
                w.write_all(&value.to_le_bytes())?;
            }
            Constant::String(value) => {
                write_u8(w, TAG_STRING)?;
                write_string(w, value)?;
            }
            Constant::Symbol(name) => {
                write_u8(w, TAG_SYMBOL)?;
                write_string(w, name)?;
            }
            Constant::Method {
                name,
                args,
                locals,
                entry,
                scope,
            } => {
                if *scope == Some(NO_SCOPE) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("method scope index {NO_SCOPE} is reserved"),
                    ));
                }
                write_u8(w, TAG_METHOD)?;
                write_string(w, name)?;
                write_u8(w, *args)?;
                write_u8(w, *locals)?;
                write_u32(w, *entry)?;
                write_u16(w, scope.unwrap_or(NO_SCOPE))?;
            }
            Constant::Object { slots } => {
                write_u8(w, TAG_OBJECT)?;
                write_u16(w, checked_len(slots.len(), "object slot count")?)?;
                for (name, idx) in slots {
                    write_string(w, name)?;
                    write_u16(w, *idx)?;
                }
            }
        }
    }
    Ok(())
}

fn read_constants(r: &mut dyn Read) -> Result<Vec<Constant>, ImageError> {
    let count = read_u32(r)? as usize;
    let mut constants = Vec::with_capacity(count.min(1024));
    for index in 0..count {
        let constant = match read_u8(r)? {
            TAG_NIL => Constant::Nil,
            TAG_FALSE => Constant::Boolean(false),
            TAG_TRUE => Constant::Boolean(true),
            TAG_INTEGER => {
                let mut b = [0u8; 8];
                r.read_exact(&mut b)?;
                Constant::Integer(i64::from_le_bytes(b))
            }
            TAG_STRING => Constant::String(read_string(r)?),
            TAG_SYMBOL => Constant::Symbol(read_string(r)?),
            TAG_METHOD => {
                let name = read_string(r)?;
                let args = read_u8(r)?;
                let locals = read_u8(r)?;
                let entry = read_u32(r)?;
                let scope = match read_u16(r)? {
                    NO_SCOPE => None,
                    slot if slot as usize >= index => {
                        return Err(ImageError::ForwardReference {
                            constant: index,
                            slot,
                        });
                    }
                    slot => Some(slot),
                };
                Constant::Method {
                    name,
                    args,
                    locals,
                    entry,
                    scope,
                }
            }
            TAG_OBJECT => {
                let slot_count = read_u16(r)?;
                let mut slots = Vec::with_capacity(slot_count as usize);
                for _ in 0..slot_count {
                    let name = read_string(r)?;
                    let slot = read_u16(r)?;
                    if slot as usize >= index {
                        return Err(ImageError::ForwardReference {
                            constant: index,
                            slot,
                        });
                    }
                    slots.push((name, slot));
                }
                Constant::Object { slots }
            }
            tag => return Err(ImageError::BadConstantTag(tag)),
        };
        constants.push(constant);
    }
    Ok(constants)
}

fn checked_len<T: TryFrom<usize>>(len: usize, what: &str) -> io::Result<T> {
    T::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{what} of {len} does not fit the image format"),
        )
    })
}

fn write_u8(w: &mut dyn Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn read_u8(r: &mut dyn Read) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn write_u16(w: &mut dyn Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u16(r: &mut dyn Read) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn write_string(w: &mut dyn Write, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    write_u32(w, checked_len(bytes.len(), "string length")?)?;
    w.write_all(bytes)
}

fn read_string(r: &mut dyn Read) -> Result<String, ImageError> {
    let len = read_u32(r)? as usize;
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(ImageError::Truncated);
    }
    String::from_utf8(buf).map_err(|_| ImageError::InvalidUtf8)
}
